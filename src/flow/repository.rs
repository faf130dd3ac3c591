//! Flow persistence in the K/V store.
//!
//! One JSON document per phone under `flow:<phone>`. Every store refreshes
//! the TTL; a corrupt document loads as a fresh flow rather than failing
//! the turn.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::ConversationFlow;
use crate::kv::{self, KvError, KvStore};

fn flow_key(phone: &str) -> String {
    format!("flow:{phone}")
}

/// Repository over flow records.
#[derive(Clone)]
pub struct FlowRepository {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl FlowRepository {
    /// Create a repository writing flows with `ttl`.
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Load the flow for `phone`, or a fresh one when absent or corrupt.
    pub async fn load(&self, phone: &str) -> Result<ConversationFlow, KvError> {
        let key = flow_key(phone);
        match self.kv.get(&key).await? {
            Some(value) => match serde_json::from_value::<ConversationFlow>(value) {
                Ok(mut flow) => {
                    if flow.phone.is_empty() {
                        flow.phone = phone.to_owned();
                    }
                    Ok(flow)
                }
                Err(e) => {
                    warn!(phone, error = %e, "corrupt flow record, starting fresh");
                    Ok(ConversationFlow::new(phone))
                }
            },
            None => Ok(ConversationFlow::new(phone)),
        }
    }

    /// Overwrite the flow for `phone`, refreshing the TTL.
    pub async fn store(&self, phone: &str, flow: &ConversationFlow) -> Result<(), KvError> {
        debug!(phone, state = ?flow.state, "flow stored");
        kv::set_record(self.kv.as_ref(), &flow_key(phone), flow, Some(self.ttl)).await
    }

    /// Delete the flow for `phone`.
    pub async fn reset(&self, phone: &str) -> Result<(), KvError> {
        self.kv.delete(&flow_key(phone)).await
    }
}
