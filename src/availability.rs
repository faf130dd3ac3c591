//! Real-time availability coordination.
//!
//! Fans out a short prompt to every contactable candidate, polls the K/V
//! probe records the provider-side ingress updates, and returns the
//! acceptors in the order their acceptance was first observed. The whole
//! run is bounded by a wall-clock deadline and cancels cooperatively when
//! the surrounding conversation resets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::kv::{self, KvError, KvStore};
use crate::messages;
use crate::search::ProviderSummary;
use crate::text::squash_phone;
use crate::transport::Transport;

/// Process-wide suffix guaranteeing `req_id` uniqueness within one
/// millisecond.
static REQ_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Probe status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// Sent, no reply yet.
    Pending,
    /// Provider accepted the request.
    Accepted,
    /// Provider declined.
    Rejected,
    /// The transport send failed.
    FailedToSend,
}

/// A probe record under `availability:request:<req_id>:provider:<phone>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRecord {
    /// Request id this probe belongs to.
    pub req_id: String,
    /// Six-character short id echoed to the provider.
    pub code: String,
    /// Normalized provider phone.
    pub provider_phone: String,
    /// Provider row id.
    #[serde(default)]
    pub provider_id: Option<String>,
    /// Provider display name.
    #[serde(default)]
    pub provider_name: Option<String>,
    /// Service being requested.
    pub service: String,
    /// City, when known.
    #[serde(default)]
    pub city: Option<String>,
    /// Current status.
    pub status: ProbeStatus,
    /// When the probe was dispatched (ISO-8601).
    pub requested_at: String,
    /// When the provider answered, set by the response ingress.
    #[serde(default)]
    pub responded_at: Option<String>,
}

/// One provider's final response within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResponse {
    /// Provider row id.
    pub provider_id: Option<String>,
    /// Normalized provider phone.
    pub provider_phone: String,
    /// Final status observed.
    pub status: ProbeStatus,
    /// Response timestamp, when the ingress recorded one.
    pub responded_at: Option<String>,
}

/// Result of one coordination run.
#[derive(Debug, Default)]
pub struct AvailabilityOutcome {
    /// Acceptors in the order their acceptance was observed.
    pub accepted: Vec<ProviderSummary>,
    /// Every non-pending response observed before the deadline.
    pub responded: Vec<ProbeResponse>,
    /// Whether the deadline expired with probes still pending.
    pub timed_out: bool,
}

fn request_key(req_id: &str, phone: &str) -> String {
    format!("availability:request:{req_id}:provider:{phone}")
}

fn pending_key(phone: &str) -> String {
    format!("availability:provider:{phone}:pending")
}

/// Derive the six-character echo code from a request id.
fn short_code(req_id: &str) -> String {
    let alnum: String = req_id.chars().filter(char::is_ascii_alphanumeric).collect();
    if alnum.is_empty() {
        return "000000".to_owned();
    }
    let start = alnum.chars().count().saturating_sub(6);
    alnum.chars().skip(start).flat_map(char::to_uppercase).collect()
}

/// Coordinator over the K/V probe records and the messaging transport.
pub struct AvailabilityCoordinator {
    kv: Arc<dyn KvStore>,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    ttl: Duration,
    poll_interval: Duration,
}

impl AvailabilityCoordinator {
    /// Create a coordinator.
    ///
    /// `timeout` bounds the wait for responses, `ttl` bounds probe record
    /// lifetime, `poll_interval` paces the response polling.
    pub fn new(
        kv: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
        timeout: Duration,
        ttl: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            kv,
            transport,
            timeout,
            ttl,
            poll_interval,
        }
    }

    /// Probe `candidates` and wait for responses until the deadline.
    ///
    /// Candidates without a contactable phone are skipped. A failed send
    /// marks that probe `failed_to_send` and the run continues. An empty
    /// candidate set returns immediately without touching the transport.
    pub async fn request_and_wait(
        &self,
        req_id_seed: &str,
        service: &str,
        city: Option<&str>,
        candidates: &[ProviderSummary],
        cancel: &CancellationToken,
    ) -> Result<AvailabilityOutcome, KvError> {
        let req_id = make_req_id(req_id_seed);
        let code = short_code(&req_id);

        // Index candidates by normalized phone, preserving order.
        let mut indexed: Vec<(String, ProviderSummary)> = Vec::new();
        for candidate in candidates {
            let Some(raw_phone) = candidate.contact_phone() else {
                debug!(provider = %candidate.id, "candidate without contactable phone skipped");
                continue;
            };
            let phone = squash_phone(raw_phone);
            if phone.is_empty() || indexed.iter().any(|(p, _)| *p == phone) {
                continue;
            }
            indexed.push((phone, candidate.clone()));
        }

        if indexed.is_empty() {
            debug!(req_id, "no contactable candidates, skipping availability run");
            return Ok(AvailabilityOutcome::default());
        }

        info!(
            req_id,
            service,
            city = city.unwrap_or("-"),
            candidates = indexed.len(),
            "availability fan-out starting"
        );

        self.dispatch(&req_id, &code, service, city, &indexed).await?;
        let outcome = self.wait(&req_id, &indexed, cancel).await?;

        // Deterministically unlink this req_id from every provider's
        // pending list, deadline or not.
        for (phone, _) in &indexed {
            self.remove_pending(&req_id, phone).await?;
        }
        info!(
            req_id,
            accepted = outcome.accepted.len(),
            responded = outcome.responded.len(),
            timed_out = outcome.timed_out,
            "availability run finished"
        );
        Ok(outcome)
    }

    async fn dispatch(
        &self,
        req_id: &str,
        code: &str,
        service: &str,
        city: Option<&str>,
        indexed: &[(String, ProviderSummary)],
    ) -> Result<(), KvError> {
        let now = Utc::now().to_rfc3339();

        for (phone, candidate) in indexed {
            let mut probe = ProbeRecord {
                req_id: req_id.to_owned(),
                code: code.to_owned(),
                provider_phone: phone.clone(),
                provider_id: Some(candidate.id.clone()),
                provider_name: Some(candidate.full_name.clone()),
                service: service.to_owned(),
                city: city.map(str::to_owned),
                status: ProbeStatus::Pending,
                requested_at: now.clone(),
                responded_at: None,
            };
            kv::set_record(
                self.kv.as_ref(),
                &request_key(req_id, phone),
                &probe,
                Some(self.ttl),
            )
            .await?;

            self.append_pending(req_id, phone).await?;

            let text = messages::availability_probe(
                candidate.full_name.trim(),
                service,
                city,
                code,
            );
            if let Err(e) = self.transport.send_text(phone, &text).await {
                warn!(phone, req_id, error = %e, "availability probe send failed");
                probe.status = ProbeStatus::FailedToSend;
                kv::set_record(
                    self.kv.as_ref(),
                    &request_key(req_id, phone),
                    &probe,
                    Some(self.ttl),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn wait(
        &self,
        req_id: &str,
        indexed: &[(String, ProviderSummary)],
        cancel: &CancellationToken,
    ) -> Result<AvailabilityOutcome, KvError> {
        let mut outcome = AvailabilityOutcome::default();
        let mut pending: Vec<String> = indexed.iter().map(|(phone, _)| phone.clone()).collect();
        let deadline = Instant::now()
            .checked_add(self.timeout)
            .unwrap_or_else(Instant::now);

        while !pending.is_empty() && Instant::now() < deadline {
            let mut still_pending = Vec::with_capacity(pending.len());
            for phone in pending {
                let probe: Option<ProbeRecord> =
                    kv::get_record(self.kv.as_ref(), &request_key(req_id, &phone)).await?;

                let Some(probe) = probe else {
                    // Record vanished (TTL or external cleanup): stop
                    // waiting on this provider.
                    continue;
                };

                match probe.status {
                    ProbeStatus::Pending => still_pending.push(phone),
                    status => {
                        outcome.responded.push(ProbeResponse {
                            provider_id: probe.provider_id.clone(),
                            provider_phone: phone.clone(),
                            status,
                            responded_at: probe.responded_at.clone(),
                        });
                        if status == ProbeStatus::Accepted {
                            if let Some((_, candidate)) =
                                indexed.iter().find(|(p, _)| *p == phone)
                            {
                                outcome.accepted.push(candidate.clone());
                            }
                        }
                    }
                }
            }
            pending = still_pending;

            if pending.is_empty() {
                break;
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    info!(req_id, pending = pending.len(), "availability wait cancelled");
                    break;
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        outcome.timed_out = !pending.is_empty();
        Ok(outcome)
    }

    async fn append_pending(&self, req_id: &str, phone: &str) -> Result<(), KvError> {
        let key = pending_key(phone);
        let mut list: Vec<String> = kv::get_record(self.kv.as_ref(), &key)
            .await?
            .unwrap_or_default();
        if !list.iter().any(|rid| rid == req_id) {
            list.push(req_id.to_owned());
        }
        kv::set_record(self.kv.as_ref(), &key, &list, Some(self.ttl)).await
    }

    async fn remove_pending(&self, req_id: &str, phone: &str) -> Result<(), KvError> {
        let key = pending_key(phone);
        let list: Vec<String> = kv::get_record(self.kv.as_ref(), &key)
            .await?
            .unwrap_or_default();
        let remaining: Vec<String> = list.into_iter().filter(|rid| rid != req_id).collect();
        kv::set_record(self.kv.as_ref(), &key, &remaining, Some(self.ttl)).await
    }
}

/// Build a globally unique request id from a seed.
fn make_req_id(seed: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let counter = REQ_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{seed}-{millis}-{counter}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use crate::transport::{GatewayError, OutboundMessage};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tokio::sync::Mutex;

    /// Transport fake recording sends; can fail for specific phones.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String)>>,
        failing: HashSet<String>,
    }

    impl RecordingTransport {
        fn failing_for(phones: &[&str]) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                failing: phones.iter().map(|p| (*p).to_owned()).collect(),
            }
        }

        async fn sent_to(&self) -> Vec<String> {
            self.sent.lock().await.iter().map(|(to, _)| to.clone()).collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, to: &str, message: &OutboundMessage) -> Result<(), GatewayError> {
            if self.failing.contains(to) {
                return Err(GatewayError::Rejected(500));
            }
            self.sent
                .lock()
                .await
                .push((to.to_owned(), message.response.clone()));
            Ok(())
        }
    }

    fn candidate(id: &str, phone: Option<&str>, real: Option<&str>) -> ProviderSummary {
        ProviderSummary {
            id: id.to_owned(),
            phone: phone.map(str::to_owned),
            real_phone: real.map(str::to_owned),
            full_name: format!("Proveedor {id}"),
            ..ProviderSummary::default()
        }
    }

    fn coordinator(
        kv: Arc<MemoryKv>,
        transport: Arc<RecordingTransport>,
    ) -> AvailabilityCoordinator {
        AvailabilityCoordinator::new(
            kv,
            transport,
            Duration::from_secs(45),
            Duration::from_secs(120),
            Duration::from_secs(1),
        )
    }

    /// Flip a probe's status as the provider-side ingress would.
    async fn answer(kv: &MemoryKv, phone: &str, status: ProbeStatus) {
        // Probe keys embed the run's req_id, so scan for the phone suffix.
        let req_id = {
            let list: Vec<String> =
                kv::get_record(kv, &pending_key(phone)).await.expect("get").unwrap_or_default();
            list.first().cloned().expect("pending req_id")
        };
        let key = request_key(&req_id, phone);
        let mut probe: ProbeRecord = kv::get_record(kv, &key).await.expect("get").expect("probe");
        probe.status = status;
        probe.responded_at = Some(Utc::now().to_rfc3339());
        kv::set_record(kv, &key, &probe, None).await.expect("set");
    }

    #[test]
    fn test_short_code_derivation() {
        assert_eq!(short_code("req-abc-1712345678901-7"), "789017");
        assert_eq!(short_code("wamid.x-42"), "MIDX42");
        assert_eq!(short_code(""), "000000");
        assert_eq!(short_code("---"), "000000");
        assert_eq!(short_code("ab"), "AB");
    }

    #[test]
    fn test_req_ids_are_unique() {
        let a = make_req_id("seed");
        let b = make_req_id("seed");
        assert_ne!(a, b);
        assert!(a.starts_with("seed-"));
    }

    #[tokio::test]
    async fn test_empty_candidates_return_without_sends() {
        let kv = Arc::new(MemoryKv::new());
        let transport = Arc::new(RecordingTransport::default());
        let coordinator = coordinator(Arc::clone(&kv), Arc::clone(&transport));

        let outcome = coordinator
            .request_and_wait("req", "plomero", Some("Quito"), &[], &CancellationToken::new())
            .await
            .expect("run");

        assert!(outcome.accepted.is_empty());
        assert!(outcome.responded.is_empty());
        assert!(!outcome.timed_out);
        assert!(transport.sent_to().await.is_empty());
        assert!(kv.is_empty().await);
    }

    #[tokio::test]
    async fn test_uncontactable_candidates_are_skipped() {
        let kv = Arc::new(MemoryKv::new());
        let transport = Arc::new(RecordingTransport::default());
        let coordinator = AvailabilityCoordinator::new(
            Arc::clone(&kv) as Arc<dyn KvStore>,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Duration::from_millis(50),
            Duration::from_secs(120),
            Duration::from_millis(10),
        );

        let candidates = [
            candidate("p1", None, None),
            candidate("p2", Some("+5932@c.us"), None),
        ];
        let outcome = coordinator
            .request_and_wait("req", "plomero", None, &candidates, &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(transport.sent_to().await, vec!["+5932".to_owned()]);
        assert!(outcome.timed_out, "p2 never answered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acceptance_arrival_order_wins_over_rating() {
        let kv = Arc::new(MemoryKv::new());
        let transport = Arc::new(RecordingTransport::default());
        let coordinator = coordinator(Arc::clone(&kv), Arc::clone(&transport));

        let mut p2 = candidate("p2", None, Some("+5932"));
        p2.rating = 4.5;
        let mut p3 = candidate("p3", None, Some("+5933"));
        p3.rating = 4.8;
        let candidates = [p3, p2];

        let run = {
            let cancel = CancellationToken::new();
            let kv_inner = Arc::clone(&kv);
            async move {
                // p2 accepts first even though p3 outranks it.
                let responder = async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    answer(&kv_inner, "+5932", ProbeStatus::Accepted).await;
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    answer(&kv_inner, "+5933", ProbeStatus::Accepted).await;
                };
                let (outcome, ()) = tokio::join!(
                    coordinator.request_and_wait(
                        "req",
                        "plomero",
                        Some("Quito"),
                        &candidates,
                        &cancel
                    ),
                    responder
                );
                outcome.expect("run")
            }
        };
        let outcome = run.await;

        let order: Vec<&str> = outcome.accepted.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(order, vec!["p2", "p3"]);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.responded.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_returns_partial_results() {
        let kv = Arc::new(MemoryKv::new());
        let transport = Arc::new(RecordingTransport::default());
        let coordinator = coordinator(Arc::clone(&kv), Arc::clone(&transport));

        let candidates = [
            candidate("p1", None, Some("+5931")),
            candidate("p2", None, Some("+5932")),
        ];

        let cancel = CancellationToken::new();
        let kv_inner = Arc::clone(&kv);
        let responder = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            answer(&kv_inner, "+5931", ProbeStatus::Rejected).await;
            // p2 never answers; the run must end at the 45 s deadline.
        };
        let (outcome, ()) = tokio::join!(
            coordinator.request_and_wait("req", "plomero", None, &candidates, &cancel),
            responder
        );
        let outcome = outcome.expect("run");

        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.responded.len(), 1);
        assert_eq!(outcome.responded[0].status, ProbeStatus::Rejected);
        assert!(outcome.timed_out);

        // Pending lists are cleaned for both providers.
        for phone in ["+5931", "+5932"] {
            let list: Vec<String> = kv::get_record(kv.as_ref(), &pending_key(phone))
                .await
                .expect("get")
                .unwrap_or_default();
            assert!(list.is_empty(), "pending list for {phone} not cleaned");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_marks_probe_and_continues() {
        let kv = Arc::new(MemoryKv::new());
        let transport = Arc::new(RecordingTransport::failing_for(&["+5931"]));
        let coordinator = coordinator(Arc::clone(&kv), Arc::clone(&transport));

        let candidates = [
            candidate("p1", None, Some("+5931")),
            candidate("p2", None, Some("+5932")),
        ];

        let cancel = CancellationToken::new();
        let kv_inner = Arc::clone(&kv);
        let responder = async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            answer(&kv_inner, "+5932", ProbeStatus::Accepted).await;
        };
        let (outcome, ()) = tokio::join!(
            coordinator.request_and_wait("req", "plomero", None, &candidates, &cancel),
            responder
        );
        let outcome = outcome.expect("run");

        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].id, "p2");
        assert!(outcome
            .responded
            .iter()
            .any(|r| r.provider_phone == "+5931" && r.status == ProbeStatus::FailedToSend));
        assert!(!outcome.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let kv = Arc::new(MemoryKv::new());
        let transport = Arc::new(RecordingTransport::default());
        let coordinator = coordinator(Arc::clone(&kv), Arc::clone(&transport));

        let candidates = [candidate("p1", None, Some("+5931"))];
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                cancel.cancel();
            }
        };
        let started = Instant::now();
        let (outcome, ()) = tokio::join!(
            coordinator.request_and_wait("req", "plomero", None, &candidates, &cancel),
            canceller
        );
        let outcome = outcome.expect("run");

        assert!(outcome.accepted.is_empty());
        assert!(outcome.timed_out);
        // Cancelled well before the 45 s deadline.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_phones_probe_once() {
        let kv = Arc::new(MemoryKv::new());
        let transport = Arc::new(RecordingTransport::default());
        let coordinator = AvailabilityCoordinator::new(
            Arc::clone(&kv) as Arc<dyn KvStore>,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Duration::from_secs(1),
            Duration::from_secs(120),
            Duration::from_millis(100),
        );

        let candidates = [
            candidate("p1", Some("+5931@c.us"), None),
            candidate("p1-dup", None, Some("+5931")),
        ];
        coordinator
            .request_and_wait("req", "plomero", None, &candidates, &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(transport.sent_to().await, vec!["+5931".to_owned()]);
    }
}
