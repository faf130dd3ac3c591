//! Background search: provider lookup, availability fan-out and result
//! notification, detached from the inbound request.
//!
//! The customer already received the searching acknowledgement; this task
//! delivers the outcome as fresh outbound messages. It re-reads the flow
//! under the phone lock before writing so a turn that happened mid-search
//! is never clobbered, and it stops silently when the conversation was
//! reset (cancellation) or moved on.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Router;
use crate::flow::FlowState;
use crate::messages;
use crate::search::SearchQuery;
use crate::transport::OutboundMessage;

/// Providers presented to the customer at most.
const MAX_RESULTS: usize = 5;

pub(crate) async fn run_search(router: Arc<Router>, phone: String, cancel: CancellationToken) {
    let flow = match router.flows.load(&phone).await {
        Ok(flow) => flow,
        Err(e) => {
            warn!(phone, error = %e, "background search could not load flow");
            return;
        }
    };

    let Some(service) = flow.service.clone().filter(|s| !s.trim().is_empty()) else {
        warn!(phone, "background search dispatched without a service");
        return;
    };
    let Some(city) = flow.city.clone().filter(|c| !c.trim().is_empty()) else {
        warn!(phone, "background search dispatched without a city");
        return;
    };

    // Seeding with the inbound message id makes a redelivered trigger
    // produce the same probe id space.
    let seed = match &flow.last_message_id {
        Some(id) => format!("{phone}-{id}"),
        None => phone.clone(),
    };

    let candidates = match SearchQuery::new(&service, Some(&city), router.config.search_limit) {
        Ok(query) => match router.search.search(&query).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(phone, error = %e, "provider search failed, treating as empty");
                Vec::new()
            }
        },
        Err(e) => {
            warn!(phone, error = %e, "search inputs failed validation");
            Vec::new()
        }
    };

    let had_candidates = !candidates.is_empty();
    let accepted = if had_candidates {
        match router
            .availability
            .request_and_wait(&seed, &service, Some(&city), &candidates, &cancel)
            .await
        {
            Ok(outcome) => outcome.accepted,
            Err(e) => {
                warn!(phone, error = %e, "availability coordination failed");
                Vec::new()
            }
        }
    } else {
        info!(phone, service, city, "no candidates found in catalog");
        Vec::new()
    };

    if cancel.is_cancelled() {
        info!(phone, "background search cancelled, suppressing notification");
        return;
    }

    let final_providers: Vec<_> = accepted.into_iter().take(MAX_RESULTS).collect();

    // Final flow write happens under the phone lock, against a fresh
    // snapshot, so a concurrent turn is never overwritten.
    let guard = router.lock_phone(&phone).await;
    if cancel.is_cancelled() {
        return;
    }

    let mut fresh = match router.flows.load(&phone).await {
        Ok(fresh) => fresh,
        Err(e) => {
            warn!(phone, error = %e, "background search could not reload flow");
            return;
        }
    };
    if fresh.state != FlowState::Searching {
        info!(phone, state = ?fresh.state, "conversation moved on, dropping search result");
        router.clear_search_token(&phone).await;
        return;
    }

    fresh.searching_dispatched = false;
    let outbound = if final_providers.is_empty() {
        fresh.confirm_attempts = 0;
        fresh.confirm_include_city_option = true;
        if let Err(e) = fresh.transition(FlowState::ConfirmNewSearch) {
            warn!(phone, error = %e, "unexpected transition failure");
            return;
        }
        let body = if had_candidates {
            messages::no_availability(&service, &city)
        } else {
            messages::no_results(&city)
        };
        vec![
            OutboundMessage::text(body),
            OutboundMessage::text(messages::confirm_search_message(true)),
        ]
    } else {
        fresh.providers = final_providers;
        fresh.provider_detail_idx = None;
        if let Err(e) = fresh.transition(FlowState::PresentingResults) {
            warn!(phone, error = %e, "unexpected transition failure");
            return;
        }
        vec![OutboundMessage::text(messages::results_message(
            &city,
            &fresh.providers,
        ))]
    };

    if let Err(e) = router.flows.store(&phone, &fresh).await {
        warn!(phone, error = %e, "background search could not store flow");
        return;
    }
    router.clear_search_token(&phone).await;
    drop(guard);

    info!(
        phone,
        service,
        city,
        providers = fresh.providers.len(),
        "search finished, notifying customer"
    );
    for message in &outbound {
        if let Err(e) = router.transport.send(&phone, message).await {
            warn!(phone, error = %e, "failed to deliver search result message");
        }
        router
            .sessions
            .record(&phone, &message.response, true, serde_json::Value::Null)
            .await;
    }
}
