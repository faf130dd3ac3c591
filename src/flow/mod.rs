//! Conversation flow: per-phone dialog state and validated transitions.
//!
//! The flow record is the single mutable document of a conversation,
//! stored as JSON in the K/V under `flow:<phone>`. Loading is tolerant:
//! missing fields default and unknown state strings collapse to
//! `AwaitingService`, so legacy entries never poison a conversation.

pub mod repository;

use serde::{Deserialize, Deserializer, Serialize};

use crate::search::ProviderSummary;

/// Errors from flow state handling.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// A handler asked for a transition the state machine forbids.
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// State the flow was in.
        from: FlowState,
        /// State the handler requested.
        to: FlowState,
    },
}

/// Dialog states of the customer conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// Waiting for the data-sharing consent reply.
    AwaitingConsent,
    /// Waiting for the service need description.
    AwaitingService,
    /// A service candidate was detected and awaits confirmation.
    ConfirmService,
    /// Waiting for the serving city.
    AwaitingCity,
    /// Background search and availability probing in progress.
    Searching,
    /// Presenting the accepted provider list.
    PresentingResults,
    /// Showing one provider's detail card.
    ViewingProviderDetail,
    /// Asking whether to run another search.
    ConfirmNewSearch,
    /// Recovery state after an invariant violation.
    Error,
}

impl FlowState {
    /// States reachable from `self`. Staying in place is always allowed.
    pub fn allowed_transitions(self) -> &'static [FlowState] {
        use FlowState::*;
        match self {
            AwaitingConsent => &[AwaitingService, AwaitingCity],
            AwaitingService => &[ConfirmService, AwaitingCity, Searching, Error],
            ConfirmService => &[AwaitingService, AwaitingCity, Searching],
            AwaitingCity => &[Searching, AwaitingService],
            Searching => &[PresentingResults, ConfirmNewSearch, AwaitingService, Error],
            PresentingResults => &[ViewingProviderDetail, ConfirmNewSearch, AwaitingService],
            ViewingProviderDetail => &[PresentingResults, ConfirmNewSearch, AwaitingService],
            ConfirmNewSearch => &[AwaitingCity, AwaitingService],
            Error => &[AwaitingService],
        }
    }

    /// Whether moving to `to` is permitted.
    pub fn can_transition(self, to: FlowState) -> bool {
        self == to || self.allowed_transitions().contains(&to)
    }
}

fn default_state() -> FlowState {
    FlowState::AwaitingService
}

/// Tolerant state deserializer: unknown strings collapse to
/// `AwaitingService` instead of failing the whole record.
fn lenient_state<'de, D>(deserializer: D) -> Result<FlowState, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(serde_json::from_value(serde_json::Value::String(raw))
        .unwrap_or(FlowState::AwaitingService))
}

/// Per-phone conversation flow record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationFlow {
    /// Phone this flow belongs to.
    #[serde(default)]
    pub phone: String,
    /// Current dialog state.
    #[serde(default = "default_state", deserialize_with = "lenient_state")]
    pub state: FlowState,
    /// Confirmed canonical profession.
    #[serde(default)]
    pub service: Option<String>,
    /// Detected profession pending confirmation.
    #[serde(default)]
    pub service_candidate: Option<String>,
    /// Verbatim user description of the need.
    #[serde(default)]
    pub service_full: Option<String>,
    /// Canonical city.
    #[serde(default)]
    pub city: Option<String>,
    /// Whether the city has been confirmed this or a prior session.
    #[serde(default)]
    pub city_confirmed: bool,
    /// Providers shown to the user, in presentation order.
    #[serde(default)]
    pub providers: Vec<ProviderSummary>,
    /// Index into `providers` while viewing a detail card.
    #[serde(default)]
    pub provider_detail_idx: Option<usize>,
    /// The provider the customer selected.
    #[serde(default)]
    pub chosen_provider: Option<ProviderSummary>,
    /// Consent flag mirrored from the customer record.
    #[serde(default)]
    pub has_consent: bool,
    /// Customer row id, once known.
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Timestamp of the current turn (ISO-8601), set after dispatch.
    #[serde(default)]
    pub last_seen_at: Option<String>,
    /// Timestamp of the previous turn; drives the inactivity timeout.
    #[serde(default)]
    pub last_seen_at_prev: Option<String>,
    /// Guards against stale service context captured before consent.
    #[serde(default)]
    pub service_captured_after_consent: bool,
    /// Guards against duplicate background search dispatch.
    #[serde(default)]
    pub searching_dispatched: bool,
    /// Invalid replies seen in the confirm-new-search menu.
    #[serde(default)]
    pub confirm_attempts: u32,
    /// Whether the confirm-new-search menu offers the city option.
    #[serde(default)]
    pub confirm_include_city_option: bool,
    /// Id of the last processed inbound message (idempotency hint).
    #[serde(default)]
    pub last_message_id: Option<String>,
}

impl ConversationFlow {
    /// Fresh flow for `phone` in the initial state.
    pub fn new(phone: &str) -> Self {
        Self {
            phone: phone.to_owned(),
            state: FlowState::AwaitingService,
            service: None,
            service_candidate: None,
            service_full: None,
            city: None,
            city_confirmed: false,
            providers: Vec::new(),
            provider_detail_idx: None,
            chosen_provider: None,
            has_consent: false,
            customer_id: None,
            last_seen_at: None,
            last_seen_at_prev: None,
            service_captured_after_consent: false,
            searching_dispatched: false,
            confirm_attempts: 0,
            confirm_include_city_option: false,
            last_message_id: None,
        }
    }

    /// Move to `to`, validating against the transition table.
    pub fn transition(&mut self, to: FlowState) -> Result<(), FlowError> {
        if !self.state.can_transition(to) {
            return Err(FlowError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Clear service context captured before consent or a reset.
    pub fn clear_service_context(&mut self) {
        self.service = None;
        self.service_candidate = None;
        self.service_full = None;
        self.providers.clear();
        self.provider_detail_idx = None;
        self.chosen_provider = None;
        self.searching_dispatched = false;
        self.confirm_attempts = 0;
        self.service_captured_after_consent = false;
    }

    /// Validate the state/field invariants.
    ///
    /// Searching requires a confirmed service; a detail view requires an
    /// in-range index; every post-consent state requires the consent flag.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.state == FlowState::Searching
            && self.service.as_deref().is_none_or(|s| s.trim().is_empty())
        {
            return Err("state searching without a confirmed service".to_owned());
        }
        if self.state == FlowState::ViewingProviderDetail {
            match self.provider_detail_idx {
                Some(idx) if idx < self.providers.len() => {}
                _ => return Err("detail view without an in-range provider index".to_owned()),
            }
        }
        if self.state != FlowState::AwaitingConsent && !self.has_consent {
            return Err("post-consent state without the consent flag".to_owned());
        }
        Ok(())
    }
}
