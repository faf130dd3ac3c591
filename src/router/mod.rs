//! Message router: pre-routing (consent, reset, inactivity), per-phone
//! serialization and state handler dispatch.
//!
//! One inbound payload becomes one ordered list of outbound messages.
//! Turns for the same phone are linearized by an advisory lock held from
//! flow read to flow write; the background search task takes the same
//! lock before its final write, so no two writers ever interleave.

mod background;
mod handlers;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::availability::AvailabilityCoordinator;
use crate::catalog::{self, ServiceCatalog};
use crate::consent::{self, ConsentReply, ConsentRepository};
use crate::customers::{Customer, CustomerRepository, StoreError};
use crate::flow::repository::FlowRepository;
use crate::flow::{ConversationFlow, FlowError, FlowState};
use crate::interpret::NeedInterpreter;
use crate::kv::KvError;
use crate::media::ObjectStore;
use crate::messages;
use crate::safety::ContentGate;
use crate::search::ProviderSearch;
use crate::sessions::SessionLog;
use crate::transport::{InboundPayload, OutboundMessage, Transport};

/// Keywords that restart the conversation from any state.
const RESET_KEYWORDS: &[&str] = &[
    "reiniciar", "reset", "restart", "start", "nuevo", "nueva", "empezar",
];

/// Greetings rejected as service descriptions.
const GREETINGS: &[&str] = &[
    "hola", "buenas", "buenos dias", "buenas tardes", "buenas noches", "hey", "hello", "hi",
    "saludos", "que tal", "alo",
];

/// Errors surfaced by the router.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The payload carried no sender phone.
    #[error("inbound payload missing from_number")]
    MissingSender,

    /// Relational store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// K/V store failure.
    #[error(transparent)]
    Kv(#[from] KvError),

    /// A handler attempted a forbidden transition.
    #[error(transparent)]
    Flow(#[from] FlowError),
}

/// Tunables the router reads per turn.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Inactivity window after which a conversation restarts.
    pub session_timeout: Duration,
    /// Invalid replies tolerated in the confirm-new-search menu.
    pub max_confirm_attempts: u32,
    /// Candidate cap for the provider search.
    pub search_limit: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(180),
            max_confirm_attempts: 2,
            search_limit: crate::search::DEFAULT_SEARCH_LIMIT,
        }
    }
}

/// Per-phone advisory locks.
#[derive(Default)]
struct PhoneLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PhoneLocks {
    async fn acquire(&self, phone: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            Arc::clone(map.entry(phone.to_owned()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Input handed to a state handler.
#[derive(Debug, Clone, Default)]
pub(crate) struct HandlerInput {
    /// Message text, trimmed.
    pub text: String,
    /// Quick-reply payload, when present.
    pub selected: Option<String>,
}

impl HandlerInput {
    /// The effective choice: the button payload when present, else text.
    pub fn choice(&self) -> &str {
        self.selected.as_deref().unwrap_or(self.text.as_str())
    }
}

/// A handler's reply: messages plus the background-search flag.
#[derive(Debug, Default)]
pub(crate) struct Reply {
    pub messages: Vec<OutboundMessage>,
    pub spawn_search: bool,
}

impl Reply {
    pub fn messages(messages: Vec<OutboundMessage>) -> Self {
        Self {
            messages,
            spawn_search: false,
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::messages(vec![OutboundMessage::text(body)])
    }
}

/// The conversational orchestrator.
pub struct Router {
    pub(crate) customers: CustomerRepository,
    pub(crate) consents: ConsentRepository,
    pub(crate) flows: FlowRepository,
    pub(crate) sessions: Arc<SessionLog>,
    pub(crate) catalog: Arc<ServiceCatalog>,
    pub(crate) gate: ContentGate,
    pub(crate) interpreter: NeedInterpreter,
    pub(crate) search: Arc<ProviderSearch>,
    pub(crate) availability: Arc<AvailabilityCoordinator>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) media: Option<Arc<dyn ObjectStore>>,
    pub(crate) config: RouterConfig,
    locks: PhoneLocks,
    searches: Mutex<HashMap<String, CancellationToken>>,
    /// Back-reference handed to spawned background tasks.
    self_ref: Weak<Self>,
}

/// Everything the router needs, gathered by the composition root.
pub struct RouterDeps {
    /// Customer repository.
    pub customers: CustomerRepository,
    /// Consent audit repository.
    pub consents: ConsentRepository,
    /// Flow repository.
    pub flows: FlowRepository,
    /// Session transcript log.
    pub sessions: Arc<SessionLog>,
    /// Service catalog.
    pub catalog: Arc<ServiceCatalog>,
    /// Content safety gate.
    pub gate: ContentGate,
    /// Need interpreter.
    pub interpreter: NeedInterpreter,
    /// Provider search.
    pub search: Arc<ProviderSearch>,
    /// Availability coordinator.
    pub availability: Arc<AvailabilityCoordinator>,
    /// Outbound transport.
    pub transport: Arc<dyn Transport>,
    /// Photo object store, when configured.
    pub media: Option<Arc<dyn ObjectStore>>,
    /// Tunables.
    pub config: RouterConfig,
}

impl Router {
    /// Assemble a router from its dependencies.
    pub fn new(deps: RouterDeps) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            customers: deps.customers,
            consents: deps.consents,
            flows: deps.flows,
            sessions: deps.sessions,
            catalog: deps.catalog,
            gate: deps.gate,
            interpreter: deps.interpreter,
            search: deps.search,
            availability: deps.availability,
            transport: deps.transport,
            media: deps.media,
            config: deps.config,
            locks: PhoneLocks::default(),
            searches: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Handle one inbound payload, mapping internal failures to the
    /// generic retry message. This is the binary's entry point.
    pub async fn handle_safe(&self, payload: InboundPayload) -> Vec<OutboundMessage> {
        match self.handle(payload).await {
            Ok(messages) => messages,
            Err(RouterError::MissingSender) => {
                warn!("inbound payload without from_number dropped");
                Vec::new()
            }
            Err(e) => {
                error!(error = %e, "turn failed");
                vec![OutboundMessage::text(messages::TRY_AGAIN)]
            }
        }
    }

    /// Handle one inbound payload.
    ///
    /// Returns the ordered outbound messages for this turn. An empty list
    /// means silence (banned phone or duplicate delivery).
    pub async fn handle(&self, payload: InboundPayload) -> Result<Vec<OutboundMessage>, RouterError> {
        let phone = payload.from_number.trim().to_owned();
        if phone.is_empty() {
            return Err(RouterError::MissingSender);
        }

        let _guard = self.locks.acquire(&phone).await;

        // Ban short-circuit before anything that could bill an LLM call.
        if self.gate.is_banned(&phone).await {
            debug!(phone, "inbound from banned phone dropped");
            return Ok(Vec::new());
        }

        let existing = self.customers.find_by_phone(&phone).await?;
        let is_new = existing.is_none();
        let customer = match existing {
            Some(customer) => customer,
            None => self.customers.get_or_create(&phone, None, None).await?,
        };
        let mut flow = self.flows.load(&phone).await?;

        // Duplicate delivery of the same message id is a no-op.
        if let (Some(id), Some(last)) = (payload.id.as_deref(), flow.last_message_id.as_deref()) {
            if id == last {
                debug!(phone, message_id = id, "duplicate inbound dropped");
                return Ok(Vec::new());
            }
        }

        if !customer.has_consent {
            return self
                .consent_phase(&phone, &customer, is_new, flow, &payload)
                .await;
        }

        sync_customer_into_flow(&mut flow, &customer);

        let text = payload
            .content
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_owned();
        let selected = payload
            .selected_option
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned);

        info!(
            phone,
            state = ?flow.state,
            msg_type = payload.message_type.as_deref().unwrap_or("text"),
            has_selection = selected.is_some(),
            "inbound message"
        );

        self.detect_city_update(&mut flow, &text).await?;

        if let Some(reply) = self.try_reset_keyword(&phone, &flow, &text, &payload).await? {
            return Ok(reply);
        }

        if let Some(reply) = self.try_inactivity_reset(&phone, &flow, &customer, &payload).await? {
            return Ok(reply);
        }

        if !text.is_empty() {
            self.sessions
                .record(
                    &phone,
                    &text,
                    false,
                    serde_json::json!({ "message_id": payload.id }),
                )
                .await;
        }

        let input = HandlerInput {
            text,
            selected,
        };
        let reply = match self.dispatch(&phone, &mut flow, &input).await {
            Ok(reply) => reply,
            Err(RouterError::Flow(e)) => {
                error!(phone, error = %e, "forbidden transition, rewriting flow to error state");
                flow.state = FlowState::Error;
                Reply::text(messages::INITIAL_SERVICE_PROMPT)
            }
            Err(other) => return Err(other),
        };

        touch_timestamps(&mut flow);
        flow.last_message_id = payload.id.clone();
        self.flows.store(&phone, &flow).await?;

        if let Err(reason) = flow.check_invariants() {
            warn!(phone, reason, "stored flow violates invariants");
        }

        if reply.spawn_search {
            self.spawn_search(&phone).await;
        }

        for message in &reply.messages {
            self.sessions
                .record(&phone, &message.response, true, serde_json::Value::Null)
                .await;
        }
        Ok(reply.messages)
    }

    /// Force the service catalog to reload. Admin surface.
    pub async fn refresh_catalog(&self) {
        self.catalog.refresh().await;
    }

    // -- pre-router pieces --------------------------------------------------

    async fn consent_phase(
        &self,
        phone: &str,
        customer: &Customer,
        is_new: bool,
        mut flow: ConversationFlow,
        payload: &InboundPayload,
    ) -> Result<Vec<OutboundMessage>, RouterError> {
        flow.state = FlowState::AwaitingConsent;
        flow.has_consent = false;
        flow.customer_id = Some(customer.id.clone());

        if is_new {
            info!(phone, "first contact, sending consent prompt");
            self.finish_turn(phone, &mut flow, payload).await?;
            return Ok(consent::consent_prompt());
        }

        let selected = payload.selected_option.as_deref().unwrap_or_default();
        let text = payload.content.as_deref().unwrap_or_default();

        match consent::parse_consent_reply(
            (!selected.trim().is_empty()).then_some(selected),
            text,
        ) {
            Some(ConsentReply::Accepted) => {
                self.customers.set_consent(&customer.id).await?;
                self.consents
                    .record(&customer.id, ConsentReply::Accepted, payload)
                    .await?;
                info!(phone, "consent accepted");

                // Stale context captured before consent must not leak in.
                flow.clear_service_context();
                flow.has_consent = true;
                if let Some(city) = customer.city.as_deref().filter(|c| !c.trim().is_empty()) {
                    flow.city = Some(city.to_owned());
                    flow.city_confirmed = customer.city_confirmed_at.is_some();
                }
                flow.transition(FlowState::AwaitingService)?;
                self.finish_turn(phone, &mut flow, payload).await?;
                Ok(vec![OutboundMessage::text(messages::INITIAL_SERVICE_PROMPT)])
            }
            Some(ConsentReply::Declined) => {
                self.consents
                    .record(&customer.id, ConsentReply::Declined, payload)
                    .await?;
                info!(phone, "consent declined");
                self.finish_turn(phone, &mut flow, payload).await?;
                Ok(vec![OutboundMessage::text(messages::CONSENT_DECLINED)])
            }
            None => {
                debug!(phone, "ambiguous consent reply, re-sending prompt");
                self.finish_turn(phone, &mut flow, payload).await?;
                Ok(consent::consent_prompt())
            }
        }
    }

    async fn detect_city_update(
        &self,
        flow: &mut ConversationFlow,
        text: &str,
    ) -> Result<(), RouterError> {
        if text.is_empty() {
            return Ok(());
        }
        let Some(city) = catalog::resolve_city(text) else {
            return Ok(());
        };
        if flow.city.as_deref() == Some(city.as_str()) {
            return Ok(());
        }
        if let Some(customer_id) = flow.customer_id.as_deref() {
            self.customers.update_city(customer_id, &city).await?;
        }
        debug!(city, "city detected in inbound text");
        flow.city = Some(city);
        flow.city_confirmed = true;
        Ok(())
    }

    async fn try_reset_keyword(
        &self,
        phone: &str,
        flow: &ConversationFlow,
        text: &str,
        payload: &InboundPayload,
    ) -> Result<Option<Vec<OutboundMessage>>, RouterError> {
        let normalized = crate::text::normalize(text);
        if normalized.is_empty() || !RESET_KEYWORDS.contains(&normalized.as_str()) {
            return Ok(None);
        }

        info!(phone, keyword = %normalized, "reset keyword received");
        self.cancel_search(phone).await;
        self.flows.reset(phone).await?;

        if let Some(customer_id) = flow.customer_id.as_deref() {
            // A reset also forgets the stored city and consent; the next
            // message walks the consent flow again.
            if let Err(e) = self.customers.clear_city(customer_id).await {
                warn!(phone, error = %e, "failed to clear customer city on reset");
            }
            if let Err(e) = self.customers.clear_consent(customer_id).await {
                warn!(phone, error = %e, "failed to clear customer consent on reset");
            }
        }

        let mut fresh = ConversationFlow::new(phone);
        fresh.customer_id = flow.customer_id.clone();
        self.finish_turn(phone, &mut fresh, payload).await?;
        Ok(Some(vec![OutboundMessage::text(messages::NEW_SESSION_NOTICE)]))
    }

    async fn try_inactivity_reset(
        &self,
        phone: &str,
        flow: &ConversationFlow,
        customer: &Customer,
        payload: &InboundPayload,
    ) -> Result<Option<Vec<OutboundMessage>>, RouterError> {
        let Some(prev) = flow.last_seen_at_prev.as_deref() else {
            return Ok(None);
        };
        let Ok(prev) = DateTime::parse_from_rfc3339(prev) else {
            return Ok(None);
        };
        let elapsed = Utc::now().signed_duration_since(prev.with_timezone(&Utc));
        if elapsed.num_seconds() <= timeout_seconds(self.config.session_timeout) {
            return Ok(None);
        }

        info!(phone, elapsed_secs = elapsed.num_seconds(), "inactivity timeout, restarting session");
        self.cancel_search(phone).await;
        self.flows.reset(phone).await?;

        let mut fresh = ConversationFlow::new(phone);
        fresh.has_consent = customer.has_consent;
        fresh.customer_id = Some(customer.id.clone());
        fresh.city = customer.city.clone();
        fresh.city_confirmed = customer.city_confirmed_at.is_some();
        self.finish_turn(phone, &mut fresh, payload).await?;

        Ok(Some(vec![
            OutboundMessage::text(messages::session_restarted()),
            OutboundMessage::text(messages::INITIAL_SERVICE_PROMPT),
        ]))
    }

    /// Stamp timestamps and the processed message id, then persist.
    async fn finish_turn(
        &self,
        phone: &str,
        flow: &mut ConversationFlow,
        payload: &InboundPayload,
    ) -> Result<(), RouterError> {
        touch_timestamps(flow);
        flow.last_message_id = payload.id.clone();
        self.flows.store(phone, flow).await?;
        Ok(())
    }

    // -- background search plumbing -----------------------------------------

    async fn spawn_search(&self, phone: &str) {
        let Some(router) = self.self_ref.upgrade() else {
            // The router is being dropped; nothing to notify anymore.
            return;
        };
        let cancel = CancellationToken::new();
        {
            let mut searches = self.searches.lock().await;
            if let Some(previous) = searches.insert(phone.to_owned(), cancel.clone()) {
                previous.cancel();
            }
        }
        let phone = phone.to_owned();
        tokio::spawn(async move {
            background::run_search(router, phone, cancel).await;
        });
    }

    async fn cancel_search(&self, phone: &str) {
        let mut searches = self.searches.lock().await;
        if let Some(token) = searches.remove(phone) {
            token.cancel();
        }
    }

    pub(crate) async fn clear_search_token(&self, phone: &str) {
        let mut searches = self.searches.lock().await;
        searches.remove(phone);
    }

    pub(crate) async fn lock_phone(&self, phone: &str) -> OwnedMutexGuard<()> {
        self.locks.acquire(phone).await
    }
}

fn timeout_seconds(timeout: Duration) -> i64 {
    i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX)
}

/// Mirror the customer record into the flow where the flow is missing
/// data.
fn sync_customer_into_flow(flow: &mut ConversationFlow, customer: &Customer) {
    if flow.customer_id.is_none() {
        flow.customer_id = Some(customer.id.clone());
    }
    flow.has_consent = customer.has_consent;
    if flow.city.is_none() {
        if let Some(city) = customer.city.as_deref().filter(|c| !c.trim().is_empty()) {
            flow.city = Some(city.to_owned());
            if customer.city_confirmed_at.is_some() {
                flow.city_confirmed = true;
            }
        }
    }
}

/// Stamp the turn timestamps.
///
/// `last_seen_at_prev` receives the previous turn's timestamp; a brand-new
/// conversation gets `now` so the very next turn can already measure the
/// gap.
fn touch_timestamps(flow: &mut ConversationFlow) {
    let now = Utc::now().to_rfc3339();
    flow.last_seen_at_prev = flow.last_seen_at.take().or_else(|| Some(now.clone()));
    flow.last_seen_at = Some(now);
}

/// Whether text is a greeting (and therefore not a service description).
pub(crate) fn is_greeting(text: &str) -> bool {
    let normalized = crate::text::normalize(text);
    !normalized.is_empty() && GREETINGS.contains(&normalized.as_str())
}
