//! End-to-end conversation tests: the full router over an in-memory K/V,
//! an in-memory SQLite catalog, a scripted LLM and a recording transport.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use minka::availability::{AvailabilityCoordinator, ProbeRecord, ProbeStatus};
use minka::catalog::ServiceCatalog;
use minka::consent::ConsentRepository;
use minka::customers::CustomerRepository;
use minka::flow::repository::FlowRepository;
use minka::flow::{ConversationFlow, FlowState};
use minka::interpret::NeedInterpreter;
use minka::kv::memory::MemoryKv;
use minka::kv::{self, KvStore};
use minka::llm::{ChatRequest, LlmClient, LlmError};
use minka::router::{Router, RouterConfig, RouterDeps};
use minka::safety::ContentGate;
use minka::search::{ProviderSearch, ProviderSummary};
use minka::sessions::SessionLog;
use minka::transport::{GatewayError, InboundPayload, OutboundMessage, Transport};

const CUSTOMER: &str = "+593999000001";

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Transport fake recording every send.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(String, OutboundMessage)>>,
}

impl RecordingTransport {
    async fn texts_to(&self, phone: &str) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(to, _)| to == phone)
            .map(|(_, msg)| msg.response.clone())
            .collect()
    }

    async fn recipients(&self) -> Vec<String> {
        self.sent.lock().await.iter().map(|(to, _)| to.clone()).collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, to: &str, message: &OutboundMessage) -> Result<(), GatewayError> {
        self.sent.lock().await.push((to.to_owned(), message.clone()));
        Ok(())
    }
}

/// LLM fake routing by prompt kind.
#[derive(Default)]
struct RoutedLlm {
    /// Moderation verdicts, consumed front to back; `valid` when empty.
    moderation: Mutex<VecDeque<String>>,
    /// Service-extraction answer; error when unset.
    service: Mutex<Option<String>>,
    /// Need-detection flag: text is a bare profession.
    is_profession: Mutex<bool>,
}

impl RoutedLlm {
    async fn push_moderation(&self, category: &str) {
        self.moderation.lock().await.push_back(format!(
            "{{\"is_valid\": false, \"category\": \"{category}\", \"reason\": \"scripted\", \"should_ban\": false}}"
        ));
    }

    async fn set_service(&self, service: &str) {
        *self.service.lock().await = Some(service.to_owned());
    }

    async fn set_is_profession(&self, value: bool) {
        *self.is_profession.lock().await = value;
    }
}

#[async_trait]
impl LlmClient for RoutedLlm {
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError> {
        if request.system.contains("moderador de contenido") {
            return Ok(self.moderation.lock().await.pop_front().unwrap_or_else(|| {
                r#"{"is_valid": true, "category": "valid", "reason": ""}"#.to_owned()
            }));
        }
        if request.system.contains("servicios profesionales") {
            return self.service.lock().await.clone().ok_or(LlmError::Empty);
        }
        if request.system.contains("ciudades de Ecuador") {
            return Ok("null".to_owned());
        }
        if request.system.contains("intención de búsqueda") {
            let is_profession = *self.is_profession.lock().await;
            return Ok(format!(
                "{{\"es_profesion\": {is_profession}, \"confianza\": 0.95}}"
            ));
        }
        Err(LlmError::Empty)
    }
}

// ---------------------------------------------------------------------------
// Test bed
// ---------------------------------------------------------------------------

struct TestBed {
    router: Arc<Router>,
    transport: Arc<RecordingTransport>,
    kv: Arc<MemoryKv>,
    pool: SqlitePool,
    llm: Arc<RoutedLlm>,
    flows: FlowRepository,
    consents: ConsentRepository,
    customers: CustomerRepository,
}

async fn testbed() -> TestBed {
    let pool = minka::db::connect_in_memory().await.expect("pool");
    minka::db::migrate(&pool).await.expect("migrate");

    for (canonical, synonym) in [
        ("plomero", "plomero"),
        ("plomero", "plomería"),
        ("plomero", "gasfitero"),
        ("electricista", "electricista"),
    ] {
        sqlx::query("INSERT INTO service_synonyms (canonical_profession, synonym) VALUES (?1, ?2)")
            .bind(canonical)
            .bind(synonym)
            .execute(&pool)
            .await
            .expect("seed synonym");
    }

    let kv = Arc::new(MemoryKv::new());
    let llm = Arc::new(RoutedLlm::default());
    let transport = Arc::new(RecordingTransport::default());
    let catalog = Arc::new(ServiceCatalog::new(
        pool.clone(),
        Arc::clone(&kv) as Arc<dyn KvStore>,
        Duration::from_secs(3600),
    ));

    let flows = FlowRepository::new(Arc::clone(&kv) as Arc<dyn KvStore>, Duration::from_secs(86400));
    let consents = ConsentRepository::new(pool.clone());
    let customers = CustomerRepository::new(pool.clone());

    let router = Router::new(RouterDeps {
        customers: customers.clone(),
        consents: consents.clone(),
        flows: flows.clone(),
        sessions: Arc::new(SessionLog::new(
            Arc::clone(&kv) as Arc<dyn KvStore>,
            Duration::from_secs(3600),
            10,
        )),
        catalog: Arc::clone(&catalog),
        gate: ContentGate::new(
            Arc::clone(&kv) as Arc<dyn KvStore>,
            Some(Arc::clone(&llm) as Arc<dyn LlmClient>),
        ),
        interpreter: NeedInterpreter::new(
            Arc::clone(&catalog),
            Some(Arc::clone(&llm) as Arc<dyn LlmClient>),
        ),
        search: Arc::new(ProviderSearch::new(pool.clone(), Arc::clone(&catalog))),
        availability: Arc::new(AvailabilityCoordinator::new(
            Arc::clone(&kv) as Arc<dyn KvStore>,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Duration::from_secs(2),
            Duration::from_secs(120),
            Duration::from_millis(50),
        )),
        transport: Arc::clone(&transport) as Arc<dyn Transport>,
        media: None,
        config: RouterConfig::default(),
    });

    TestBed {
        router,
        transport,
        kv,
        pool,
        llm,
        flows,
        consents,
        customers,
    }
}

async fn say(bed: &TestBed, text: &str) -> Vec<OutboundMessage> {
    bed.router
        .handle(InboundPayload::text(CUSTOMER, text))
        .await
        .expect("turn")
}

/// Walk the consent dialog so the phone can converse.
async fn walk_consent(bed: &TestBed) {
    let prompt = say(bed, "hola").await;
    assert_eq!(prompt.len(), 2, "consent prompt is a two-message pair");
    let after = say(bed, "1").await;
    assert_eq!(after.len(), 1);
    assert!(after[0].response.contains("qué servicio necesitas"));
}

async fn seed_provider(pool: &SqlitePool, id: &str, name: &str, real_phone: Option<&str>, phone: Option<&str>, rating: f64) {
    sqlx::query(
        "INSERT INTO providers (id, phone, real_phone, full_name, city, profession, services, rating, verified)
         VALUES (?1, ?2, ?3, ?4, 'Quito', 'plomero', 'fugas', ?5, 1)",
    )
    .bind(id)
    .bind(phone)
    .bind(real_phone)
    .bind(name)
    .bind(rating)
    .execute(pool)
    .await
    .expect("seed provider");
}

/// Flip a probe to a final status, as the provider-side ingress would.
async fn answer_probe(kv: &MemoryKv, provider_phone: &str, status: ProbeStatus) {
    let pending_key = format!("availability:provider:{provider_phone}:pending");
    let req_ids: Vec<String> = kv::get_record(kv, &pending_key)
        .await
        .expect("pending read")
        .unwrap_or_default();
    let req_id = req_ids.first().cloned().expect("pending req id");
    let key = format!("availability:request:{req_id}:provider:{provider_phone}");
    let mut probe: ProbeRecord = kv::get_record(kv, &key)
        .await
        .expect("probe read")
        .expect("probe exists");
    probe.status = status;
    probe.responded_at = Some(Utc::now().to_rfc3339());
    kv::set_record(kv, &key, &probe, None).await.expect("probe write");
}

async fn wait_for_state(bed: &TestBed, want: FlowState) -> ConversationFlow {
    for _ in 0..200 {
        let flow = bed.flows.load(CUSTOMER).await.expect("flow");
        if flow.state == want {
            return flow;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("flow never reached {want:?}");
}

async fn customer_id(bed: &TestBed) -> String {
    bed.customers
        .find_by_phone(CUSTOMER)
        .await
        .expect("find")
        .expect("customer")
        .id
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_first_time_user_happy_path() {
    let bed = testbed().await;
    // P1 has only a non-dialable handle and never answers; P3 accepts
    // before P2 despite the lower row order of P2's rating.
    seed_provider(&bed.pool, "p1", "Uno", None, Some("111@lid"), 4.9).await;
    seed_provider(&bed.pool, "p2", "Dos", Some("+593200000002"), None, 4.5).await;
    seed_provider(&bed.pool, "p3", "Tres", Some("+593300000003"), None, 4.8).await;
    bed.llm.set_service("plomero").await;
    bed.llm.set_is_profession(false).await;

    // Consent.
    let prompt = say(&bed, "hola").await;
    assert!(prompt[0].response.contains("consentimiento"));
    let accepted = say(&bed, "1").await;
    assert!(accepted[0].response.contains("qué servicio necesitas"));

    // Need description → candidate confirmation.
    let confirm = say(&bed, "tengo una fuga en el baño").await;
    assert!(confirm[0].response.contains("plomero"));
    assert!(confirm[0].response.contains("1) Sí"));

    // Confirm → city prompt (no city known yet).
    let city_prompt = say(&bed, "1").await;
    assert!(city_prompt[0].response.contains("ciudad"));

    // City → immediate searching acknowledgement.
    let ack = say(&bed, "Quito").await;
    assert!(ack[0].response.contains("confirmando disponibilidad"));

    // Background: wait for probes, then answer P3 first, P2 second.
    for _ in 0..100 {
        if !kv::get_record::<Vec<String>>(
            bed.kv.as_ref(),
            "availability:provider:+593300000003:pending",
        )
        .await
        .expect("read")
        .unwrap_or_default()
        .is_empty()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    answer_probe(&bed.kv, "+593300000003", ProbeStatus::Accepted).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    answer_probe(&bed.kv, "+593200000002", ProbeStatus::Accepted).await;

    let flow = wait_for_state(&bed, FlowState::PresentingResults).await;

    // Acceptance-arrival order, not rating order; P1 absent.
    let names: Vec<&str> = flow.providers.iter().map(|p| p.full_name.as_str()).collect();
    assert_eq!(names, vec!["Tres", "Dos"]);

    // The customer got the result list with Tres first.
    let texts = bed.transport.texts_to(CUSTOMER).await;
    let list = texts.iter().find(|t| t.contains("Encontré estas opciones")).expect("list sent");
    assert!(list.contains("1) Tres"));
    assert!(list.contains("2) Dos"));

    // Probes went to the dialable phones (and the lid handle), not the customer.
    let recipients = bed.transport.recipients().await;
    assert!(recipients.iter().any(|r| r == "+593200000002"));
    assert!(recipients.iter().any(|r| r == "+593300000003"));
}

#[tokio::test]
async fn test_bare_profession_is_rejected() {
    let bed = testbed().await;
    walk_consent(&bed).await;
    bed.llm.set_service("plomero").await;
    bed.llm.set_is_profession(true).await;

    let reply = say(&bed, "necesito un plomero").await;
    assert!(reply[0].response.contains("qué servicio necesitas"));

    let flow = bed.flows.load(CUSTOMER).await.expect("flow");
    assert_eq!(flow.state, FlowState::AwaitingService);
    assert!(flow.service_candidate.is_none());
}

#[tokio::test]
async fn test_content_safety_two_strikes_then_silence() {
    let bed = testbed().await;
    walk_consent(&bed).await;

    bed.llm.push_moderation("illegal").await;
    let first = say(&bed, "quiero comprar un arma").await;
    assert!(first[0].response.contains("aviso"), "first strike warns");

    bed.llm.push_moderation("illegal").await;
    let before = Utc::now();
    let second = say(&bed, "quiero comprar un arma").await;
    let after = Utc::now();
    assert!(second[0].response.contains("suspendida"), "second strike bans");
    let resume_of = |t: chrono::DateTime<Utc>| {
        t.checked_add_signed(ChronoDuration::minutes(15))
            .expect("resume time")
            .format("%H:%M")
            .to_string()
    };
    assert!(
        second[0].response.contains(&resume_of(before))
            || second[0].response.contains(&resume_of(after)),
        "ban message carries the resume time"
    );

    // Any further inbound is dropped silently.
    let third = say(&bed, "hola?").await;
    assert!(third.is_empty());
}

#[tokio::test]
async fn test_nonsense_input_asks_for_reformulation() {
    let bed = testbed().await;
    walk_consent(&bed).await;

    bed.llm.push_moderation("nonsense").await;
    let reply = say(&bed, "dinero abeja").await;
    assert!(reply[0].response.contains("reformúlalo"));

    // No warning was recorded; a later valid message flows normally.
    let warnings = bed.kv.get(&format!("warnings:{CUSTOMER}")).await.expect("get");
    assert!(warnings.is_none());
}

#[tokio::test]
async fn test_inactivity_reset_fires_exactly_once() {
    let bed = testbed().await;
    walk_consent(&bed).await;

    // Backdate the previous-turn timestamp past the 180 s window.
    let mut flow = bed.flows.load(CUSTOMER).await.expect("flow");
    let stale = Utc::now()
        .checked_sub_signed(ChronoDuration::seconds(200))
        .expect("stale time")
        .to_rfc3339();
    flow.last_seen_at = Some(stale.clone());
    flow.last_seen_at_prev = Some(stale);
    flow.state = FlowState::ConfirmService;
    flow.service_candidate = Some("plomero".to_owned());
    bed.flows.store(CUSTOMER, &flow).await.expect("store");

    let reply = say(&bed, "1").await;
    assert_eq!(reply.len(), 2);
    assert!(reply[0].response.contains("expiró por inactividad"));
    assert!(reply[1].response.contains("qué servicio necesitas"));

    let flow = bed.flows.load(CUSTOMER).await.expect("flow");
    assert_eq!(flow.state, FlowState::AwaitingService);
    assert!(flow.service_candidate.is_none());

    // The very next turn does not reset again.
    bed.llm.set_service("plomero").await;
    bed.llm.set_is_profession(false).await;
    let next = say(&bed, "se me daño la ducha").await;
    assert!(next[0].response.contains("plomero"), "normal handling resumed");
}

#[tokio::test]
async fn test_availability_timeout_with_zero_acceptors() {
    let bed = testbed().await;
    seed_provider(&bed.pool, "p1", "Uno", Some("+593111111111"), None, 4.0).await;
    seed_provider(&bed.pool, "p2", "Dos", Some("+593222222222"), None, 4.5).await;
    seed_provider(&bed.pool, "p3", "Tres", Some("+593333333333"), None, 4.8).await;
    bed.llm.set_service("plomero").await;
    bed.llm.set_is_profession(false).await;

    walk_consent(&bed).await;
    say(&bed, "tengo una fuga en el baño").await;
    say(&bed, "1").await;
    let ack = say(&bed, "Quito").await;
    assert!(ack[0].response.contains("confirmando disponibilidad"));

    // Nobody answers; after the (shortened) deadline the flow lands in
    // the confirm-new-search branch with the no-availability copy.
    let flow = wait_for_state(&bed, FlowState::ConfirmNewSearch).await;
    assert!(flow.providers.is_empty());

    let texts = bed.transport.texts_to(CUSTOMER).await;
    assert!(
        texts.iter().any(|t| t.contains("No hay proveedores disponibles")),
        "no-availability copy sent"
    );
    assert!(
        texts.iter().any(|t| t.contains("¿Te ayudo con otro servicio?")),
        "confirmation menu sent"
    );
}

#[tokio::test]
async fn test_provider_selection_and_handoff() {
    let bed = testbed().await;
    walk_consent(&bed).await;

    // Arrange a presenting state directly.
    let mut flow = bed.flows.load(CUSTOMER).await.expect("flow");
    flow.state = FlowState::PresentingResults;
    flow.service = Some("plomero".to_owned());
    flow.city = Some("Quito".to_owned());
    flow.city_confirmed = true;
    flow.providers = vec![
        ProviderSummary {
            id: "p-ana".to_owned(),
            full_name: "Ana".to_owned(),
            real_phone: Some("+593987654321".to_owned()),
            face_photo_url: Some("https://cdn.example.com/faces/abc.jpg".to_owned()),
            profession: Some("plomero".to_owned()),
            rating: 4.9,
            ..ProviderSummary::default()
        },
        ProviderSummary {
            id: "p-luis".to_owned(),
            full_name: "Luis".to_owned(),
            real_phone: Some("+593999999999".to_owned()),
            ..ProviderSummary::default()
        },
    ];
    bed.flows.store(CUSTOMER, &flow).await.expect("store");

    // Select entry 1 → detail card.
    let detail = say(&bed, "1").await;
    assert!(detail[0].response.contains("Ana"));
    assert!(detail[1].response.contains("Seleccionar a este proveedor"));

    // Select from the detail → handoff + confirmation menu.
    let handoff = say(&bed, "1").await;
    assert!(handoff[0].response.contains("Proveedor asignado: Ana."));
    assert!(handoff[0].response.contains("https://wa.me/593987654321"));
    assert_eq!(handoff[0].media_type.as_deref(), Some("image"));
    assert!(handoff[0].media_url.is_some());
    assert!(handoff[1].response.contains("¿Te ayudo con otro servicio?"));

    let flow = bed.flows.load(CUSTOMER).await.expect("flow");
    assert_eq!(flow.state, FlowState::ConfirmNewSearch);
    assert_eq!(
        flow.chosen_provider.as_ref().map(|p| p.id.as_str()),
        Some("p-ana")
    );
}

// ---------------------------------------------------------------------------
// Invariants and boundaries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_consent_records_one_row_per_decision() {
    let bed = testbed().await;

    say(&bed, "hola").await;
    let id = customer_id(&bed).await;

    // Ambiguous reply: no record, prompt re-sent.
    let ambiguous = say(&bed, "tal vez").await;
    assert_eq!(ambiguous.len(), 2);
    assert_eq!(bed.consents.count_for(&id).await.expect("count"), 0);

    // Acceptance: exactly one record.
    say(&bed, "1").await;
    assert_eq!(bed.consents.count_for(&id).await.expect("count"), 1);

    let customer = bed
        .customers
        .find_by_phone(CUSTOMER)
        .await
        .expect("find")
        .expect("exists");
    assert!(customer.has_consent);
}

#[tokio::test]
async fn test_consent_decline_records_and_blocks() {
    let bed = testbed().await;

    say(&bed, "hola").await;
    let declined = say(&bed, "2").await;
    assert!(declined[0].response.contains("Sin tu consentimiento"));

    let id = customer_id(&bed).await;
    assert_eq!(bed.consents.count_for(&id).await.expect("count"), 1);

    // The next message is still gated on consent.
    let again = say(&bed, "tengo una fuga").await;
    assert_eq!(again.len(), 2, "consent prompt re-sent");
}

#[tokio::test]
async fn test_short_input_does_not_advance() {
    let bed = testbed().await;
    walk_consent(&bed).await;

    for text in ["ya", "x", "123"] {
        let reply = say(&bed, text).await;
        assert!(
            reply[0].response.contains("No entendí"),
            "{text:?} must be rejected"
        );
        let flow = bed.flows.load(CUSTOMER).await.expect("flow");
        assert_eq!(flow.state, FlowState::AwaitingService);
    }
}

#[tokio::test]
async fn test_results_selection_out_of_range_re_renders() {
    let bed = testbed().await;
    walk_consent(&bed).await;

    let mut flow = bed.flows.load(CUSTOMER).await.expect("flow");
    flow.state = FlowState::PresentingResults;
    flow.city = Some("Quito".to_owned());
    flow.providers = vec![
        ProviderSummary {
            id: "p1".to_owned(),
            full_name: "Uno".to_owned(),
            ..ProviderSummary::default()
        },
        ProviderSummary {
            id: "p2".to_owned(),
            full_name: "Dos".to_owned(),
            ..ProviderSummary::default()
        },
    ];
    bed.flows.store(CUSTOMER, &flow).await.expect("store");

    for text in ["7", "0", "no se"] {
        let reply = say(&bed, text).await;
        assert!(
            reply[0].response.contains("Encontré estas opciones"),
            "{text:?} re-renders the list"
        );
        let flow = bed.flows.load(CUSTOMER).await.expect("flow");
        assert_eq!(flow.state, FlowState::PresentingResults);
    }
}

#[tokio::test]
async fn test_confirm_menu_auto_resets_after_two_invalid_replies() {
    let bed = testbed().await;
    walk_consent(&bed).await;

    let mut flow = bed.flows.load(CUSTOMER).await.expect("flow");
    flow.state = FlowState::ConfirmNewSearch;
    flow.confirm_include_city_option = true;
    bed.flows.store(CUSTOMER, &flow).await.expect("store");

    let first = say(&bed, "mmm").await;
    assert!(first[0].response.contains("¿Te ayudo con otro servicio?"));
    let flow = bed.flows.load(CUSTOMER).await.expect("flow");
    assert_eq!(flow.state, FlowState::ConfirmNewSearch);

    let second = say(&bed, "mmm").await;
    assert!(second[0].response.contains("qué servicio necesitas"));
    let flow = bed.flows.load(CUSTOMER).await.expect("flow");
    assert_eq!(flow.state, FlowState::AwaitingService);
}

#[tokio::test]
async fn test_reset_keyword_clears_session_and_consent() {
    let bed = testbed().await;
    walk_consent(&bed).await;
    bed.llm.set_service("plomero").await;
    bed.llm.set_is_profession(false).await;
    say(&bed, "tengo una fuga en el baño").await;

    let reply = say(&bed, "reiniciar").await;
    assert_eq!(reply.len(), 1);
    assert!(reply[0].response.contains("Nueva sesión"));

    let flow = bed.flows.load(CUSTOMER).await.expect("flow");
    assert_eq!(flow.state, FlowState::AwaitingService);
    assert!(flow.service.is_none());
    assert!(flow.service_candidate.is_none());

    // Consent was revoked; the next message re-walks the consent flow.
    let next = say(&bed, "hola").await;
    assert_eq!(next.len(), 2);
    assert!(next[0].response.contains("consentimiento"));
}

#[tokio::test]
async fn test_duplicate_message_id_is_dropped() {
    let bed = testbed().await;
    walk_consent(&bed).await;
    bed.llm.set_service("plomero").await;
    bed.llm.set_is_profession(false).await;

    let mut payload = InboundPayload::text(CUSTOMER, "tengo una fuga en el baño");
    payload.id = Some("wamid.dup".to_owned());

    let first = bed.router.handle(payload.clone()).await.expect("turn");
    assert!(!first.is_empty());

    let second = bed.router.handle(payload).await.expect("turn");
    assert!(second.is_empty(), "redelivery is silent");
}

#[tokio::test]
async fn test_missing_sender_is_rejected() {
    let bed = testbed().await;
    let result = bed.router.handle(InboundPayload::default()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_greeting_after_consent_re_prompts() {
    let bed = testbed().await;
    walk_consent(&bed).await;

    let reply = say(&bed, "hola").await;
    assert!(reply[0].response.contains("qué servicio necesitas"));
}

#[tokio::test]
async fn test_known_city_skips_city_question() {
    let bed = testbed().await;
    seed_provider(&bed.pool, "p1", "Uno", Some("+593111111111"), None, 4.0).await;
    bed.llm.set_service("plomero").await;
    bed.llm.set_is_profession(false).await;

    walk_consent(&bed).await;
    // The customer confirmed a city in an earlier session.
    let id = customer_id(&bed).await;
    bed.customers.update_city(&id, "Quito").await.expect("city");

    let confirm = say(&bed, "tengo una fuga en el baño").await;
    assert!(confirm[0].response.contains("plomero"));

    // Confirming the service goes straight to searching; the city
    // question is skipped.
    let ack = say(&bed, "1").await;
    assert!(ack[0].response.contains("confirmando disponibilidad"));

    // The lone candidate never answers; the run ends in the
    // no-availability branch.
    wait_for_state(&bed, FlowState::ConfirmNewSearch).await;
}
