//! Per-state conversation handlers.
//!
//! Each handler receives the mutable flow and the turn input and returns
//! the outbound messages plus the background-search flag. Handlers never
//! format ad-hoc strings; all copy comes from the message catalog.

use tracing::{debug, info};

use super::{is_greeting, HandlerInput, Reply, Router, RouterError};
use crate::connect;
use crate::consent;
use crate::flow::{ConversationFlow, FlowState};
use crate::messages;
use crate::safety::Moderation;
use crate::transport::OutboundMessage;

/// Rows shown from the provider list.
const MAX_PRESENTED: usize = 5;

impl Router {
    pub(crate) async fn dispatch(
        &self,
        phone: &str,
        flow: &mut ConversationFlow,
        input: &HandlerInput,
    ) -> Result<Reply, RouterError> {
        match flow.state {
            FlowState::AwaitingConsent => Ok(Reply::messages(consent::consent_prompt())),
            FlowState::AwaitingService => self.on_awaiting_service(phone, flow, input).await,
            FlowState::ConfirmService => self.on_confirm_service(flow, input).await,
            FlowState::AwaitingCity => self.on_awaiting_city(flow, input).await,
            FlowState::Searching => Ok(Reply::text(messages::SEARCHING_ACK)),
            FlowState::PresentingResults => on_presenting_results(flow, input),
            FlowState::ViewingProviderDetail => self.on_provider_detail(flow, input).await,
            FlowState::ConfirmNewSearch => self.on_confirm_new_search(flow, input),
            FlowState::Error => {
                flow.transition(FlowState::AwaitingService)?;
                Ok(Reply::text(messages::INITIAL_SERVICE_PROMPT))
            }
        }
    }

    async fn on_awaiting_service(
        &self,
        phone: &str,
        flow: &mut ConversationFlow,
        input: &HandlerInput,
    ) -> Result<Reply, RouterError> {
        let text = input.text.trim();

        if text.is_empty() || is_greeting(text) {
            return Ok(Reply::text(messages::INITIAL_SERVICE_PROMPT));
        }
        if text.chars().all(|c| c.is_ascii_digit()) {
            return Ok(Reply::text(messages::INVALID_SERVICE_INPUT));
        }
        if text.chars().count() == 1 {
            return Ok(Reply::text(messages::INVALID_SERVICE_INPUT));
        }
        let words = text.split_whitespace().count();
        if words < 2 && text.chars().count() < 4 {
            return Ok(Reply::text(messages::INVALID_SERVICE_INPUT));
        }

        match self.gate.moderate(phone, text).await? {
            Moderation::Allowed => {}
            Moderation::Reformulate { reply }
            | Moderation::Warned { reply }
            | Moderation::Banned { reply } => {
                return Ok(Reply::text(reply));
            }
        }

        let Some(candidate) = self.interpreter.extract_profession(text).await else {
            debug!(phone, "no profession extracted, asking to reformulate");
            return Ok(Reply::text(messages::REFORMULATE_REQUEST));
        };

        if !self.interpreter.is_need_or_problem(text).await {
            debug!(phone, candidate, "bare profession label rejected");
            return Ok(Reply::text(messages::INITIAL_SERVICE_PROMPT));
        }

        flow.service_candidate = Some(candidate.clone());
        flow.service_full = Some(text.to_owned());
        flow.transition(FlowState::ConfirmService)?;
        info!(phone, candidate, "service candidate detected");

        Ok(Reply::messages(vec![OutboundMessage::with_buttons(
            messages::confirm_service(&candidate),
            vec!["Sí".to_owned(), "No, es otra cosa".to_owned()],
        )]))
    }

    async fn on_confirm_service(
        &self,
        flow: &mut ConversationFlow,
        input: &HandlerInput,
    ) -> Result<Reply, RouterError> {
        let candidate = flow.service_candidate.clone();
        let Some(candidate) = candidate else {
            // Candidate lost (legacy record): restart the question.
            flow.transition(FlowState::AwaitingService)?;
            return Ok(Reply::text(messages::INITIAL_SERVICE_PROMPT));
        };

        match read_yes_no(input) {
            Some(true) => {
                flow.service = Some(candidate);
                flow.service_candidate = None;
                flow.service_captured_after_consent = true;

                if flow.city_confirmed && flow.city.is_some() {
                    Ok(start_search(flow)?)
                } else {
                    flow.transition(FlowState::AwaitingCity)?;
                    let service = flow.service.clone().unwrap_or_default();
                    Ok(Reply::text(messages::ask_city_for_service(&service)))
                }
            }
            Some(false) => {
                flow.service_candidate = None;
                flow.service_full = None;
                flow.transition(FlowState::AwaitingService)?;
                Ok(Reply::text(messages::INITIAL_SERVICE_PROMPT))
            }
            None => Ok(Reply::messages(vec![OutboundMessage::with_buttons(
                messages::confirm_service(&candidate),
                vec!["Sí".to_owned(), "No, es otra cosa".to_owned()],
            )])),
        }
    }

    async fn on_awaiting_city(
        &self,
        flow: &mut ConversationFlow,
        input: &HandlerInput,
    ) -> Result<Reply, RouterError> {
        let text = input.choice();
        let Some(city) = self.interpreter.extract_city(text).await else {
            return Ok(Reply::text(messages::city_not_recognized()));
        };

        if let Some(customer_id) = flow.customer_id.as_deref() {
            self.customers.update_city(customer_id, &city).await?;
        }
        flow.city = Some(city);
        flow.city_confirmed = true;

        if flow.service.is_none() {
            // City arrived before any service; go collect the need.
            flow.transition(FlowState::AwaitingService)?;
            return Ok(Reply::text(messages::INITIAL_SERVICE_PROMPT));
        }
        Ok(start_search(flow)?)
    }

    async fn on_provider_detail(
        &self,
        flow: &mut ConversationFlow,
        input: &HandlerInput,
    ) -> Result<Reply, RouterError> {
        let Some(idx) = flow.provider_detail_idx.filter(|idx| *idx < flow.providers.len())
        else {
            // Index lost or out of range: fall back to the list.
            flow.provider_detail_idx = None;
            flow.transition(FlowState::PresentingResults)?;
            return Ok(Reply::text(render_results(flow)));
        };

        match consent::normalize_button(input.choice()).as_deref() {
            Some("1") => {
                let chosen = flow.providers[idx].clone();
                info!(provider = %chosen.id, "provider selected, building handoff");

                let handoff =
                    connect::connection_message(&chosen, self.media.as_deref()).await;

                flow.chosen_provider = Some(chosen);
                flow.provider_detail_idx = None;
                flow.transition(FlowState::ConfirmNewSearch)?;
                flow.confirm_attempts = 0;
                flow.confirm_include_city_option = true;

                Ok(Reply::messages(vec![
                    handoff,
                    OutboundMessage::text(messages::confirm_search_message(true)),
                ]))
            }
            Some("2") => {
                flow.provider_detail_idx = None;
                flow.transition(FlowState::PresentingResults)?;
                Ok(Reply::text(render_results(flow)))
            }
            Some("3") => {
                flow.clear_service_context();
                flow.transition(FlowState::AwaitingService)?;
                Ok(Reply::text(messages::FAREWELL))
            }
            _ => Ok(Reply::text(messages::provider_detail_menu())),
        }
    }

    fn on_confirm_new_search(
        &self,
        flow: &mut ConversationFlow,
        input: &HandlerInput,
    ) -> Result<Reply, RouterError> {
        let include_city = flow.confirm_include_city_option;
        let choice = consent::normalize_button(input.choice());

        let action = match (include_city, choice.as_deref()) {
            (true, Some("1")) => ConfirmAction::ChangeCity,
            (true, Some("2")) | (false, Some("1")) => ConfirmAction::NewService,
            (true, Some("3")) | (false, Some("2")) => ConfirmAction::Exit,
            _ => ConfirmAction::Invalid,
        };

        match action {
            ConfirmAction::ChangeCity => {
                flow.providers.clear();
                flow.provider_detail_idx = None;
                flow.chosen_provider = None;
                flow.searching_dispatched = false;
                flow.confirm_attempts = 0;
                flow.city = None;
                flow.city_confirmed = false;
                flow.transition(FlowState::AwaitingCity)?;
                Ok(Reply::text(messages::ask_city()))
            }
            ConfirmAction::NewService => {
                flow.clear_service_context();
                flow.transition(FlowState::AwaitingService)?;
                Ok(Reply::text(messages::INITIAL_SERVICE_PROMPT))
            }
            ConfirmAction::Exit => {
                flow.clear_service_context();
                flow.transition(FlowState::AwaitingService)?;
                Ok(Reply::text(messages::FAREWELL))
            }
            ConfirmAction::Invalid => {
                flow.confirm_attempts = flow.confirm_attempts.saturating_add(1);
                if flow.confirm_attempts >= self.config.max_confirm_attempts {
                    debug!(attempts = flow.confirm_attempts, "confirm menu exhausted, auto-reset");
                    flow.clear_service_context();
                    flow.transition(FlowState::AwaitingService)?;
                    return Ok(Reply::text(messages::INITIAL_SERVICE_PROMPT));
                }
                Ok(Reply::text(messages::confirm_search_message(include_city)))
            }
        }
    }
}

enum ConfirmAction {
    ChangeCity,
    NewService,
    Exit,
    Invalid,
}

fn on_presenting_results(
    flow: &mut ConversationFlow,
    input: &HandlerInput,
) -> Result<Reply, RouterError> {
    let shown = flow.providers.len().min(MAX_PRESENTED);

    let selection = consent::normalize_button(input.choice())
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| (1..=shown).contains(n));

    if let Some(n) = selection {
        let idx = n.saturating_sub(1);
        flow.provider_detail_idx = Some(idx);
        flow.transition(FlowState::ViewingProviderDetail)?;
        let provider = &flow.providers[idx];
        return Ok(Reply::messages(vec![
            OutboundMessage::text(messages::provider_detail(provider)),
            OutboundMessage::text(messages::provider_detail_menu()),
        ]));
    }

    if input.choice().trim() == messages::SEARCH_AGAIN_OPTION {
        flow.transition(FlowState::ConfirmNewSearch)?;
        flow.confirm_attempts = 0;
        flow.confirm_include_city_option = true;
        return Ok(Reply::text(messages::confirm_search_message(true)));
    }

    // Out-of-range or non-numeric input re-renders the list.
    Ok(Reply::text(render_results(flow)))
}

fn render_results(flow: &ConversationFlow) -> String {
    messages::results_message(flow.city.as_deref().unwrap_or_default(), &flow.providers)
}

/// Move the flow into `Searching` and request the background dispatch.
///
/// The duplicate-dispatch guard keeps a second confirmation from spawning
/// a second fan-out.
fn start_search(flow: &mut ConversationFlow) -> Result<Reply, RouterError> {
    if flow.searching_dispatched && flow.state == FlowState::Searching {
        return Ok(Reply::text(messages::SEARCHING_ACK));
    }
    flow.transition(FlowState::Searching)?;
    flow.searching_dispatched = true;
    flow.providers.clear();
    flow.provider_detail_idx = None;
    flow.chosen_provider = None;

    let mut reply = Reply::text(messages::SEARCHING_ACK);
    reply.spawn_search = true;
    Ok(reply)
}

fn read_yes_no(input: &HandlerInput) -> Option<bool> {
    match consent::normalize_button(input.choice()).as_deref() {
        Some("1") => return Some(true),
        Some("2") => return Some(false),
        _ => {}
    }
    if crate::text::normalize(input.choice()) == "no es otra cosa" {
        return Some(false);
    }
    consent::interpret_yes_no(input.choice())
}
