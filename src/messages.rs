//! Message catalog: every user-facing text the bot sends.
//!
//! Copy is data, not code. Handlers pick a builder from here and never
//! format their own strings, so wording changes stay in one place.

use crate::search::ProviderSummary;

/// Initial prompt asking the customer to describe their need.
pub const INITIAL_SERVICE_PROMPT: &str = "*Cuéntame, ¿qué servicio necesitas hoy?*";

/// Footer instructing the user to reply with a number.
pub const NUMERIC_REPLY_FOOTER: &str = "*Responde con el número de tu opción:*";

/// Immediate acknowledgement while the search runs in the background.
pub const SEARCHING_ACK: &str =
    "⏳ *Estoy confirmando disponibilidad con proveedores y te aviso en breve.*";

/// Notice sent when a session is restarted (reset keyword or inactivity).
pub const NEW_SESSION_NOTICE: &str = "Nueva sesión iniciada.";

/// Farewell when the customer exits the confirmation menu.
pub const FAREWELL: &str = "¡Gracias por usar el servicio! Escríbeme cuando necesites algo más.";

/// Reply for invalid short/numeric/one-letter service input.
pub const INVALID_SERVICE_INPUT: &str =
    "No entendí tu solicitud. Cuéntame con una frase corta qué necesitas (ej: \"tengo una fuga en el baño\").";

/// Reply when the interpreter could not map the text to a service.
pub const REFORMULATE_REQUEST: &str =
    "No logré identificar el servicio que necesitas. ¿Puedes describirlo de otra forma?";

/// Reply when the content gate classifies the input as nonsense.
pub const NONSENSE_INPUT: &str =
    "Tu mensaje no parece describir una necesidad de servicio. Por favor reformúlalo contándome qué necesitas.";

/// First-strike warning for illegal or inappropriate content.
pub const CONTENT_WARNING: &str =
    "⚠️ Tu mensaje contiene contenido no permitido. Este es un aviso: una segunda infracción suspenderá temporalmente tu cuenta.";

/// Generic fallback when something failed downstream.
pub const TRY_AGAIN: &str =
    "Tuvimos un inconveniente procesando tu mensaje. Por favor inténtalo de nuevo.";

/// Consent option labels, in menu order.
pub const CONSENT_OPTIONS: [&str; 2] = ["Acepto", "No acepto"];

/// Label for the "search for another service" option.
pub const SEARCH_AGAIN_OPTION: &str = "Buscar otro servicio";

/// Title of the repeat-search confirmation menu.
pub const CONFIRM_SEARCH_TITLE: &str = "¿Te ayudo con otro servicio?";

/// Data-sharing consent prompt (first of the two consent messages).
pub const CONSENT_PROMPT: &str = "¡Hola! Soy tu asistente virtual para encontrar servicios confiables de forma rápida y segura.\n\n\
Para poder conectarte con proveedores de servicios, necesito tu consentimiento para compartir tus datos de contacto únicamente con los profesionales seleccionados.\n\n\
📋 *Información que compartiremos:*\n\
• Tu número de teléfono\n\
• Ciudad donde necesitas el servicio\n\
• Tipo de servicio que solicitas\n\n\
🔒 *Tus datos están seguros y solo se usan para esta consulta.*\n\n\
*¿Aceptas compartir tus datos con proveedores?*";

/// Reply after the customer declines consent.
pub const CONSENT_DECLINED: &str = "Entendido. Sin tu consentimiento no puedo compartir tus datos con proveedores.\n\n\
Si cambias de opinión, simplemente escribe \"hola\" y podremos empezar de nuevo.";

/// Second consent message: the numbered option menu.
pub fn consent_menu() -> String {
    format!(
        "{NUMERIC_REPLY_FOOTER}\n\n1) {}\n2) {}",
        CONSENT_OPTIONS[0], CONSENT_OPTIONS[1]
    )
}

/// Prompt asking for the serving city.
pub fn ask_city() -> String {
    "*¿En qué ciudad lo necesitas?*".to_owned()
}

/// City prompt contextualized with the confirmed service.
pub fn ask_city_for_service(service: &str) -> String {
    format!("Entendido, para {service} ¿en qué ciudad lo necesitas? (ejemplo: Quito, Cuenca)")
}

/// Error when the city could not be resolved against the synonym table.
pub fn city_not_recognized() -> String {
    "No reconocí la ciudad. Escríbela de nuevo usando una ciudad de Ecuador (ej: Quito, Guayaquil, Cuenca)."
        .to_owned()
}

/// Confirmation prompt for a detected service candidate.
pub fn confirm_service(candidate: &str) -> String {
    format!("Entiendo que buscas *{candidate}*. ¿Es correcto?\n\n1) Sí\n2) No, es otra cosa")
}

/// Session-restart notice after an inactivity timeout.
pub fn session_restarted() -> String {
    "Tu sesión anterior expiró por inactividad, así que empecemos de nuevo.".to_owned()
}

/// Ban notice with the formatted resume time (`HH:MM` UTC).
pub fn ban_notice(resume_at: &str) -> String {
    format!(
        "🚫 Tu cuenta está temporalmente suspendida por contenido no permitido. Podrás volver a escribir a las {resume_at}."
    )
}

/// Intro line above the provider list.
pub fn results_intro(city: &str) -> String {
    if city.is_empty() {
        "**Encontré estas opciones para ti:**".to_owned()
    } else {
        format!("**Encontré estas opciones en {city}:**")
    }
}

/// Compact numbered provider list (names only, at most five rows).
pub fn results_block(providers: &[ProviderSummary]) -> String {
    let mut lines = vec![String::new()];
    for (idx, provider) in providers.iter().take(5).enumerate() {
        let row = idx.saturating_add(1);
        lines.push(format!("{row}) {}", provider.full_name.trim()));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Instruction under the provider list.
pub const SELECT_PROVIDER_INSTRUCTION: &str =
    "**Responde con el número del proveedor para ver detalles.**";

/// Full provider list message: intro, block and selection instruction.
pub fn results_message(city: &str, providers: &[ProviderSummary]) -> String {
    format!(
        "{}\n\n{}\n{SELECT_PROVIDER_INSTRUCTION}",
        results_intro(city),
        results_block(providers)
    )
}

/// Empty-result message for a city.
pub fn no_results(city: &str) -> String {
    format!(
        "{}\n\n    -- No tenemos aún proveedores --\n",
        results_intro(city)
    )
}

/// Message when no probed provider accepted within the deadline.
pub fn no_availability(service: &str, city: &str) -> String {
    let target = if service.is_empty() {
        "este servicio".to_owned()
    } else {
        format!("**{service}**")
    };
    let place = if city.is_empty() {
        String::new()
    } else {
        format!(" en **{city}**")
    };
    format!(
        "No hay proveedores disponibles ahora mismo para {target}{place}. ¿Quieres buscar en otra ciudad o intentarlo más tarde?"
    )
}

/// Detailed provider card shown when a list entry is selected.
pub fn provider_detail(provider: &ProviderSummary) -> String {
    let mut lines = vec![String::new(), format!("**{}**", provider.full_name.trim())];

    if let Some(profession) = provider
        .profession
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        lines.push(format!("Profesión: {}", prettify(profession)));
    }
    if let Some(city) = provider
        .city
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
    {
        lines.push(format!("Ubicación: {}", prettify(city)));
    }
    if provider.experience_years > 0 {
        lines.push(format!("Experiencia: {} año(s)", provider.experience_years));
    }
    if !provider.services.is_empty() {
        lines.push("Servicios:".to_owned());
        for service in &provider.services {
            lines.push(format!("• {}", prettify(service)));
        }
    }
    if let (Some(url), kind) = (
        provider.social_media_url.as_deref(),
        provider.social_media_type.as_deref(),
    ) {
        match kind {
            Some(kind) => lines.push(format!("Redes: {kind}: {url}")),
            None => lines.push(format!("Redes: {url}")),
        }
    }
    if provider.rating > 0.0 {
        lines.push(format!("Calificación: {:.1}", provider.rating));
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Action menu under the provider detail card.
pub fn provider_detail_menu() -> String {
    format!(
        "{NUMERIC_REPLY_FOOTER}\n\n1) Seleccionar a este proveedor\n2) Regresar al listado de proveedores\n3) Salir"
    )
}

/// Numbered options of the confirm-new-search menu.
pub fn confirm_search_menu(include_city_option: bool) -> String {
    if include_city_option {
        format!("1) Buscar en otra ciudad\n2) {SEARCH_AGAIN_OPTION}\n3) Salir\n")
    } else {
        format!("1) {SEARCH_AGAIN_OPTION}\n2) Salir\n")
    }
}

/// Title plus menu for the confirm-new-search state.
pub fn confirm_search_message(include_city_option: bool) -> String {
    format!(
        "**{CONFIRM_SEARCH_TITLE}**\n\n{}",
        confirm_search_menu(include_city_option)
    )
}

/// Availability probe sent to a candidate provider.
pub fn availability_probe(name: &str, service: &str, city: Option<&str>, code: &str) -> String {
    let who = if name.is_empty() { "proveedor" } else { name };
    let place = match city {
        Some(city) if !city.is_empty() => format!(" en {city}"),
        _ => String::new(),
    };
    format!(
        "Hola {who}, ¿estás disponible para una solicitud de {service}{place}?\n\n\
Responde:\n1) Sí, estoy disponible\n2) No disponible\n\nCódigo: {code}"
    )
}

/// Connection handoff copy: name line, photo line, chat line, closing line.
pub fn connection_text(name: &str, has_photo: bool, chat_link: Option<&str>) -> String {
    let photo_line = if has_photo {
        "📸 Selfie adjunta."
    } else {
        "📸 Selfie no disponible por el momento."
    };
    let link_line = match chat_link {
        Some(link) => format!("🔗 Abrir chat: {link}"),
        None => "🔗 Chat disponible via WhatsApp.".to_owned(),
    };
    format!(
        "Proveedor asignado: {name}.\n{photo_line}\n{link_line}\n\n💬 Chat abierto para coordinar tu servicio."
    )
}

fn prettify(text: &str) -> String {
    let trimmed = text.trim();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => format!("{}{}", first.to_uppercase(), chars.as_str()),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ProviderSummary;

    fn provider(name: &str) -> ProviderSummary {
        ProviderSummary {
            full_name: name.to_owned(),
            ..ProviderSummary::default()
        }
    }

    #[test]
    fn test_results_block_caps_at_five() {
        let providers: Vec<ProviderSummary> = (1..=7)
            .map(|i| provider(&format!("Proveedor {i}")))
            .collect();
        let block = results_block(&providers);
        assert!(block.contains("5) Proveedor 5"));
        assert!(!block.contains("6) Proveedor 6"));
    }

    #[test]
    fn test_availability_probe_includes_code_and_city() {
        let msg = availability_probe("Ana", "plomero", Some("Quito"), "A1B2C3");
        assert!(msg.contains("Hola Ana"));
        assert!(msg.contains("plomero en Quito"));
        assert!(msg.contains("Código: A1B2C3"));
        assert!(msg.contains("1) Sí, estoy disponible"));
    }

    #[test]
    fn test_availability_probe_without_city_or_name() {
        let msg = availability_probe("", "electricista", None, "XYZ999");
        assert!(msg.contains("Hola proveedor"));
        assert!(msg.contains("solicitud de electricista?"));
    }

    #[test]
    fn test_connection_text_variants() {
        let with_link = connection_text("Ana", true, Some("https://wa.me/593987654321"));
        assert!(with_link.starts_with("Proveedor asignado: Ana."));
        assert!(with_link.contains("Selfie adjunta"));
        assert!(with_link.contains("https://wa.me/593987654321"));

        let without = connection_text("Luis", false, None);
        assert!(without.contains("Selfie no disponible"));
        assert!(without.contains("Chat disponible via WhatsApp."));
    }

    #[test]
    fn test_confirm_search_menu_city_option() {
        assert!(confirm_search_menu(true).contains("Buscar en otra ciudad"));
        assert!(!confirm_search_menu(false).contains("Buscar en otra ciudad"));
    }

    #[test]
    fn test_provider_detail_skips_missing_fields() {
        let card = provider_detail(&provider("Ana"));
        assert!(card.contains("**Ana**"));
        assert!(!card.contains("Profesión"));
        assert!(!card.contains("Calificación"));
    }
}
