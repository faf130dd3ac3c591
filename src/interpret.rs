//! Need interpretation: free text → canonical profession and city.
//!
//! The catalog direct match always wins; the LLM runs only on a miss, and
//! its answer is normalized and resolved against the catalog one more time
//! so the result is always a known canonical. A separate classifier
//! enforces the need-vs-bare-profession distinction.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::catalog::{self, ServiceCatalog};
use crate::llm::{extract_json_object, ChatRequest, LlmClient};

/// Confidence threshold above which a "bare profession" verdict is trusted.
const PROFESSION_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Longest input forwarded to the LLM prompts.
const MAX_PROMPT_INPUT: usize = 300;

const EXTRACT_SERVICE_SYSTEM_PROMPT: &str = "\
Eres un experto en servicios profesionales. Tu tarea es identificar el servicio que necesita el usuario.

IMPORTANTE:
- Detecta el servicio más específico posible, NUNCA generalices
- \"pliegos de contratación pública\" NO debe convertirse en \"consultor\"
- Si el usuario menciona \"bug en página web\", responde \"desarrollador web\"
- Si menciona \"problema con base de datos\", responde \"administrador de base de datos\"
- Términos en inglés como \"community manager\" o \"developer\" son válidos

Responde SOLO con el nombre del servicio, sin explicaciones.";

const NEED_DETECTION_SYSTEM_PROMPT: &str = "\
Eres un experto en análisis de intención de búsqueda de servicios.

Tu tarea es detectar si el usuario está:
A) Pidiendo un PROFESIONAL (ej: \"busco médico\", \"necesito abogado\", \"quiero un plomero\")
B) Describiendo un PROBLEMA/NECESIDAD (ej: \"tengo dolor de espalda\", \"mi tubería gotea\")

REGLAS:
- Si el usuario menciona la profesión SIN describir el problema = PROFESIÓN
- Si el usuario describe síntomas, necesidades, problemas = NO ES PROFESIÓN (aunque mencione la profesión)
- \"necesito un médico para dolor de espalda\" = NO ES PROFESIÓN (tiene descripción del problema)
- \"busco médico\" = ES PROFESIÓN (sin descripción del problema)

Responde SOLO con JSON:
{
  \"es_profesion\": true/false,
  \"confianza\": 0.0-1.0
}";

/// Interpreter over the catalog and an optional LLM client.
pub struct NeedInterpreter {
    catalog: Arc<ServiceCatalog>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl NeedInterpreter {
    /// Create an interpreter. Without an LLM only catalog matches resolve.
    pub fn new(catalog: Arc<ServiceCatalog>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { catalog, llm }
    }

    /// Extract the canonical profession from free text.
    ///
    /// Catalog lookup first; on miss the LLM names the most specific
    /// service and the answer is catalog-resolved again. Returns `None`
    /// when neither path produces a known canonical (the caller re-asks
    /// the user — interpretation fails closed).
    pub async fn extract_profession(&self, text: &str) -> Option<String> {
        if text.trim().is_empty() {
            return None;
        }

        if let Some(canonical) = self.catalog.resolve_profession(text).await {
            debug!(canonical, "profession resolved by catalog");
            return Some(canonical);
        }

        let llm = self.llm.as_ref()?;
        let clipped = clip(text);
        let request = ChatRequest::new(
            EXTRACT_SERVICE_SYSTEM_PROMPT,
            format!("¿Qué servicio necesita este usuario: \"{clipped}\""),
        )
        .max_tokens(50);

        let answer = match llm.complete(request).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "service extraction llm call failed");
                return None;
            }
        };

        let cleaned = answer.trim().trim_matches(|c: char| c == '"' || c == '\'').trim();
        if cleaned.is_empty() {
            return None;
        }

        let resolved = self.catalog.resolve_profession(cleaned).await;
        match &resolved {
            Some(canonical) => info!(answer = cleaned, canonical, "profession resolved via llm"),
            None => debug!(answer = cleaned, "llm service name not in catalog"),
        }
        resolved
    }

    /// Extract a canonical city from free text.
    ///
    /// Synonym-table lookup first; on miss a restricted LLM prompt over
    /// the allowed city list. Anything outside the list is rejected.
    pub async fn extract_city(&self, text: &str) -> Option<String> {
        if text.trim().is_empty() {
            return None;
        }

        if let Some(city) = catalog::resolve_city(text) {
            return Some(city);
        }

        let llm = self.llm.as_ref()?;
        let cities = catalog::all_cities();
        let cities_list = cities.join(", ");
        let clipped = clip(text);

        let system = format!(
            "Eres un experto en identificar ciudades de Ecuador. Tu tarea es extraer LA CIUDAD mencionada en el texto.\n\n\
Ciudades válidas: {cities_list}\n\n\
Reglas:\n\
1. Responde SOLO con el nombre de la ciudad si está en la lista\n\
2. Si no se menciona ninguna ciudad válida, responde \"null\"\n\
3. Normaliza el nombre (ej: \"quito\" → \"Quito\")\n\n\
Responde SOLO con el nombre de la ciudad o \"null\", sin explicaciones."
        );
        let request = ChatRequest::new(
            system,
            format!("¿Qué ciudad de Ecuador se menciona en: \"{clipped}\""),
        )
        .max_tokens(30);

        let answer = match llm.complete(request).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "city extraction llm call failed");
                return None;
            }
        };

        let cleaned = answer.trim().trim_matches(|c: char| c == '"' || c == '\'').trim();
        if cleaned.is_empty() || cleaned.eq_ignore_ascii_case("null") {
            return None;
        }
        // Accept only list members, via the same resolver users go through.
        catalog::resolve_city(cleaned)
    }

    /// Whether `text` expresses a need or problem rather than a bare
    /// profession label.
    ///
    /// Empty input is never a need. An unavailable or low-confidence LLM
    /// fails open to `true` so real needs are never blocked by an outage.
    pub async fn is_need_or_problem(&self, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }

        let Some(llm) = &self.llm else {
            return true;
        };

        let request = ChatRequest::new(NEED_DETECTION_SYSTEM_PROMPT, clip(text))
            .max_tokens(50)
            .temperature(0.0)
            .json();

        let raw = match llm.complete(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "need detection llm call failed, assuming need");
                return true;
            }
        };

        let Some(parsed) = extract_json_object(&raw) else {
            warn!("unparseable need detection response, assuming need");
            return true;
        };

        let is_profession = parsed
            .get("es_profesion")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let confidence = parsed
            .get("confianza")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);

        debug!(is_profession, confidence, "need detection verdict");
        !(is_profession && confidence >= PROFESSION_CONFIDENCE_THRESHOLD)
    }
}

fn clip(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX_PROMPT_INPUT) {
        Some((idx, _)) => trimmed
            .get(..idx)
            .unwrap_or(trimmed)
            .to_owned(),
        None => trimmed.to_owned(),
    }
}
