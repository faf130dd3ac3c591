//! Connection handoff: the message delivering the chosen provider's
//! contact to the customer.
//!
//! Normalizes between messaging JIDs and dialable click-to-chat links and
//! attaches the provider photo when the resolver finds one.

use crate::media::{resolve_photo_url, ObjectStore};
use crate::messages;
use crate::search::ProviderSummary;
use crate::transport::OutboundMessage;

/// Build a `wa.me` click-to-chat link from a raw phone value.
///
/// `@c.us` suffixes and a leading `+` are stripped; `@lid` handles are not
/// dialable, so they yield no link at all.
pub fn whatsapp_link(raw_phone: &str) -> Option<String> {
    let trimmed = raw_phone.trim();
    if trimmed.is_empty() || trimmed.ends_with("@lid") {
        return None;
    }
    let bare = trimmed.strip_suffix("@c.us").unwrap_or(trimmed);
    let digits = bare.trim().trim_start_matches('+');
    if digits.is_empty() {
        return None;
    }
    Some(format!("https://wa.me/{digits}"))
}

/// Build the connection message for a chosen provider.
///
/// Resolves the photo through the object store fallback chain; when a
/// photo URL is found the message carries it as image media with the same
/// text as caption.
pub async fn connection_message(
    provider: &ProviderSummary,
    store: Option<&dyn ObjectStore>,
) -> OutboundMessage {
    let name = if provider.full_name.trim().is_empty() {
        "Proveedor"
    } else {
        provider.full_name.trim()
    };

    let contact = provider
        .real_phone
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .or(provider.phone.as_deref());
    let link = contact.and_then(whatsapp_link);

    let photo_url = match provider.face_photo_url.as_deref() {
        Some(raw) => resolve_photo_url(store, raw).await,
        None => None,
    };

    let text = messages::connection_text(name, photo_url.is_some(), link.as_deref());

    let mut message = OutboundMessage::text(text.clone());
    if let Some(url) = photo_url {
        message.media_url = Some(url);
        message.media_type = Some("image".to_owned());
        message.media_caption = Some(text);
    }
    message
}
