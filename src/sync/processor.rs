use std::collections::BTreeSet;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use tracing::{debug, warn};

use crate::categorize::CategorizationService;
use crate::gmail::{MessagePart, RemoteMessage};
use crate::types::{Attachment, Category};

// Gmail encodes part bodies as base64url; padding is present on some parts only.
const BODY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub sender: Option<String>,
    pub subject: Option<String>,
}

/// Single pass over the payload headers. Names match exactly; a repeated
/// header keeps its last value.
pub fn extract_metadata(message: &RemoteMessage) -> MessageMetadata {
    let mut meta = MessageMetadata::default();
    for header in &message.payload.headers {
        match header.name.as_str() {
            "From" => meta.sender = Some(header.value.clone()),
            "Subject" => meta.subject = Some(header.value.clone()),
            _ => {}
        }
    }
    meta
}

/// Body text of a part: descend through first children until a part carries
/// data. A dead-end chain falls through to the next sibling, so the result is
/// the first part with data in depth-first order, or `""` when there is none.
pub fn extract_body(part: &MessagePart) -> String {
    match find_body_data(part) {
        Some(data) => decode_body_data(data),
        None => String::new(),
    }
}

fn find_body_data(part: &MessagePart) -> Option<&str> {
    if let Some(data) = part.data() {
        return Some(data);
    }
    part.parts.iter().find_map(find_body_data)
}

fn decode_body_data(data: &str) -> String {
    match BODY_ENGINE.decode(data.trim()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(error = %e, "Undecodable body data; treating body as empty");
            String::new()
        }
    }
}

/// Everything after the first dot: `report.final.pdf` -> `final.pdf`, `noext` -> `""`.
pub fn file_extension(file_name: &str) -> &str {
    file_name
        .split_once('.')
        .map(|(_, ext)| ext)
        .unwrap_or("")
}

/// Turns one fully fetched message into attachment records. The first top-level
/// part is the body; every later top-level part becomes one attachment carrying
/// the union of the subject and body categories.
pub fn process_message(
    message: &RemoteMessage,
    user_id: i64,
    vocabulary: &[Category],
    categorizer: &dyn CategorizationService,
) -> Vec<Attachment> {
    let parts = message.top_level_parts();
    let Some((body_part, attachment_parts)) = parts.split_first() else {
        debug!(message = %message.id, "Message has no MIME parts; no attachments");
        return Vec::new();
    };

    let meta = extract_metadata(message);
    let sender = meta.sender.unwrap_or_default();
    let subject = meta.subject.unwrap_or_default();
    let body = extract_body(body_part);

    let mut categories = BTreeSet::new();
    if !subject.is_empty() {
        categories.extend(categorizer.extract_categories(&subject, vocabulary));
    }
    if !body.is_empty() {
        categories.extend(categorizer.extract_categories(&body, vocabulary));
    }

    let created_at = message.created_at();
    let label_ids: BTreeSet<String> = message.label_ids.iter().cloned().collect();

    attachment_parts
        .iter()
        .map(|part| {
            let name = part.filename.clone().unwrap_or_default();
            Attachment {
                user_id,
                g_id: part.attachment_id().unwrap_or_default().to_string(),
                extension: file_extension(&name).to_string(),
                name,
                sender: sender.clone(),
                subject: subject.clone(),
                created_at,
                label_ids: label_ids.clone(),
                categories: categories.clone(),
            }
        })
        .collect()
}
