use std::collections::HashSet;

use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::gmail::{MailProvider, MessageRef};

/// Provider search restricting the listing to messages that carry attachments.
pub const ATTACHMENT_QUERY: &str = "has:attachment";

/// Lists every message matching [`ATTACHMENT_QUERY`], following continuation
/// tokens until the provider stops returning one. Any failed page aborts the
/// whole listing.
pub async fn list_messages_with_attachments(
    client: &dyn MailProvider,
) -> AppResult<Vec<MessageRef>> {
    let mut seen = HashSet::new();
    let mut seen_tokens = HashSet::new();
    let mut messages = Vec::new();
    let mut page_token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = client
            .list_messages(ATTACHMENT_QUERY, page_token.as_deref())
            .await?;
        pages += 1;

        for message in page.messages {
            if seen.insert(message.id.clone()) {
                messages.push(message);
            }
        }

        match page.next_page_token {
            Some(next) if !next.is_empty() => {
                if !seen_tokens.insert(next.clone()) {
                    return Err(AppError::Network(format!(
                        "provider returned page token {next} twice"
                    )));
                }
                page_token = Some(next);
            }
            _ => break,
        }
    }

    debug!(pages, messages = messages.len(), "Listed messages with attachments");
    Ok(messages)
}
