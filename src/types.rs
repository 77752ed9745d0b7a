use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user-defined category. `pattern` is the matching rule handed to the categorizer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub name: String,
    pub pattern: String,
}

impl Category {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
        }
    }
}

/// Owner of a remote mailbox and of the attachment inventory synced from it.
#[derive(Clone, Debug)]
pub struct MailboxUser {
    pub user_id: i64,
    pub email: String,
    pub categories: Vec<Category>,
    pub attachments: Vec<Attachment>,
}

impl MailboxUser {
    pub fn new(user_id: i64, email: impl Into<String>, categories: Vec<Category>) -> Self {
        Self {
            user_id,
            email: email.into(),
            categories,
            attachments: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub user_id: i64,
    pub g_id: String, // provider attachment id
    pub name: String,
    pub extension: String,
    pub sender: String,
    pub subject: String,
    pub created_at: DateTime<Utc>,
    pub label_ids: BTreeSet<String>,
    pub categories: BTreeSet<String>,
}

/// Newest first; equal timestamps fall back to `g_id` so the order is stable across runs.
pub fn sort_by_recency(attachments: &mut [Attachment]) {
    attachments.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.g_id.cmp(&b.g_id))
    });
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
