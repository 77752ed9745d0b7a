//! Gmail REST API response types, trimmed to the fields the sync pipeline reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

impl MessageRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            thread_id: None,
        }
    }
}

/// One page of `users.messages.list`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageListPage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub messages: Vec<MessageRef>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub result_size_estimate: Option<u64>,
}

/// A message fetched with `format=full`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub label_ids: Vec<String>,
    #[serde(default, deserialize_with = "epoch_millis")]
    pub internal_date: i64,
    #[serde(default)]
    pub payload: MessagePart,
}

impl RemoteMessage {
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.internal_date).unwrap_or_default()
    }

    /// Top-level MIME parts: the first is the body, the rest are attachments.
    pub fn top_level_parts(&self) -> &[MessagePart] {
        &self.payload.parts
    }
}

/// A node of the MIME tree. Containers carry `parts`, leaves carry `body`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub part_id: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: Option<PartBody>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub parts: Vec<MessagePart>,
}

impl MessagePart {
    pub fn container(parts: Vec<MessagePart>) -> Self {
        Self {
            mime_type: Some("multipart/mixed".into()),
            parts,
            ..Default::default()
        }
    }

    /// A leaf whose body data is already base64url encoded.
    pub fn leaf(data: Option<&str>) -> Self {
        Self {
            mime_type: Some("text/plain".into()),
            body: Some(PartBody {
                data: data.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn attachment(filename: &str, attachment_id: &str) -> Self {
        Self {
            mime_type: Some("application/octet-stream".into()),
            filename: Some(filename.to_string()),
            body: Some(PartBody {
                attachment_id: Some(attachment_id.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn is_container(&self) -> bool {
        !self.parts.is_empty()
    }

    /// Encoded body data; an empty string counts as absent.
    pub fn data(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .filter(|d| !d.is_empty())
    }

    pub fn attachment_id(&self) -> Option<&str> {
        self.body.as_ref().and_then(|b| b.attachment_id.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// Gmail sends internalDate as a decimal string.
fn epoch_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Text(String),
        Number(i64),
    }

    match Option::<Millis>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Millis::Number(n)) => Ok(n),
        Some(Millis::Text(s)) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
