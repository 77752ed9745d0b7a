//! Gmail REST client and the provider seams the sync pipeline is written against.
pub mod model;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::errors::{AppError, AppResult};
use crate::oauth::{Credential, CredentialService};

pub use model::{Header, MessageListPage, MessagePart, MessageRef, PartBody, RemoteMessage};

/// Calls a sync run needs from the mail provider. Implementations are shared by
/// every concurrent task of a run.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn list_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
    ) -> AppResult<MessageListPage>;

    async fn get_message(&self, message_id: &str) -> AppResult<RemoteMessage>;
}

/// Builds a provider client bound to one mailbox owner's credential.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn client_for(&self, user_id: i64) -> AppResult<Arc<dyn MailProvider>>;
}

pub struct GmailClient {
    http: reqwest::Client,
    base: Url,
    access_token: String,
    page_size: Option<u32>,
}

impl GmailClient {
    pub fn new(
        http: reqwest::Client,
        base: Url,
        credential: &Credential,
        page_size: Option<u32>,
    ) -> Self {
        Self {
            http,
            base,
            access_token: credential.access_token.clone(),
            page_size,
        }
    }

    fn messages_url(&self) -> AppResult<Url> {
        self.base
            .join("users/me/messages")
            .map_err(|e| AppError::Config(format!("invalid Gmail API base {}: {e}", self.base)))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> AppResult<T> {
        let res = self
            .http
            .get(url.clone())
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| AppError::Network(format!("GET {}: {e}", url.path())))?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(AppError::AuthExpired);
        }
        if !status.is_success() {
            return Err(AppError::Network(format!(
                "GET {} failed with status {status}",
                url.path()
            )));
        }

        res.json::<T>()
            .await
            .map_err(|e| AppError::Network(format!("decoding {}: {e}", url.path())))
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn list_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
    ) -> AppResult<MessageListPage> {
        let mut url = self.messages_url()?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", query);
            if let Some(size) = self.page_size {
                pairs.append_pair("maxResults", &size.to_string());
            }
            if let Some(token) = page_token {
                pairs.append_pair("pageToken", token);
            }
        }
        debug!(query, has_token = page_token.is_some(), "Listing messages");
        self.get_json(url).await
    }

    async fn get_message(&self, message_id: &str) -> AppResult<RemoteMessage> {
        let mut url = self.messages_url()?;
        url.path_segments_mut()
            .map_err(|_| AppError::Config("Gmail API base cannot carry a path".into()))?
            .push(message_id);
        url.query_pairs_mut().append_pair("format", "full");
        self.get_json(url).await
    }
}

/// Resolves the owner's credential and returns a client isolated to that user.
pub struct GmailClientFactory {
    http: reqwest::Client,
    base: Url,
    page_size: Option<u32>,
    credentials: Arc<dyn CredentialService>,
}

impl GmailClientFactory {
    pub fn new(
        base: Url,
        page_size: Option<u32>,
        timeout: Duration,
        credentials: Arc<dyn CredentialService>,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("building HTTP client: {e}")))?;
        Ok(Self {
            http,
            base,
            page_size,
            credentials,
        })
    }
}

#[async_trait]
impl ClientFactory for GmailClientFactory {
    async fn client_for(&self, user_id: i64) -> AppResult<Arc<dyn MailProvider>> {
        let credential = self
            .credentials
            .resolve_credential(user_id)
            .await?
            .ok_or(AppError::MissingCredential(user_id))?;
        if credential.is_expired_at(Utc::now()) {
            return Err(AppError::AuthExpired);
        }
        debug!(user = user_id, expires_at = ?credential.expires_at, "Resolved credential");
        Ok(Arc::new(GmailClient::new(
            self.http.clone(),
            self.base.clone(),
            &credential,
            self.page_size,
        )))
    }
}
