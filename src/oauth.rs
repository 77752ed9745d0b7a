use crate::errors::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{AuthUrl, ClientId, ClientSecret, RefreshToken, TokenResponse, TokenUrl};
use std::env;
use tracing::{debug, warn};

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const SERVICE_NAME: &str = "refile-google-oauth";

/// An access token usable against the Gmail API.
#[derive(Clone, Debug)]
pub struct Credential {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: None,
        }
    }

    /// A credential without a known lifetime never counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Resolves the credential of one mailbox owner. `None` means the user never
/// granted access (or the grant was revoked).
#[async_trait]
pub trait CredentialService: Send + Sync {
    async fn resolve_credential(&self, user_id: i64) -> AppResult<Option<Credential>>;
}

/// Refresh tokens live in the OS keyring; each resolution exchanges the stored
/// refresh token for a fresh access token. The OAuth client settings
/// (`GOOGLE_CLIENT_ID`, `GOOGLE_CLIENT_SECRET`) are only read once a stored
/// token has to be exchanged.
#[derive(Debug, Default)]
pub struct KeyringCredentialService;

impl KeyringCredentialService {
    pub fn new() -> Self {
        Self
    }

    /// Stores a refresh token obtained out of band for `user_id`.
    pub fn store_refresh_token(&self, user_id: i64, refresh_token: &str) -> AppResult<()> {
        TokenStore::for_user(user_id).save(refresh_token)
    }
}

#[async_trait]
impl CredentialService for KeyringCredentialService {
    async fn resolve_credential(&self, user_id: i64) -> AppResult<Option<Credential>> {
        let store = TokenStore::for_user(user_id);
        let Some(stored) = store.load()? else {
            debug!(user = user_id, "No refresh token stored");
            return Ok(None);
        };

        let client = build_client(&load_credentials()?)?;
        let refresh = RefreshToken::new(stored.refresh_token);
        let res = client
            .exchange_refresh_token(&refresh)
            .request_async(async_http_client)
            .await;
        match res {
            Ok(token_res) => Ok(Some(Credential {
                access_token: token_res.access_token().secret().to_string(),
                expires_at: token_res.expires_in().map(|d| {
                    Utc::now() + Duration::from_std(d).unwrap_or_else(|_| Duration::seconds(0))
                }),
            })),
            Err(err) => {
                warn!(user = user_id, "Refresh token invalid or expired: {err}");
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct InstalledCreds {
    client_id: String,
    client_secret: String,
}

fn load_credentials() -> AppResult<InstalledCreds> {
    let id = env::var("GOOGLE_CLIENT_ID")
        .map_err(|_| AppError::Config("GOOGLE_CLIENT_ID missing".into()))?;
    let secret = env::var("GOOGLE_CLIENT_SECRET")
        .map_err(|_| AppError::Config("GOOGLE_CLIENT_SECRET missing".into()))?;
    Ok(InstalledCreds {
        client_id: id,
        client_secret: secret,
    })
}

fn build_client(creds: &InstalledCreds) -> AppResult<BasicClient> {
    let auth_url = AuthUrl::new(AUTH_URL.to_string())
        .map_err(|e| AppError::Config(format!("invalid auth url: {e}")))?;
    let token_url = TokenUrl::new(TOKEN_URL.to_string())
        .map_err(|e| AppError::Config(format!("invalid token url: {e}")))?;

    Ok(BasicClient::new(
        ClientId::new(creds.client_id.clone()),
        Some(ClientSecret::new(creds.client_secret.clone())),
        auth_url,
        Some(token_url),
    )
    .set_auth_type(oauth2::AuthType::RequestBody))
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoredToken {
    refresh_token: String,
}

struct TokenStore {
    key: String,
}

impl TokenStore {
    fn for_user(user_id: i64) -> Self {
        Self {
            key: format!("user-{user_id}"),
        }
    }

    fn load(&self) -> AppResult<Option<StoredToken>> {
        match self.load_keyring() {
            Ok(tok) => Ok(tok),
            Err(e) => {
                warn!("Keyring unavailable: {e}");
                Ok(None)
            }
        }
    }

    fn save(&self, refresh: &str) -> AppResult<()> {
        let token = StoredToken {
            refresh_token: refresh.to_string(),
        };
        let serialized =
            serde_json::to_string(&token).map_err(|e| AppError::Unexpected(format!("{e}")))?;
        self.save_keyring(&serialized).map_err(AppError::Config)
    }

    fn load_keyring(&self) -> Result<Option<StoredToken>, String> {
        let entry = keyring::Entry::new(SERVICE_NAME, &self.key)
            .map_err(|e| format!("keyring entry error: {e}"))?;
        match entry.get_password() {
            Ok(pwd) => serde_json::from_str(&pwd)
                .map(Some)
                .map_err(|e| format!("keyring token decode: {e}")),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(format!("keyring read: {e}")),
        }
    }

    fn save_keyring(&self, serialized: &str) -> Result<(), String> {
        let entry = keyring::Entry::new(SERVICE_NAME, &self.key)
            .map_err(|e| format!("keyring entry error: {e}"))?;
        entry
            .set_password(serialized)
            .map_err(|e| format!("keyring write: {e}"))
    }
}
