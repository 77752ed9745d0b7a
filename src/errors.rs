use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Auth expired for account")]
    AuthExpired,
    #[error("No credential available for user {0}")]
    MissingCredential(i64),
    #[error("Fetching message {message_id} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        message_id: String,
        attempts: u32,
        #[source]
        source: Box<AppError>,
    },
    #[error("Config error: {0}")]
    Config(String),
    #[error("Sync cancelled")]
    Cancelled,
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}
