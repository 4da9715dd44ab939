
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetableError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("No {type_name} found with id {id}")]
    NotFound { type_name: String, id: i64 },
    #[error("Invalid reference: {0}")]
    InvalidReference(String),
    #[error("Data corruption: {message}")]
    DataCorruption { message: String },
    #[error("Unknown entity type: {0}")]
    UnknownType(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

impl MetableError {
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::DataCorruption { message: message.into() }
    }
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, MetableError>;

// Helper conversions
impl From<rusqlite::Error> for MetableError {
    fn from(e: rusqlite::Error) -> Self { Self::Persistence(e.to_string()) }
}
impl From<serde_json::Error> for MetableError {
    fn from(e: serde_json::Error) -> Self { Self::corrupt(e.to_string()) }
}
impl From<config::ConfigError> for MetableError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}
impl<T> From<std::sync::PoisonError<T>> for MetableError {
    fn from(e: std::sync::PoisonError<T>) -> Self { Self::Lock(e.to_string()) }
}
