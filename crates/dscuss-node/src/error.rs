use thiserror::Error;

use dscuss_net::NetError;
use dscuss_shared::{CryptoError, EntityError, SubsError};
use dscuss_store::StoreError;

/// Errors surfaced to whoever drives a [`crate::Dscuss`] instance.
#[derive(Error, Debug)]
pub enum DscussError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Parsing error: {0}")]
    Parsing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("No such entity")]
    NoSuchEntity,

    #[error("Wrong nickname: {0}")]
    WrongNickname(String),

    #[error("Already logged in")]
    AlreadyLoggedIn,

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("User '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("No such user: {0}")]
    NoSuchUser(String),

    #[error("Wrong arguments: {0}")]
    WrongArguments(String),

    #[error("User is already a moderator")]
    AlreadyModerator,

    #[error("User is not a moderator")]
    NoSuchModerator,

    #[error("Forbidden operation")]
    ForbiddenOperation,

    #[error("Already subscribed to '{0}'")]
    AlreadySubscribed(String),

    #[error("Not subscribed to '{0}'")]
    NotSubscribed(String),
}

impl DscussError {
    /// Whether the error was caused by bad owner input rather than a failure
    /// of the node itself.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            DscussError::WrongNickname(_)
                | DscussError::WrongArguments(_)
                | DscussError::AlreadyRegistered(_)
                | DscussError::NoSuchUser(_)
                | DscussError::AlreadySubscribed(_)
                | DscussError::NotSubscribed(_)
                | DscussError::AlreadyModerator
                | DscussError::NoSuchModerator
                | DscussError::ForbiddenOperation
        )
    }
}

impl From<StoreError> for DscussError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NoSuchEntity => DscussError::NoSuchEntity,
            StoreError::AlreadyModerator => DscussError::AlreadyModerator,
            StoreError::NoSuchModerator => DscussError::NoSuchModerator,
            StoreError::ForbiddenOperation => DscussError::ForbiddenOperation,
            StoreError::Io(e) => DscussError::Filesystem(e.to_string()),
            other => DscussError::Database(other.to_string()),
        }
    }
}

impl From<EntityError> for DscussError {
    fn from(e: EntityError) -> Self {
        match e {
            EntityError::WrongArguments(reason) => DscussError::WrongArguments(reason),
            other => DscussError::Internal(other.to_string()),
        }
    }
}

impl From<SubsError> for DscussError {
    fn from(e: SubsError) -> Self {
        DscussError::WrongArguments(e.to_string())
    }
}

impl From<CryptoError> for DscussError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::KeyFile(reason) => DscussError::Filesystem(reason),
            e @ CryptoError::PowDifficulty(_) => DscussError::Config(e.to_string()),
            other => DscussError::Internal(other.to_string()),
        }
    }
}

impl From<NetError> for DscussError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::Store(e) => e.into(),
            other => DscussError::Network(other.to_string()),
        }
    }
}

impl From<std::io::Error> for DscussError {
    fn from(e: std::io::Error) -> Self {
        DscussError::Filesystem(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DscussError>;
