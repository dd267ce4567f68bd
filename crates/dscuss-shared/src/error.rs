use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Signing failed")]
    SigningFailed,

    #[error("Invalid signature encoding")]
    InvalidSignature,

    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Key file error: {0}")]
    KeyFile(String),

    #[error("Proof-of-work search cancelled")]
    PowCancelled,

    #[error("Proof-of-work difficulty {0} is above the maximum of {max}", max = crate::constants::MAX_POW_DIFFICULTY)]
    PowDifficulty(u32),

    #[error("Proof-of-work hash failed: {0}")]
    PowHash(String),
}

#[derive(Error, Debug)]
pub enum EntityError {
    /// Owner-supplied content violates an entity constraint.
    #[error("Wrong arguments: {0}")]
    WrongArguments(String),

    #[error("Entity id does not match its contents")]
    IdMismatch,

    #[error("Entity signature does not verify")]
    BadSignature,

    #[error("Proof of work does not meet difficulty {0}")]
    InsufficientProof(u32),

    #[error("Unknown {kind} value: {value}")]
    UnknownEnumValue { kind: &'static str, value: String },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubsError {
    #[error("Empty topic")]
    EmptyTopic,

    #[error("Invalid tag '{0}': expected [a-z0-9_]+")]
    InvalidTag(String),

    #[error("Topic has {0} tags, at most {max} allowed", max = crate::constants::MAX_TOPIC_TAGS)]
    TooManyTags(usize),
}

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Wrong packet type: expected {expected}, got {actual}")]
    WrongPacketType { expected: String, actual: String },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Packet signature does not verify")]
    BadSignature,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<serde_json::Error> for PacketError {
    fn from(e: serde_json::Error) -> Self {
        PacketError::MalformedPayload(e.to_string())
    }
}
