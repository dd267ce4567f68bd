use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_OPERATION_COMMENT_LEN;
use crate::crypto::{PrivateKey, PublicKey, Signature};
use crate::error::EntityError;
use crate::types::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum OperationType {
    RemoveMessage,
    BanUser,
}

impl OperationType {
    pub fn code(self) -> i64 {
        match self {
            OperationType::RemoveMessage => 1,
            OperationType::BanUser => 2,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, EntityError> {
        match code {
            1 => Ok(OperationType::RemoveMessage),
            2 => Ok(OperationType::BanUser),
            other => Err(EntityError::UnknownEnumValue {
                kind: "operation type",
                value: other.to_string(),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::RemoveMessage => "remove_message",
            OperationType::BanUser => "ban_user",
        }
    }
}

impl From<OperationType> for i64 {
    fn from(t: OperationType) -> i64 {
        t.code()
    }
}

impl TryFrom<i64> for OperationType {
    type Error = EntityError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        OperationType::from_code(code)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = EntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remove_message" | "removemessage" | "remove" => Ok(OperationType::RemoveMessage),
            "ban_user" | "banuser" | "ban" => Ok(OperationType::BanUser),
            other => Err(EntityError::UnknownEnumValue {
                kind: "operation type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum Reason {
    ProtocolViolation,
    Spam,
    Offtopic,
    Abuse,
    Duplicate,
}

const REASONS: [(Reason, &str); 5] = [
    (Reason::ProtocolViolation, "protocol_violation"),
    (Reason::Spam, "spam"),
    (Reason::Offtopic, "offtopic"),
    (Reason::Abuse, "abuse"),
    (Reason::Duplicate, "duplicate"),
];

impl Reason {
    pub fn code(self) -> i64 {
        match self {
            Reason::ProtocolViolation => 1,
            Reason::Spam => 2,
            Reason::Offtopic => 3,
            Reason::Abuse => 4,
            Reason::Duplicate => 5,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, EntityError> {
        REASONS
            .iter()
            .map(|(r, _)| *r)
            .find(|r| r.code() == code)
            .ok_or_else(|| EntityError::UnknownEnumValue {
                kind: "reason",
                value: code.to_string(),
            })
    }

    pub fn as_str(self) -> &'static str {
        REASONS
            .iter()
            .find(|(r, _)| *r == self)
            .map(|(_, s)| *s)
            .unwrap_or("unknown")
    }
}

impl From<Reason> for i64 {
    fn from(r: Reason) -> i64 {
        r.code()
    }
}

impl TryFrom<i64> for Reason {
    type Error = EntityError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        Reason::from_code(code)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Reason {
    type Err = EntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        REASONS
            .iter()
            .find(|(_, name)| *name == s || name.replace('_', "") == s)
            .map(|(r, _)| *r)
            .ok_or(EntityError::UnknownEnumValue {
                kind: "reason",
                value: s,
            })
    }
}

/// A moderation action. Its effect is subjective: only nodes whose owner
/// trusts the author as a moderator apply it to their view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "OperationFields")]
pub struct Operation {
    id: Id,
    op_type: OperationType,
    reason: Reason,
    comment: String,
    author_id: Id,
    object_id: Id,
    date_performed: DateTime<Utc>,
    sig: Signature,
}

#[derive(Deserialize)]
struct OperationFields {
    id: Id,
    op_type: OperationType,
    reason: Reason,
    comment: String,
    author_id: Id,
    object_id: Id,
    date_performed: DateTime<Utc>,
    sig: Signature,
}

#[derive(Serialize)]
struct OperationContent<'a> {
    op_type: OperationType,
    reason: Reason,
    comment: &'a str,
    author_id: &'a Id,
    object_id: &'a Id,
    date_performed: &'a DateTime<Utc>,
}

#[derive(Serialize)]
struct Descriptor<'a> {
    kind: &'static str,
    id: &'a Id,
}

#[derive(Serialize)]
struct SignedOperation<'a> {
    descriptor: Descriptor<'a>,
    content: OperationContent<'a>,
}

impl Operation {
    pub fn emerge(
        key: &PrivateKey,
        op_type: OperationType,
        reason: Reason,
        comment: &str,
        author_id: Id,
        object_id: Id,
        date_performed: DateTime<Utc>,
    ) -> Result<Self, EntityError> {
        if comment.chars().count() > MAX_OPERATION_COMMENT_LEN {
            return Err(EntityError::WrongArguments(format!(
                "comment exceeds {MAX_OPERATION_COMMENT_LEN} characters"
            )));
        }
        if object_id.is_zero() {
            return Err(EntityError::WrongArguments("operation needs an object".into()));
        }

        let mut op = Self {
            id: Id::ZERO,
            op_type,
            reason,
            comment: comment.to_string(),
            author_id,
            object_id,
            date_performed,
            sig: Signature([0u8; crate::constants::SIGNATURE_SIZE]),
        };
        op.id = Id::digest(&serde_json::to_vec(&op.content())?);
        op.sig = key.sign(&op.signed_bytes()?)?;
        Ok(op)
    }

    /// Rebuild an operation and check that the id reproduces. The signature
    /// needs the author's key: see [`Operation::verify_sig`].
    #[allow(clippy::too_many_arguments)]
    pub fn new_from_fields(
        id: Id,
        op_type: OperationType,
        reason: Reason,
        comment: String,
        author_id: Id,
        object_id: Id,
        date_performed: DateTime<Utc>,
        sig: Signature,
    ) -> Result<Self, EntityError> {
        if comment.chars().count() > MAX_OPERATION_COMMENT_LEN {
            return Err(EntityError::WrongArguments("comment too long".into()));
        }
        let op = Self {
            id,
            op_type,
            reason,
            comment,
            author_id,
            object_id,
            date_performed,
            sig,
        };
        if !op.verify_id() {
            return Err(EntityError::IdMismatch);
        }
        Ok(op)
    }

    fn content(&self) -> OperationContent<'_> {
        OperationContent {
            op_type: self.op_type,
            reason: self.reason,
            comment: &self.comment,
            author_id: &self.author_id,
            object_id: &self.object_id,
            date_performed: &self.date_performed,
        }
    }

    fn signed_bytes(&self) -> Result<Vec<u8>, EntityError> {
        let signed = SignedOperation {
            descriptor: Descriptor {
                kind: "oper",
                id: &self.id,
            },
            content: self.content(),
        };
        Ok(serde_json::to_vec(&signed)?)
    }

    pub fn verify_id(&self) -> bool {
        match serde_json::to_vec(&self.content()) {
            Ok(bytes) => Id::digest(&bytes) == self.id,
            Err(_) => false,
        }
    }

    pub fn verify_sig(&self, author_key: &PublicKey) -> bool {
        match self.signed_bytes() {
            Ok(bytes) => author_key.verify(&bytes, &self.sig),
            Err(_) => false,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn op_type(&self) -> OperationType {
        self.op_type
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn author_id(&self) -> Id {
        self.author_id
    }

    pub fn object_id(&self) -> Id {
        self.object_id
    }

    pub fn date_performed(&self) -> DateTime<Utc> {
        self.date_performed
    }

    pub fn sig(&self) -> &Signature {
        &self.sig
    }
}

impl TryFrom<OperationFields> for Operation {
    type Error = EntityError;

    fn try_from(f: OperationFields) -> Result<Self, Self::Error> {
        Operation::new_from_fields(
            f.id,
            f.op_type,
            f.reason,
            f.comment,
            f.author_id,
            f.object_id,
            f.date_performed,
            f.sig,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now;

    fn ban(key: &PrivateKey) -> Operation {
        Operation::emerge(
            key,
            OperationType::BanUser,
            Reason::Spam,
            "spammer",
            Id::digest(b"moderator"),
            Id::digest(b"victim"),
            now(),
        )
        .unwrap()
    }

    #[test]
    fn test_emerge_and_verify() {
        let key = PrivateKey::generate();
        let op = ban(&key);
        assert!(op.verify_id());
        assert!(op.verify_sig(&key.public_key()));
        assert!(!op.verify_sig(&PrivateKey::generate().public_key()));
    }

    #[test]
    fn test_enum_codes() {
        assert_eq!(OperationType::from_code(1).unwrap(), OperationType::RemoveMessage);
        assert!(OperationType::from_code(9).is_err());
        assert_eq!(Reason::from_code(Reason::Duplicate.code()).unwrap(), Reason::Duplicate);
        assert!(Reason::from_code(0).is_err());
        assert_eq!("offtopic".parse::<Reason>().unwrap(), Reason::Offtopic);
        assert_eq!("ProtocolViolation".parse::<Reason>().unwrap(), Reason::ProtocolViolation);
        assert_eq!("ban".parse::<OperationType>().unwrap(), OperationType::BanUser);
    }

    #[test]
    fn test_json_roundtrip() {
        let op = ban(&PrivateKey::generate());
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"op_type\":2"));
        assert!(json.contains("\"reason\":2"));
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_unknown_reason_rejected_on_decode() {
        let op = ban(&PrivateKey::generate());
        let json = serde_json::to_string(&op)
            .unwrap()
            .replace("\"reason\":2", "\"reason\":42");
        assert!(serde_json::from_str::<Operation>(&json).is_err());
    }

    #[test]
    fn test_comment_limit() {
        let key = PrivateKey::generate();
        let long = "c".repeat(MAX_OPERATION_COMMENT_LEN + 1);
        let res = Operation::emerge(
            &key,
            OperationType::RemoveMessage,
            Reason::Abuse,
            &long,
            Id::digest(b"a"),
            Id::digest(b"o"),
            now(),
        );
        assert!(matches!(res, Err(EntityError::WrongArguments(_))));
    }
}
