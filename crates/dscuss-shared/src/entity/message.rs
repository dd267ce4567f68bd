use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_SUBJECT_LEN, MAX_TEXT_LEN};
use crate::crypto::{PrivateKey, PublicKey, Signature};
use crate::error::EntityError;
use crate::subs::Topic;
use crate::types::Id;

/// A node of a discussion tree.
///
/// A root message carries a topic and a zero parent id; a reply carries a
/// parent id and no topic (it inherits the root's).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MessageFields")]
pub struct Message {
    id: Id,
    subject: String,
    text: String,
    author_id: Id,
    parent_id: Id,
    date_written: DateTime<Utc>,
    #[serde(with = "optional_topic")]
    topic: Option<Topic>,
    sig: Signature,
}

#[derive(Deserialize)]
struct MessageFields {
    id: Id,
    subject: String,
    text: String,
    author_id: Id,
    parent_id: Id,
    date_written: DateTime<Utc>,
    #[serde(with = "optional_topic")]
    topic: Option<Topic>,
    sig: Signature,
}

/// Canonical content; hashed with `id` zeroed, signed with the real id.
#[derive(Serialize)]
struct MessageContent<'a> {
    id: &'a Id,
    subject: &'a str,
    text: &'a str,
    author_id: &'a Id,
    parent_id: &'a Id,
    date_written: &'a DateTime<Utc>,
    #[serde(with = "optional_topic")]
    topic: &'a Option<Topic>,
}

/// A missing topic is written as an empty tag list.
mod optional_topic {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::subs::Topic;

    pub fn serialize<S: Serializer>(topic: &Option<Topic>, s: S) -> Result<S::Ok, S::Error> {
        match topic {
            Some(t) => t.serialize(s),
            None => s.collect_seq(std::iter::empty::<&str>()),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Topic>, D::Error> {
        let tags = Vec::<String>::deserialize(d)?;
        if tags.is_empty() {
            return Ok(None);
        }
        Topic::new(tags).map(Some).map_err(serde::de::Error::custom)
    }
}

fn check_content(
    subject: &str,
    text: &str,
    parent_id: &Id,
    topic: &Option<Topic>,
) -> Result<(), EntityError> {
    if subject.chars().count() > MAX_SUBJECT_LEN {
        return Err(EntityError::WrongArguments(format!(
            "subject exceeds {MAX_SUBJECT_LEN} characters"
        )));
    }
    if text.chars().count() > MAX_TEXT_LEN {
        return Err(EntityError::WrongArguments(format!(
            "text exceeds {MAX_TEXT_LEN} characters"
        )));
    }
    match (parent_id.is_zero(), topic.is_some()) {
        (true, false) => Err(EntityError::WrongArguments(
            "a thread root needs a topic".into(),
        )),
        (false, true) => Err(EntityError::WrongArguments(
            "a reply inherits its topic and must not carry one".into(),
        )),
        _ => Ok(()),
    }
}

fn content_bytes(
    id: &Id,
    subject: &str,
    text: &str,
    author_id: &Id,
    parent_id: &Id,
    date_written: &DateTime<Utc>,
    topic: &Option<Topic>,
) -> Result<Vec<u8>, EntityError> {
    let content = MessageContent {
        id,
        subject,
        text,
        author_id,
        parent_id,
        date_written,
        topic,
    };
    Ok(serde_json::to_vec(&content)?)
}

impl Message {
    /// Author a new message: validate, compute the id, sign.
    pub fn emerge(
        key: &PrivateKey,
        author_id: Id,
        subject: &str,
        text: &str,
        parent_id: Id,
        topic: Option<Topic>,
        date_written: DateTime<Utc>,
    ) -> Result<Self, EntityError> {
        check_content(subject, text, &parent_id, &topic)?;

        let id = Id::digest(&content_bytes(
            &Id::ZERO,
            subject,
            text,
            &author_id,
            &parent_id,
            &date_written,
            &topic,
        )?);
        let signed = content_bytes(
            &id,
            subject,
            text,
            &author_id,
            &parent_id,
            &date_written,
            &topic,
        )?;
        let sig = key.sign(&signed)?;

        Ok(Self {
            id,
            subject: subject.to_string(),
            text: text.to_string(),
            author_id,
            parent_id,
            date_written,
            topic,
            sig,
        })
    }

    /// Rebuild a message, checking structure and that the id reproduces.
    /// The signature needs the author's key: see [`Message::verify_sig`].
    #[allow(clippy::too_many_arguments)]
    pub fn new_from_fields(
        id: Id,
        subject: String,
        text: String,
        author_id: Id,
        parent_id: Id,
        date_written: DateTime<Utc>,
        topic: Option<Topic>,
        sig: Signature,
    ) -> Result<Self, EntityError> {
        check_content(&subject, &text, &parent_id, &topic)?;
        let msg = Self {
            id,
            subject,
            text,
            author_id,
            parent_id,
            date_written,
            topic,
            sig,
        };
        if !msg.verify_id() {
            return Err(EntityError::IdMismatch);
        }
        Ok(msg)
    }

    fn bytes_with_id(&self, id: &Id) -> Result<Vec<u8>, EntityError> {
        content_bytes(
            id,
            &self.subject,
            &self.text,
            &self.author_id,
            &self.parent_id,
            &self.date_written,
            &self.topic,
        )
    }

    pub fn verify_id(&self) -> bool {
        match self.bytes_with_id(&Id::ZERO) {
            Ok(bytes) => Id::digest(&bytes) == self.id,
            Err(_) => false,
        }
    }

    pub fn verify_sig(&self, author_key: &PublicKey) -> bool {
        match self.bytes_with_id(&self.id) {
            Ok(bytes) => author_key.verify(&bytes, &self.sig),
            Err(_) => false,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn author_id(&self) -> Id {
        self.author_id
    }

    pub fn parent_id(&self) -> Id {
        self.parent_id
    }

    pub fn date_written(&self) -> DateTime<Utc> {
        self.date_written
    }

    pub fn topic(&self) -> Option<&Topic> {
        self.topic.as_ref()
    }

    pub fn sig(&self) -> &Signature {
        &self.sig
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_zero()
    }
}

impl TryFrom<MessageFields> for Message {
    type Error = EntityError;

    fn try_from(f: MessageFields) -> Result<Self, Self::Error> {
        Message::new_from_fields(
            f.id,
            f.subject,
            f.text,
            f.author_id,
            f.parent_id,
            f.date_written,
            f.topic,
            f.sig,
        )
    }
}
