//! Wire packets.
//!
//! A packet is `{"body":{"type":T,"payload":B64},"sig":B64}` where the
//! payload is the canonical JSON of the type's content and the signature is
//! made by the sender over the canonical JSON of `body`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::{PrivateKey, PublicKey, Signature};
use crate::entity::{Entity, Message, Operation, User};
use crate::error::PacketError;
use crate::subs::Subscriptions;
use crate::types::{base64_bytes, Id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketType {
    User,
    Hello,
    Msg,
    Oper,
    Ann,
    Ack,
    Req,
    Done,
}

impl PacketType {
    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::User => "user",
            PacketType::Hello => "hello",
            PacketType::Msg => "msg",
            PacketType::Oper => "oper",
            PacketType::Ann => "ann",
            PacketType::Ack => "ack",
            PacketType::Req => "req",
            PacketType::Done => "done",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketBody {
    #[serde(rename = "type")]
    pub packet_type: PacketType,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub body: PacketBody,
    pub sig: Signature,
}

/// Handshake proof: signed by the sender, addressed to the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub receiver_id: Id,
    pub time: DateTime<Utc>,
    pub subscriptions: Subscriptions,
}

/// Payload of `ann`, `ack` and `req`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdPayload {
    pub id: Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Done {}

impl Packet {
    /// Encode `payload` and sign the resulting body.
    pub fn new<T: Serialize>(
        packet_type: PacketType,
        payload: &T,
        key: &PrivateKey,
    ) -> Result<Self, PacketError> {
        let body = PacketBody {
            packet_type,
            payload: serde_json::to_vec(payload)?,
        };
        let sig = key.sign(&serde_json::to_vec(&body)?)?;
        Ok(Self { body, sig })
    }

    pub fn user(user: &User, key: &PrivateKey) -> Result<Self, PacketError> {
        Self::new(PacketType::User, user, key)
    }

    pub fn hello(hello: &Hello, key: &PrivateKey) -> Result<Self, PacketError> {
        Self::new(PacketType::Hello, hello, key)
    }

    pub fn message(msg: &Message, key: &PrivateKey) -> Result<Self, PacketError> {
        Self::new(PacketType::Msg, msg, key)
    }

    pub fn operation(op: &Operation, key: &PrivateKey) -> Result<Self, PacketError> {
        Self::new(PacketType::Oper, op, key)
    }

    pub fn entity(entity: &Entity, key: &PrivateKey) -> Result<Self, PacketError> {
        match entity {
            Entity::User(u) => Self::user(u, key),
            Entity::Message(m) => Self::message(m, key),
            Entity::Operation(o) => Self::operation(o, key),
        }
    }

    pub fn announce(id: Id, key: &PrivateKey) -> Result<Self, PacketError> {
        Self::new(PacketType::Ann, &IdPayload { id }, key)
    }

    pub fn ack(id: Id, key: &PrivateKey) -> Result<Self, PacketError> {
        Self::new(PacketType::Ack, &IdPayload { id }, key)
    }

    pub fn request(id: Id, key: &PrivateKey) -> Result<Self, PacketError> {
        Self::new(PacketType::Req, &IdPayload { id }, key)
    }

    pub fn done(key: &PrivateKey) -> Result<Self, PacketError> {
        Self::new(PacketType::Done, &Done {}, key)
    }

    pub fn packet_type(&self) -> PacketType {
        self.body.packet_type
    }

    /// Verify the sender's signature over the body.
    pub fn verify(&self, sender: &PublicKey) -> bool {
        match serde_json::to_vec(&self.body) {
            Ok(bytes) => sender.verify(&bytes, &self.sig),
            Err(_) => false,
        }
    }

    /// Check the header before looking at the payload.
    pub fn expect(&self, packet_type: PacketType) -> Result<(), PacketError> {
        if self.body.packet_type != packet_type {
            return Err(PacketError::WrongPacketType {
                expected: packet_type.to_string(),
                actual: self.body.packet_type.to_string(),
            });
        }
        Ok(())
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, PacketError> {
        Ok(serde_json::from_slice(&self.body.payload)?)
    }

    /// Decode the carried entity for `user`, `msg` and `oper` packets.
    /// Decoding re-validates the entity id (and a user's own signature).
    pub fn to_entity(&self) -> Result<Entity, PacketError> {
        match self.body.packet_type {
            PacketType::User => Ok(Entity::User(self.decode_payload()?)),
            PacketType::Msg => Ok(Entity::Message(self.decode_payload()?)),
            PacketType::Oper => Ok(Entity::Operation(self.decode_payload()?)),
            other => Err(PacketError::WrongPacketType {
                expected: "user|msg|oper".to_string(),
                actual: other.to_string(),
            }),
        }
    }

    /// The id carried by `ann`, `ack` and `req` packets.
    pub fn to_id(&self) -> Result<Id, PacketError> {
        match self.body.packet_type {
            PacketType::Ann | PacketType::Ack | PacketType::Req => {
                Ok(self.decode_payload::<IdPayload>()?.id)
            }
            other => Err(PacketError::WrongPacketType {
                expected: "ann|ack|req".to_string(),
                actual: other.to_string(),
            }),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PacketError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.body.packet_type, self.body.payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now;

    #[test]
    fn test_signed_by_sender() {
        let key = PrivateKey::generate();
        let p = Packet::announce(Id::digest(b"x"), &key).unwrap();
        assert!(p.verify(&key.public_key()));
        assert!(!p.verify(&PrivateKey::generate().public_key()));
        assert_eq!(p.to_id().unwrap(), Id::digest(b"x"));
    }

    #[test]
    fn test_wire_shape() {
        let key = PrivateKey::generate();
        let p = Packet::done(&key).unwrap();
        let json = String::from_utf8(p.to_bytes().unwrap()).unwrap();
        assert!(json.starts_with("{\"body\":{\"type\":\"done\",\"payload\":\""));
        assert!(json.contains("\"sig\":\""));
        let back = Packet::from_bytes(json.as_bytes()).unwrap();
        assert_eq!(back, p);
        assert!(back.verify(&key.public_key()));
    }

    #[test]
    fn test_wrong_type() {
        let key = PrivateKey::generate();
        let p = Packet::done(&key).unwrap();
        assert!(matches!(
            p.expect(PacketType::Hello),
            Err(PacketError::WrongPacketType { .. })
        ));
        assert!(p.expect(PacketType::Done).is_ok());
        assert!(p.to_entity().is_err());
        assert!(p.to_id().is_err());
    }

    #[test]
    fn test_hello_payload() {
        let key = PrivateKey::generate();
        let hello = Hello {
            receiver_id: Id::digest(b"bob"),
            time: now(),
            subscriptions: Subscriptions::parse_lines("linux,news\nrust").unwrap(),
        };
        let p = Packet::hello(&hello, &key).unwrap();
        p.expect(PacketType::Hello).unwrap();
        let back: Hello = p.decode_payload().unwrap();
        assert_eq!(back, hello);
    }

    #[test]
    fn test_tampered_body_fails_verification() {
        let key = PrivateKey::generate();
        let mut p = Packet::ack(Id::digest(b"a"), &key).unwrap();
        p.body.packet_type = PacketType::Req;
        assert!(!p.verify(&key.public_key()));
    }

    #[test]
    fn test_entity_packet() {
        let key = PrivateKey::generate();
        let user = User::emerge(&key, 0, "carol", "", now()).unwrap();
        let p = Packet::entity(&Entity::User(user.clone()), &key).unwrap();
        assert_eq!(p.packet_type(), PacketType::User);
        assert_eq!(p.to_entity().unwrap(), Entity::User(user));
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let raw = br#"{"body":{"type":"bogus","payload":""},"sig":""}"#;
        assert!(matches!(
            Packet::from_bytes(raw),
            Err(PacketError::MalformedPayload(_))
        ));
    }
}
