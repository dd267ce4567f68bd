use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_INFO_LEN, MAX_NICKNAME_LEN};
use crate::crypto::{PrivateKey, PublicKey, Signature};
use crate::error::EntityError;
use crate::pow;
use crate::types::Id;

/// A registered identity.
///
/// The id is the SHA-256 of the DER-encoded public key, so it depends on the
/// key alone. The proof of work binds the key to a costly nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UserFields")]
pub struct User {
    id: Id,
    pub_key: PublicKey,
    proof: u64,
    nickname: String,
    info: String,
    reg_date: DateTime<Utc>,
    sig: Signature,
}

/// Wire form, validated on the way in.
#[derive(Deserialize)]
struct UserFields {
    id: Id,
    pub_key: PublicKey,
    proof: u64,
    nickname: String,
    info: String,
    reg_date: DateTime<Utc>,
    sig: Signature,
}

/// The signed part of a user, in canonical field order.
#[derive(Serialize)]
struct UnsignedUser<'a> {
    pub_key: &'a PublicKey,
    proof: u64,
    nickname: &'a str,
    info: &'a str,
    reg_date: &'a DateTime<Utc>,
}

/// Nicknames are restricted to `[A-Za-z0-9._]+`.
pub fn is_valid_nickname(nickname: &str) -> bool {
    !nickname.is_empty()
        && nickname.chars().count() <= MAX_NICKNAME_LEN
        && nickname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
}

impl User {
    /// Author a new user. `proof` must come from [`pow::find`] over the
    /// key's DER encoding.
    pub fn emerge(
        key: &PrivateKey,
        proof: u64,
        nickname: &str,
        info: &str,
        reg_date: DateTime<Utc>,
    ) -> Result<Self, EntityError> {
        if !is_valid_nickname(nickname) {
            return Err(EntityError::WrongArguments(format!(
                "nickname '{nickname}' must match [A-Za-z0-9._]+ and be at most {MAX_NICKNAME_LEN} characters"
            )));
        }
        if info.chars().count() > MAX_INFO_LEN {
            return Err(EntityError::WrongArguments(format!(
                "info exceeds {MAX_INFO_LEN} characters"
            )));
        }

        let pub_key = key.public_key();
        let unsigned = UnsignedUser {
            pub_key: &pub_key,
            proof,
            nickname,
            info,
            reg_date: &reg_date,
        };
        let sig = key.sign(&serde_json::to_vec(&unsigned)?)?;

        Ok(Self {
            id: Id::digest(&pub_key.to_der()),
            pub_key,
            proof,
            nickname: nickname.to_string(),
            info: info.to_string(),
            reg_date,
            sig,
        })
    }

    /// Rebuild a user read from storage or the wire, checking id and
    /// signature. Proof of work is checked separately with
    /// [`User::verify_proof`] since its difficulty is a node setting.
    pub fn new_from_fields(
        id: Id,
        pub_key: PublicKey,
        proof: u64,
        nickname: String,
        info: String,
        reg_date: DateTime<Utc>,
        sig: Signature,
    ) -> Result<Self, EntityError> {
        if nickname.is_empty() || nickname.chars().count() > MAX_NICKNAME_LEN {
            return Err(EntityError::WrongArguments("bad nickname length".into()));
        }
        if info.chars().count() > MAX_INFO_LEN {
            return Err(EntityError::WrongArguments("info too long".into()));
        }
        let user = Self {
            id,
            pub_key,
            proof,
            nickname,
            info,
            reg_date,
            sig,
        };
        if !user.verify_id() {
            return Err(EntityError::IdMismatch);
        }
        if !user.verify_sig() {
            return Err(EntityError::BadSignature);
        }
        Ok(user)
    }

    fn unsigned_bytes(&self) -> Result<Vec<u8>, EntityError> {
        let unsigned = UnsignedUser {
            pub_key: &self.pub_key,
            proof: self.proof,
            nickname: &self.nickname,
            info: &self.info,
            reg_date: &self.reg_date,
        };
        Ok(serde_json::to_vec(&unsigned)?)
    }

    pub fn verify_id(&self) -> bool {
        self.id == Id::digest(&self.pub_key.to_der())
    }

    /// Users sign themselves, so the key is their own.
    pub fn verify_sig(&self) -> bool {
        match self.unsigned_bytes() {
            Ok(bytes) => self.pub_key.verify(&bytes, &self.sig),
            Err(_) => false,
        }
    }

    pub fn verify_proof(&self, difficulty: u32) -> bool {
        pow::verify(&self.pub_key.to_der(), self.proof, difficulty)
    }

    /// Full check applied to users arriving from peers.
    pub fn verify(&self, difficulty: u32) -> Result<(), EntityError> {
        if !self.verify_id() {
            return Err(EntityError::IdMismatch);
        }
        if !self.verify_sig() {
            return Err(EntityError::BadSignature);
        }
        if !self.verify_proof(difficulty) {
            return Err(EntityError::InsufficientProof(difficulty));
        }
        Ok(())
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn pub_key(&self) -> &PublicKey {
        &self.pub_key
    }

    pub fn proof(&self) -> u64 {
        self.proof
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn info(&self) -> &str {
        &self.info
    }

    pub fn reg_date(&self) -> DateTime<Utc> {
        self.reg_date
    }

    pub fn sig(&self) -> &Signature {
        &self.sig
    }
}

impl TryFrom<UserFields> for User {
    type Error = EntityError;

    fn try_from(f: UserFields) -> Result<Self, Self::Error> {
        User::new_from_fields(f.id, f.pub_key, f.proof, f.nickname, f.info, f.reg_date, f.sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now;

    fn alice() -> (PrivateKey, User) {
        let key = PrivateKey::generate();
        let user = User::emerge(&key, 0, "alice", "hello", now()).unwrap();
        (key, user)
    }

    #[test]
    fn test_id_is_hash_of_key() {
        let (key, user) = alice();
        assert_eq!(user.id(), Id::digest(&key.public_key().to_der()));
        assert!(user.verify_id());
        assert!(user.verify_sig());
        assert!(user.verify(0).is_ok());
    }

    #[test]
    fn test_bad_nickname() {
        let key = PrivateKey::generate();
        assert!(User::emerge(&key, 0, "", "", now()).is_err());
        assert!(User::emerge(&key, 0, "bad nick", "", now()).is_err());
        assert!(User::emerge(&key, 0, "al.ice_2", "", now()).is_ok());
        let long = "a".repeat(MAX_NICKNAME_LEN + 1);
        assert!(User::emerge(&key, 0, &long, "", now()).is_err());
    }

    #[test]
    fn test_json_roundtrip_revalidates() {
        let (_, user) = alice();
        let json = serde_json::to_string(&user).unwrap();
        let back: User = serde_json::from_str(&json).unwrap();
        assert_eq!(back, user);
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }

    #[test]
    fn test_tampered_nickname_rejected() {
        let (_, user) = alice();
        let json = serde_json::to_string(&user).unwrap();
        let tampered = json.replace("\"alice\"", "\"mallory\"");
        assert!(serde_json::from_str::<User>(&tampered).is_err());
    }

    #[test]
    fn test_wrong_id_rejected() {
        let (_, user) = alice();
        let res = User::new_from_fields(
            Id([7u8; 32]),
            user.pub_key().clone(),
            user.proof(),
            user.nickname().to_string(),
            user.info().to_string(),
            user.reg_date(),
            *user.sig(),
        );
        assert!(matches!(res, Err(EntityError::IdMismatch)));
    }

    #[test]
    fn test_proof_checked_at_difficulty() {
        let key = PrivateKey::generate();
        let cancel = std::sync::atomic::AtomicBool::new(false);
        let proof = pow::find(&key.public_key().to_der(), 1, &cancel).unwrap();
        let user = User::emerge(&key, proof, "bob", "", now()).unwrap();
        assert!(user.verify(1).is_ok());
    }
}
