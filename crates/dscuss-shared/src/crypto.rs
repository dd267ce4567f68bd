//! ECDSA over NIST P-224.
//!
//! Messages are hashed with SHA-256 and the digest is signed directly, so
//! signatures interoperate with implementations that sign a raw SHA-256
//! digest on P-224. A signature travels as the fixed-width R || S pair.

use std::fmt;
use std::path::Path;

use p224::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p224::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use p224::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::constants::SIGNATURE_SIZE;
use crate::error::CryptoError;

/// Owner's private key. Never leaves the owner directory.
#[derive(Clone)]
pub struct PrivateKey {
    secret: p224::SecretKey,
}

/// A user's public key, exchanged as SPKI DER.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: p224::PublicKey,
}

/// Fixed-width ECDSA signature (R || S, 56 bytes).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; SIGNATURE_SIZE]);

impl PrivateKey {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        Self {
            secret: p224::SecretKey::random(&mut OsRng),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: self.secret.public_key(),
        }
    }

    /// Hash `data` with SHA-256 and sign the digest.
    pub fn sign(&self, data: &[u8]) -> Result<Signature, CryptoError> {
        let digest = Sha256::digest(data);
        let signing_key = SigningKey::from(&self.secret);
        let sig: EcdsaSignature = signing_key
            .sign_prehash(&digest)
            .map_err(|_| CryptoError::SigningFailed)?;
        Signature::from_slice(&sig.to_bytes())
    }

    /// Encode as SEC1 PEM (`EC PRIVATE KEY`).
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        self.secret
            .to_sec1_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| CryptoError::KeyFile(e.to_string()))
    }

    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let secret = p224::SecretKey::from_sec1_pem(pem)
            .map_err(|e| CryptoError::KeyFile(e.to_string()))?;
        Ok(Self { secret })
    }

    /// Write the key as PEM, readable by the owner only.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        let pem = self.to_pem()?;
        std::fs::write(path, pem.as_bytes()).map_err(|e| CryptoError::KeyFile(e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| CryptoError::KeyFile(e.to_string()))?;
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let pem =
            std::fs::read_to_string(path).map_err(|e| CryptoError::KeyFile(e.to_string()))?;
        Self::from_pem(&pem)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl PublicKey {
    /// SPKI DER encoding. A user's id is the SHA-256 of these bytes.
    pub fn to_der(&self) -> Vec<u8> {
        // Encoding a valid curve point cannot fail.
        self.key
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .unwrap_or_default()
    }

    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let key = p224::PublicKey::from_public_key_der(der)
            .map_err(|_| CryptoError::InvalidKeyBytes)?;
        Ok(Self { key })
    }

    /// Verify a signature over the SHA-256 digest of `data`.
    pub fn verify(&self, data: &[u8], sig: &Signature) -> bool {
        let Ok(ecdsa_sig) = EcdsaSignature::from_slice(&sig.0) else {
            return false;
        };
        let digest = Sha256::digest(data);
        VerifyingKey::from(&self.key)
            .verify_prehash(&digest, &ecdsa_sig)
            .is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.to_der()[..8]))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        crate::types::base64_bytes::serialize(&self.to_der(), serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let der = crate::types::base64_bytes::deserialize(deserializer)?;
        PublicKey::from_der(&der).map_err(serde::de::Error::custom)
    }
}

impl Signature {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; SIGNATURE_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        crate::types::base64_bytes::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = crate::types::base64_bytes::deserialize(deserializer)?;
        Signature::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}
