//! ECDSA-P256 signing and verification for the consensus core.
//!
//! Public keys and signatures are carried as fixed-width raw coordinate
//! pairs (`X || Y` for keys, `r || s` for signatures) rather than any
//! self-describing encoding, matching the script VM's expectation that it
//! can split a pushed byte string exactly in half (§4.3).

use crate::{BlockchainError, Result};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};

/// Byte length of a raw `r || s` ECDSA-P256 signature.
pub const SIG_LENGTH: usize = 64;
/// Byte length of a raw `X || Y` ECDSA-P256 public key.
pub const PUBKEY_LENGTH: usize = 64;

/// Raw `X || Y` public key point (64 bytes, no compression tag).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    key_data: Vec<u8>,
}

/// Private scalar backing an ECDSA-P256 keypair.
#[derive(Clone)]
pub struct PrivateKey {
    key_data: Vec<u8>,
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

/// Fixed-length `r || s` signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    data: Vec<u8>,
}

impl PublicKey {
    /// Builds a public key from a raw 64-byte `X || Y` point.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not exactly [`PUBKEY_LENGTH`] long or
    /// does not decode to a point on the curve.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != PUBKEY_LENGTH {
            return Err(BlockchainError::InvalidKeySize {
                expected: PUBKEY_LENGTH,
                actual: bytes.len(),
            });
        }
        // Validate that it actually decodes to a point on the curve.
        let _ = Self::verifying_key_from_raw(&bytes)?;
        Ok(Self { key_data: bytes })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_data
    }

    fn verifying_key_from_raw(raw: &[u8]) -> Result<VerifyingKey> {
        let mut sec1 = Vec::with_capacity(1 + raw.len());
        sec1.push(0x04);
        sec1.extend_from_slice(raw);
        VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| BlockchainError::InvalidSignature)
    }

    fn to_verifying_key(&self) -> Result<VerifyingKey> {
        Self::verifying_key_from_raw(&self.key_data)
    }
}

impl PrivateKey {
    /// Builds a private key from a raw 32-byte scalar.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not decode to a valid scalar.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let _ = SigningKey::from_slice(&bytes).map_err(|_| BlockchainError::InvalidSignature)?;
        Ok(Self { key_data: bytes })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_data
    }

    fn to_signing_key(&self) -> Result<SigningKey> {
        SigningKey::from_slice(&self.key_data).map_err(|_| BlockchainError::InvalidSignature)
    }
}

impl KeyPair {
    /// Generates a new ECDSA-P256 keypair.
    ///
    /// # Errors
    ///
    /// Returns an error if the generated key fails to round-trip (never
    /// expected in practice).
    pub fn generate() -> Result<Self> {
        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);
        let point = verifying_key.to_encoded_point(false);
        let raw = &point.as_bytes()[1..]; // strip the 0x04 SEC1 prefix

        let public_key = PublicKey::from_bytes(raw.to_vec())?;
        let private_key = PrivateKey::from_bytes(signing_key.to_bytes().to_vec())?;

        Ok(Self {
            public_key,
            private_key,
        })
    }

    /// Signs `message`, producing a fixed 64-byte `r || s` signature.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying private key is malformed.
    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let signing_key = self.private_key.to_signing_key()?;
        let signature: EcdsaSignature = signing_key.sign(message);
        Ok(Signature {
            data: signature.to_bytes().to_vec(),
        })
    }
}

impl Signature {
    /// Builds a signature from a raw 64-byte `r || s` pair.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not exactly [`SIG_LENGTH`] long.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != SIG_LENGTH {
            return Err(BlockchainError::InvalidKeySize {
                expected: SIG_LENGTH,
                actual: bytes.len(),
            });
        }
        Ok(Self { data: bytes })
    }

    /// Verifies this signature against `message` under `public_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the public key is malformed; returns `Ok(false)`
    /// (never an error) when the key is well formed but the signature does
    /// not verify.
    pub fn verify(&self, message: &[u8], public_key: &PublicKey) -> Result<bool> {
        let verifying_key = public_key.to_verifying_key()?;
        let Ok(signature) = EcdsaSignature::from_slice(&self.data) else {
            return Ok(false);
        };
        Ok(verifying_key.verify(message, &signature).is_ok())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.data.len()
    }
}

/// Creates a public key from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are invalid.
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_bytes(bytes.to_vec())
}
