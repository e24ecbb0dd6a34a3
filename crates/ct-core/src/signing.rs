//! The log's ECDSA P-256 signing key.
//!
//! RFC 6962 fixes the signature scheme (SHA-256/ECDSA, ASN.1 DER) and
//! derives the log ID from the SHA-256 of the SubjectPublicKeyInfo.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{DerSignature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, EncodePublicKey};
use p256::SecretKey;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::codec::CodecError;
use crate::sth::encode_digitally_signed;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("unable to parse key: {0}")]
    KeyParse(String),
    #[error("unable to encode public key: {0}")]
    SpkiEncode(String),
    #[error("signature verification failed")]
    Verify,
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}

/// Holds the private key and the derived identity of the log.
#[derive(Clone)]
pub struct LogSigner {
    key: SigningKey,
    spki_der: Vec<u8>,
    log_id: [u8; 32],
}

impl std::fmt::Debug for LogSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSigner")
            .field("log_id", &hex::encode(self.log_id))
            .finish_non_exhaustive()
    }
}

impl LogSigner {
    pub fn new(secret: SecretKey) -> Result<Self, SigningError> {
        let spki_der = secret
            .public_key()
            .to_public_key_der()
            .map_err(|e| SigningError::SpkiEncode(e.to_string()))?
            .into_vec();
        let log_id = Sha256::digest(&spki_der).into();
        Ok(Self {
            key: SigningKey::from(secret),
            spki_der,
            log_id,
        })
    }

    /// Accepts both SEC1 (`EC PRIVATE KEY`) and PKCS#8 (`PRIVATE KEY`) PEM.
    pub fn from_pem(pem: &str) -> Result<Self, SigningError> {
        let secret = SecretKey::from_sec1_pem(pem)
            .or_else(|_| SecretKey::from_pkcs8_pem(pem))
            .map_err(|e| SigningError::KeyParse(e.to_string()))?;
        Self::new(secret)
    }

    /// SHA-256 of the SPKI; RFC 6962's log ID and SCT `id` field.
    pub fn log_id(&self) -> [u8; 32] {
        self.log_id
    }

    pub fn spki_der(&self) -> &[u8] {
        &self.spki_der
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.key.verifying_key()
    }

    /// RFC 6962 "digitally-sign": SHA-256 over `msg`, ECDSA, wrapped in the
    /// TLS `DigitallySigned` struct.
    pub fn digitally_sign(&self, msg: &[u8]) -> Result<Vec<u8>, SigningError> {
        let sig: DerSignature = self.key.sign(msg);
        Ok(encode_digitally_signed(sig.as_bytes())?)
    }
}

/// Verifies a raw ASN.1 ECDSA signature over `msg` against an SPKI.
pub fn verify_asn1(spki_der: &[u8], msg: &[u8], sig_der: &[u8]) -> Result<(), SigningError> {
    use p256::pkcs8::DecodePublicKey;
    let key = p256::PublicKey::from_public_key_der(spki_der)
        .map_err(|e| SigningError::KeyParse(e.to_string()))?;
    let sig = DerSignature::from_bytes(sig_der).map_err(|_| SigningError::Verify)?;
    VerifyingKey::from(key)
        .verify(msg, &sig)
        .map_err(|_| SigningError::Verify)
}
