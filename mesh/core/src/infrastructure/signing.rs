// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # Ed25519 Signing & Verification
//!
//! Infrastructure implementation of the mesh's signature scheme: Ed25519
//! (32-byte public keys, fixed 64-byte signatures — small enough for high
//! message volume). Implements the domain's
//! [`MessageAuthenticator`](crate::domain::message::MessageAuthenticator)
//! anti-corruption trait so nothing above this layer touches `ed25519-dalek`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use thiserror::Error;

use crate::domain::message::{AuthenticationError, KlpMessage, MessageAuthenticator};
use crate::infrastructure::codec;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SECRET_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature length {0} (must be {SIGNATURE_LEN})")]
    InvalidSignatureLength(usize),

    #[error("signature verification failed")]
    VerificationFailed,
}

/// An agent's Ed25519 keypair.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        Self { signing: SigningKey::generate(&mut OsRng) }
    }

    pub fn from_secret_bytes(secret: &[u8; SECRET_KEY_LEN]) -> Self {
        Self { signing: SigningKey::from_bytes(secret) }
    }

    pub fn from_secret_hex(hex_str: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))?;
        let secret: [u8; SECRET_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidPublicKey("bad secret key length".into()))?;
        Ok(Self::from_secret_bytes(&secret))
    }

    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_LEN] {
        self.signing.to_bytes()
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// Detached signature over arbitrary bytes.
    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.signing.sign(payload).to_bytes().to_vec()
    }

    /// Sign a message in place over its canonical bytes.
    pub fn sign_message(&self, message: &mut KlpMessage) -> Result<(), codec::EncodeError> {
        let payload = codec::signing_bytes(message)?;
        message.signature = Some(self.sign(&payload));
        Ok(())
    }
}

/// Verify a detached Ed25519 signature.
pub fn verify_detached(
    public_key: &[u8],
    payload: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let key_bytes: [u8; PUBLIC_KEY_LEN] = public_key.try_into().map_err(|_| {
        SignatureError::InvalidPublicKey(format!(
            "bad length {} (must be {PUBLIC_KEY_LEN})",
            public_key.len()
        ))
    })?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))?;

    let sig_bytes: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidSignatureLength(signature.len()))?;
    let signature = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify(payload, &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// [`MessageAuthenticator`] over the KLP canonical byte layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Authenticator;

impl Ed25519Authenticator {
    pub fn new() -> Self {
        Self
    }
}

impl MessageAuthenticator for Ed25519Authenticator {
    fn verify(&self, message: &KlpMessage, public_key: &[u8]) -> Result<(), AuthenticationError> {
        let signature = message
            .signature
            .as_deref()
            .ok_or(AuthenticationError::MissingSignature)?;
        let payload = codec::signing_bytes(message)
            .map_err(|e| AuthenticationError::Malformed(e.to_string()))?;
        verify_detached(public_key, &payload, signature)
            .map_err(|e| AuthenticationError::VerificationFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::identity::AgentId;
    use crate::domain::message::{MessagePayload, StatusUpdateBody};
    use crate::domain::task::{TaskId, TaskStage};

    fn message() -> KlpMessage {
        KlpMessage::new(
            AgentId::from("worker-1"),
            AgentId::from("planner-01"),
            TaskId::from("t-7"),
            MessagePayload::StatusUpdate(StatusUpdateBody {
                stage: TaskStage::Running,
                detail: Some("crunching".into()),
            }),
        )
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let keypair = Keypair::generate();
        let mut m = message();
        keypair.sign_message(&mut m).unwrap();

        let auth = Ed25519Authenticator::new();
        assert!(auth.verify(&m, &keypair.public_key()).is_ok());
    }

    #[test]
    fn test_wrong_key_fails() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let mut m = message();
        keypair.sign_message(&mut m).unwrap();

        let err = Ed25519Authenticator::new().verify(&m, &other.public_key()).unwrap_err();
        assert!(matches!(err, AuthenticationError::VerificationFailed(_)));
    }

    #[test]
    fn test_any_field_mutation_breaks_signature() {
        let keypair = Keypair::generate();
        let auth = Ed25519Authenticator::new();

        let mut m = message();
        keypair.sign_message(&mut m).unwrap();

        let mut tampered = m.clone();
        tampered.to = AgentId::from("attacker");
        assert!(auth.verify(&tampered, &keypair.public_key()).is_err());

        let mut tampered = m.clone();
        tampered.ttl_seconds = Some(3600);
        assert!(auth.verify(&tampered, &keypair.public_key()).is_err());

        let mut tampered = m;
        tampered.payload = MessagePayload::StatusUpdate(StatusUpdateBody {
            stage: TaskStage::Completed,
            detail: Some("crunching".into()),
        });
        assert!(auth.verify(&tampered, &keypair.public_key()).is_err());
    }

    #[test]
    fn test_single_bit_flip_breaks_detached_signature() {
        let keypair = Keypair::generate();
        let payload = b"canonical payload bytes".to_vec();
        let signature = keypair.sign(&payload);
        assert!(verify_detached(&keypair.public_key(), &payload, &signature).is_ok());

        for bit in 0..8 {
            let mut flipped = payload.clone();
            flipped[0] ^= 1 << bit;
            assert_eq!(
                verify_detached(&keypair.public_key(), &flipped, &signature).unwrap_err(),
                SignatureError::VerificationFailed
            );
        }
    }

    #[test]
    fn test_unsigned_message_is_rejected() {
        let keypair = Keypair::generate();
        let err = Ed25519Authenticator::new()
            .verify(&message(), &keypair.public_key())
            .unwrap_err();
        assert_eq!(err, AuthenticationError::MissingSignature);
    }

    #[test]
    fn test_secret_hex_round_trip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_hex(&hex::encode(keypair.secret_bytes())).unwrap();
        assert_eq!(restored.public_key(), keypair.public_key());
    }

    #[test]
    fn test_bad_key_lengths_rejected() {
        assert!(matches!(
            verify_detached(&[0u8; 16], b"x", &[0u8; 64]).unwrap_err(),
            SignatureError::InvalidPublicKey(_)
        ));
        let keypair = Keypair::generate();
        assert_eq!(
            verify_detached(&keypair.public_key(), b"x", &[0u8; 63]).unwrap_err(),
            SignatureError::InvalidSignatureLength(63)
        );
    }
}
