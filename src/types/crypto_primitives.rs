/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [`Keypair`] type as an object used to sign 256-bit digests, and the
//! free function used to verify them.
//!
//! Every consensus message carries signatures over digests only, never over variable-length
//! payloads, so the signing API takes a [`CryptoHash`]. Ed25519 signing in `ed25519-dalek` is
//! deterministic, and the private-key path is constant-time.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use super::data_types::{CryptoHash, SignatureBytes};

/// A wrapper around [`SigningKey`] which implements a convenience method for signing digests.
/// The keypair is immutable after engine initialization.
pub struct Keypair(SigningKey);

impl Keypair {
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Sign a 256-bit digest with the local private key.
    pub fn sign(&self, hash: &CryptoHash) -> SignatureBytes {
        SignatureBytes::new(self.0.sign(hash.as_slice()).to_bytes())
    }

    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }
}

/// Verify `sig` over `hash` under `public_key`.
pub fn verify(public_key: &VerifyingKey, sig: &SignatureBytes, hash: &CryptoHash) -> bool {
    let signature = Signature::from_bytes(&sig.bytes());
    public_key.verify(hash.as_slice(), &signature).is_ok()
}
