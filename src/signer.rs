//! Request signing capability.

use crate::{error::SignerError, types::EnvelopingRequest};
use alloy::{
    primitives::{Address, Bytes},
    signers::{local::PrivateKeySigner, SignerSync},
};
use async_trait::async_trait;

/// An opaque "sign this request" capability.
///
/// The key backend is out of scope here; anything that can produce an
/// EIP-712 signature over the request digest qualifies.
#[async_trait]
pub trait RequestSigner: Send + Sync + std::fmt::Debug {
    /// The address whose requests this signer can sign.
    fn address(&self) -> Address;

    /// Signs the request for the given chain and returns the 65-byte
    /// signature.
    async fn sign_request(
        &self,
        request: &EnvelopingRequest,
        chain_id: u64,
    ) -> Result<Bytes, SignerError>;
}

/// [`RequestSigner`] backed by an in-memory secp256k1 key.
///
/// Every produced signature is verified by recovery before it leaves the
/// signer: a signature that does not recover to the request sender would be
/// rejected on-chain after the relay worker has already paid for gas.
#[derive(Debug, Clone)]
pub struct LocalRequestSigner {
    signer: PrivateKeySigner,
}

impl LocalRequestSigner {
    /// Wraps a local private key.
    pub fn new(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl RequestSigner for LocalRequestSigner {
    fn address(&self) -> Address {
        self.signer.address()
    }

    async fn sign_request(
        &self,
        request: &EnvelopingRequest,
        chain_id: u64,
    ) -> Result<Bytes, SignerError> {
        let digest = request.signing_hash(chain_id);
        let signature = self.signer.sign_hash_sync(&digest)?;

        let recovered = signature
            .recover_address_from_prehash(&digest)
            .map_err(|e| SignerError::Recovery(e.to_string()))?;
        if recovered != request.from() {
            return Err(SignerError::RecoveryMismatch {
                expected: request.from(),
                recovered,
            });
        }

        Ok(Bytes::from(signature.as_bytes().to_vec()))
    }
}
