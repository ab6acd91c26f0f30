//! Validation of the signed transaction a relay returns.
//!
//! The relay is not trusted to have broadcast what was asked of it: the
//! client re-derives the expected hub call from the signed request and
//! compares it against the transaction the relay claims to have sent.

use crate::{
    error::ValidationError,
    types::{EnvelopingRequest, RelayMetadata},
};
use alloy::{
    consensus::{transaction::SignerRecoverable, Transaction, TxEnvelope},
    eips::eip2718::Decodable2718,
    primitives::{Address, Bytes},
};
use tracing::debug;

/// Checks the relay's returned raw transaction against the request it was
/// given, in order: destination address, re-encoded call data, recovered
/// signer, and finally the nonce bound.
///
/// A nonce above `relay_max_nonce` is an integrity violation rather than a
/// plain mismatch: the transaction is otherwise valid, but the relay may be
/// signing conflicting transactions, so the caller must not silently retry.
pub fn validate_relay_response(
    request: &EnvelopingRequest,
    metadata: &RelayMetadata,
    relay_hub_address: Address,
    returned_tx: &Bytes,
) -> Result<(), ValidationError> {
    let transaction = TxEnvelope::decode_2718(&mut returned_tx.as_ref())
        .map_err(|e| ValidationError::MalformedTransaction(e.to_string()))?;
    let signer = transaction
        .recover_signer()
        .map_err(|e| ValidationError::MalformedTransaction(e.to_string()))?;

    let destination = transaction.to();
    if destination != Some(relay_hub_address) {
        return Err(ValidationError::DestinationMismatch {
            expected: relay_hub_address,
            got: destination,
        });
    }

    let expected_calldata = request.encode_hub_call(&metadata.signature);
    if transaction.input() != &expected_calldata {
        return Err(ValidationError::CalldataMismatch);
    }

    let expected_signer = request.relay_data().relayWorker;
    if signer != expected_signer {
        return Err(ValidationError::SignerMismatch {
            expected: expected_signer,
            got: signer,
        });
    }

    if transaction.nonce() > metadata.relay_max_nonce {
        return Err(ValidationError::NonceAboveMaximum {
            max_nonce: metadata.relay_max_nonce,
            got: transaction.nonce(),
        });
    }

    debug!(hash = %transaction.tx_hash(), "relay response passed validation");
    Ok(())
}
