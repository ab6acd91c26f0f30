//! Client error types.

use alloy::{
    primitives::{Address, B256},
    transports::{RpcError, TransportErrorKind},
};
use thiserror::Error;

/// Errors talking to the chain RPC through the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// An error occurred talking to RPC.
    #[error(transparent)]
    Rpc(#[from] RpcError<TransportErrorKind>),
    /// A contract call failed or its revert data could not be decoded.
    #[error(transparent)]
    Contract(#[from] alloy::contract::Error),
    /// No receipt appeared for the hash within the retry budget.
    #[error("no receipt for transaction {hash} after {attempts} attempts")]
    ReceiptNotFound {
        /// Hash of the transaction that was polled.
        hash: B256,
        /// Number of polls made before giving up.
        attempts: u32,
    },
}

/// Errors produced while refreshing the known-relay directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The chain RPC was unreachable or rejected the scan.
    #[error(transparent)]
    Rpc(#[from] RpcError<TransportErrorKind>),
    /// The event scan still overflowed at the maximum split factor.
    #[error("too many events after splitting the lookup window by {parts}")]
    TooManyEvents {
        /// Split factor at which the scan gave up.
        parts: u32,
    },
}

/// Reasons a relay lost a ping race. Recoverable: the relay is skipped for
/// the rest of the attempt and the reason is kept for the final report.
#[derive(Debug, Error)]
pub enum PingError {
    /// The ping did not return within the HTTP client timeout.
    #[error("ping timed out")]
    Timeout,
    /// The ping failed below HTTP (connection refused, DNS, TLS).
    #[error("ping failed: {0}")]
    Transport(String),
    /// The relay answered with an empty body, which the protocol forbids.
    #[error("relay responded without a body")]
    EmptyBody,
    /// The relay answered with a body that is not a ping response.
    #[error("malformed ping response: {0}")]
    Malformed(String),
    /// The relay reports it is not ready to serve requests.
    #[error("relay not ready")]
    NotReady,
    /// The relay serves a different chain than the client is configured for.
    #[error("relay chain id {got} does not match configured chain id {expected}")]
    MismatchedChain {
        /// Chain id the client is configured for.
        expected: u64,
        /// Chain id the relay reported.
        got: u64,
    },
    /// The relay works against a different hub than the client is configured
    /// for.
    #[error("relay hub {got} does not match configured hub {expected}")]
    MismatchedHub {
        /// Hub address the client is configured for.
        expected: Address,
        /// Hub address the relay reported.
        got: Address,
    },
    /// The caller-supplied ping filter rejected the response.
    #[error("rejected by ping filter: {0}")]
    Rejected(String),
}

/// The relay's returned transaction failed validation against the request
/// that was sent to it.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The returned transaction is not addressed to the configured hub.
    #[error("transaction destination {got:?} is not the relay hub {expected}")]
    DestinationMismatch {
        /// The configured hub address.
        expected: Address,
        /// Destination found in the returned transaction, if any.
        got: Option<Address>,
    },
    /// The returned call data differs from the re-encoded signed request.
    #[error("transaction call data does not match the signed request")]
    CalldataMismatch,
    /// The returned transaction was not signed by the expected relay worker.
    #[error("transaction signer {got} is not the relay worker {expected}")]
    SignerMismatch {
        /// Worker address named in the request's relay data.
        expected: Address,
        /// Signer recovered from the returned transaction.
        got: Address,
    },
    /// The returned transaction could not be decoded or its signer recovered.
    #[error("malformed relay transaction: {0}")]
    MalformedTransaction(String),
    /// The returned nonce exceeds the bound the client was willing to accept.
    ///
    /// The transaction is valid EVM-wise, but a nonce above the bound means
    /// the relay may be signing conflicting transactions against the
    /// client's expectations. Surfaced as a fatal integrity violation.
    #[error("relay used tx nonce {got}, above the requested maximum {max_nonce}")]
    NonceAboveMaximum {
        /// Highest nonce the client agreed to accept.
        max_nonce: u64,
        /// Nonce found in the returned transaction.
        got: u64,
    },
}

/// Failures of a single relay attempt. Recoverable: the orchestrator records
/// the error against the relay URL and rotates to the next candidate.
#[derive(Debug, Error)]
pub enum RelayingError {
    /// The verifier rejected the request in the local dry run. No gas was
    /// risked and the relay was never contacted.
    #[error("verifier rejected in local view call: {reason}")]
    VerifierRejected {
        /// Decoded revert reason, if any.
        reason: String,
    },
    /// The local dry run of the hub call itself reverted.
    #[error("local view call to the hub reverted: {reason}")]
    SimulationReverted {
        /// Decoded revert reason, if any.
        reason: String,
    },
    /// The POST to the relay failed or timed out.
    #[error("relay unreachable: {reason}")]
    Unreachable {
        /// Whether the failure was a timeout rather than a hard error.
        timeout: bool,
        /// Transport-level description of the failure.
        reason: String,
    },
    /// The relay answered HTTP 200 but reported an error of its own.
    #[error("relay returned error: {0}")]
    ServerError(String),
    /// The relay answered HTTP 200 without a signed transaction.
    #[error("relay response is missing the signed transaction")]
    MissingSignedTx,
    /// The returned transaction did not match the signed request.
    #[error(transparent)]
    InvalidResponse(#[from] ValidationError),
    /// The request for this relay could not be signed.
    #[error(transparent)]
    Signer(#[from] SignerError),
    /// Could not resolve the nonce or worker state needed for this attempt.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Errors from the request signing capability.
#[derive(Debug, Error)]
pub enum SignerError {
    /// The underlying signer failed to produce a signature.
    #[error(transparent)]
    Signature(#[from] alloy::signers::Error),
    /// The fresh signature could not be recovered at all.
    #[error("signature recovery failed: {0}")]
    Recovery(String),
    /// The produced signature does not recover to the request sender.
    #[error("signature recovers to {recovered}, expected {expected}")]
    RecoveryMismatch {
        /// The request's `from` address.
        expected: Address,
        /// Address actually recovered from the fresh signature.
        recovered: Address,
    },
}

/// The overarching error type returned by [`RelayClient::relay`].
///
/// Per-relay failures never show up here; they are absorbed into the
/// [`RelayingResult`] maps and drive relay rotation instead.
///
/// [`RelayClient::relay`]: crate::client::RelayClient::relay
/// [`RelayingResult`]: crate::client::RelayingResult
#[derive(Debug, Error)]
pub enum EnvelopingError {
    /// A required address or option is missing or invalid. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Relay discovery failed because the chain RPC was unusable.
    #[error("relay directory unavailable")]
    DirectoryUnavailable(#[source] DirectoryError),
    /// Discovery succeeded but produced zero candidates in every tier.
    #[error("no registered relays to send the request through")]
    NoRegisteredRelays,
    /// A preferred relay won its ping race but has no active on-chain
    /// registration for the manager it reported.
    #[error("no active registration found for preferred relay manager {manager}")]
    UnknownPreferredRelay {
        /// Manager address the winning relay reported in its ping.
        manager: Address,
    },
    /// The relay returned a transaction with a nonce above the agreed bound.
    /// Fatal for the attempt: retrying could double-spend.
    #[error("relay used tx nonce {got}, above the requested maximum {max_nonce}")]
    NonceIntegrityViolation {
        /// Highest nonce the client agreed to accept.
        max_nonce: u64,
        /// Nonce found in the returned transaction.
        got: u64,
    },
    /// The request could not be signed for the sender.
    #[error(transparent)]
    Signer(#[from] SignerError),
    /// A chain read needed to build the request failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
