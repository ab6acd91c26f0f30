//! Client constants.

/// Gas units subtracted from an externally-made `eth_estimateGas` result when
/// the same call will later execute as an internal `CALL` from the forwarding
/// wallet.
///
/// The hub asserts `gasleft() > requestedGas` right before making the
/// internal call, so the client must budget the internal cost, not the
/// top-level one. Applied only when the raw estimate exceeds the correction;
/// a smaller estimate is passed through unchanged.
pub const INTERNAL_TRANSACTION_ESTIMATE_CORRECTION: u64 = 20_000;

/// Safety multiplier applied on top of corrected gas estimates, rounded up.
pub const ESTIMATED_GAS_CORRECTION_FACTOR: f64 = 1.0;

/// EIP-712 domain name shared by the forwarding wallet and the wallet factory.
pub const EIP712_DOMAIN_NAME: &str = "Enveloping Transaction";

/// EIP-712 domain version.
pub const EIP712_DOMAIN_VERSION: &str = "2";

/// Ceiling for the event-scan split factor. A scan that would widen past this
/// many parts fails instead.
pub const MAX_LOOKUP_WINDOW_PARTS: u32 = 16;

/// Multiplier applied to the split factor after a "too many results" reject.
pub const LOOKUP_WINDOW_PARTS_GROWTH: u32 = 4;

/// Default number of receipt polls before giving up on a transaction hash.
pub const DEFAULT_RECEIPT_RETRIES: u32 = 5;

/// Initial receipt-poll backoff in milliseconds. Doubles on every retry.
pub const DEFAULT_RECEIPT_BACKOFF_MS: u64 = 500;
