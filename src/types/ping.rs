//! Relay liveness ping response.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

/// Relay self-description returned by `GET /getaddr`.
///
/// Everything here is self-reported and informational until it has been
/// checked against the client configuration by the selection filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    /// Worker address that will sign and broadcast the hub transaction.
    pub relay_worker_address: Address,
    /// Manager address the relay claims to be registered under.
    pub relay_manager_address: Address,
    /// Hub the relay submits through.
    pub relay_hub_address: Address,
    /// Lowest gas price the relay will accept.
    pub min_gas_price: U256,
    /// Whether the relay is ready to serve requests.
    pub ready: bool,
    /// Relay server version string.
    pub version: String,
    /// Chain the relay serves, when it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
}
