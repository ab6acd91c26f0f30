//! Client configuration.

use crate::error::EnvelopingError;
use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Configuration snapshot for one client instance.
///
/// Constructed once by merging user overrides onto [`EnvelopingConfig::default`]
/// and never mutated afterwards; every component borrows the same snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvelopingConfig {
    /// Address of the relay hub contract.
    pub relay_hub_address: Address,
    /// Address of the verifier consulted for relay requests.
    pub relay_verifier_address: Address,
    /// Address of the verifier consulted for deploy requests.
    pub deploy_verifier_address: Address,
    /// Default forwarding wallet, used when a request does not name one.
    pub forwarder_address: Address,
    /// Factory that instantiates forwarding wallets for deploy requests.
    pub smart_wallet_factory_address: Address,
    /// Chain id requests are signed for.
    pub chain_id: u64,
    /// Relay URLs always tried first, bypassing on-chain discovery.
    pub preferred_relays: Vec<Url>,
    /// If true, never fall through to discovered relays.
    pub only_preferred_relays: bool,
    /// Size of the historical registration-event scan, in blocks.
    pub relay_lookup_window_blocks: u64,
    /// Initial number of concurrent sub-ranges the scan is split into.
    pub relay_lookup_window_parts: u32,
    /// Maximum relays raced concurrently per selection round.
    pub slice_size: usize,
    /// Seconds before a recorded relay failure is forgotten.
    pub relay_timeout_grace: u64,
    /// Tolerance between the relay worker's current transaction count and
    /// the highest nonce the client will accept in the returned transaction.
    pub max_relay_nonce_gap: u64,
    /// Percent markup applied on top of the network gas price.
    pub gas_price_factor_percent: u64,
    /// Floor for the computed gas price, in wei.
    pub min_gas_price: u128,
    /// Per-request timeout of the relay HTTP client. This is the only bound
    /// on ping-race latency.
    pub http_timeout: Duration,
}

impl Default for EnvelopingConfig {
    fn default() -> Self {
        Self {
            relay_hub_address: Address::ZERO,
            relay_verifier_address: Address::ZERO,
            deploy_verifier_address: Address::ZERO,
            forwarder_address: Address::ZERO,
            smart_wallet_factory_address: Address::ZERO,
            chain_id: 1,
            preferred_relays: Vec::new(),
            only_preferred_relays: false,
            relay_lookup_window_blocks: 60_000,
            relay_lookup_window_parts: 1,
            slice_size: 3,
            relay_timeout_grace: 1800,
            max_relay_nonce_gap: 3,
            gas_price_factor_percent: 0,
            min_gas_price: 1_000_000_000,
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl EnvelopingConfig {
    /// Sets the relay hub address.
    pub fn with_relay_hub(mut self, address: Address) -> Self {
        self.relay_hub_address = address;
        self
    }

    /// Sets the relay and deploy verifier addresses.
    pub fn with_verifiers(mut self, relay: Address, deploy: Address) -> Self {
        self.relay_verifier_address = relay;
        self.deploy_verifier_address = deploy;
        self
    }

    /// Sets the default forwarding wallet address.
    pub fn with_forwarder(mut self, address: Address) -> Self {
        self.forwarder_address = address;
        self
    }

    /// Sets the wallet factory address.
    pub fn with_wallet_factory(mut self, address: Address) -> Self {
        self.smart_wallet_factory_address = address;
        self
    }

    /// Sets the chain id requests are signed for.
    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    /// Sets the relays tried ahead of on-chain discovery.
    pub fn with_preferred_relays(mut self, relays: Vec<Url>) -> Self {
        self.preferred_relays = relays;
        self
    }

    /// Restricts selection to the preferred relays.
    pub fn with_only_preferred_relays(mut self, only: bool) -> Self {
        self.only_preferred_relays = only;
        self
    }

    /// Sets the gas price markup and floor.
    pub fn with_gas_price_policy(mut self, factor_percent: u64, min_gas_price: u128) -> Self {
        self.gas_price_factor_percent = factor_percent;
        self.min_gas_price = min_gas_price;
        self
    }

    /// Sets the per-request timeout of the relay HTTP client.
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Checks that the addresses every request depends on are present.
    ///
    /// The verifier and factory addresses are validated lazily by the
    /// operations that need them, since a relay-only client can run without
    /// a factory and vice versa.
    pub fn validate(&self) -> Result<(), EnvelopingError> {
        if self.relay_hub_address == Address::ZERO {
            return Err(EnvelopingError::Configuration(
                "relay hub address is not set".into(),
            ));
        }
        if self.relay_lookup_window_parts == 0 {
            return Err(EnvelopingError::Configuration(
                "relay lookup window parts must be at least 1".into(),
            ));
        }
        if self.slice_size == 0 {
            return Err(EnvelopingError::Configuration(
                "slice size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn defaults_fail_validation_without_hub() {
        let config = EnvelopingConfig::default();
        assert!(config.validate().is_err());

        let config =
            config.with_relay_hub(address!("0x66Fa9FEAfB8Db66Fe2160ca7aEAc7FC24e254387"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_slice_size_is_rejected() {
        let mut config = EnvelopingConfig::default()
            .with_relay_hub(address!("0x66Fa9FEAfB8Db66Fe2160ca7aEAc7FC24e254387"));
        config.slice_size = 0;
        assert!(config.validate().is_err());
    }
}
