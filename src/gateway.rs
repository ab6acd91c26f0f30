//! Thin façade over the chain RPC endpoint.
//!
//! Everything the pipeline needs from the node goes through here: nonce
//! reads, corrected gas estimates, local dry runs of the hub entry points,
//! historical event scans, receipt polling and raw broadcasts.

use crate::{
    config::EnvelopingConfig,
    constants::{ESTIMATED_GAS_CORRECTION_FACTOR, INTERNAL_TRANSACTION_ESTIMATE_CORRECTION},
    error::GatewayError,
    types::contracts::{
        DeployVerifier, ForwardingWallet, IERC20, RelayHub, RelayVerifier, WalletFactory,
    },
    types::{DeployRequest, RelayRequest},
};
use alloy::{
    network::TransactionBuilder,
    primitives::{Address, Bytes, B256, U256},
    providers::{DynProvider, Provider},
    rpc::types::{Filter, Log, TransactionReceipt, TransactionRequest},
    sol_types::SolCall,
    transports::TransportResult,
};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, trace};

/// Outcome of a local, non-broadcast dry run of a hub entry point.
///
/// Three rejects are distinguishable: the verifier refused (no gas would be
/// spent by the relay), the hub call itself reverted, or the destination call
/// executed and failed while the wallet still pays the relay. Only the last
/// one is not an error for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationOutcome {
    /// Whether the verifier accepted the request.
    pub verifier_accepted: bool,
    /// Whether the dry run of the hub call reverted.
    pub reverted: bool,
    /// Whether the destination call executed and failed. The wallet pays the
    /// relay regardless, so this is a diagnostic for the sender, not a
    /// rejection.
    pub reverted_in_destination: bool,
    /// Revert reason, when one was decoded.
    pub message: Option<String>,
}

impl SimulationOutcome {
    fn verifier_rejected(message: String) -> Self {
        Self {
            verifier_accepted: false,
            reverted: false,
            reverted_in_destination: false,
            message: Some(message),
        }
    }

    fn reverted(message: String) -> Self {
        Self {
            verifier_accepted: true,
            reverted: true,
            reverted_in_destination: false,
            message: Some(message),
        }
    }

    fn accepted(reverted_in_destination: bool) -> Self {
        Self {
            verifier_accepted: true,
            reverted: false,
            reverted_in_destination,
            message: None,
        }
    }

    /// Whether the request can be handed to a relay as-is.
    pub fn is_acceptable(&self) -> bool {
        self.verifier_accepted && !self.reverted
    }
}

/// Subtracts the internal-call correction from a raw `eth_estimateGas`
/// result. Estimates at or below the correction pass through unchanged, so
/// the result is never zeroed out, let alone negative.
pub fn apply_internal_estimation_correction(estimate: u64) -> u64 {
    if estimate > INTERNAL_TRANSACTION_ESTIMATE_CORRECTION {
        estimate - INTERNAL_TRANSACTION_ESTIMATE_CORRECTION
    } else {
        estimate
    }
}

/// Applies the safety factor to a corrected estimate, rounding up.
pub fn apply_gas_correction_factor(estimate: u64, factor: f64) -> u64 {
    (estimate as f64 * factor).ceil() as u64
}

/// Gas a relay worker can actually spend: its balance divided by the gas
/// price, zero when the gas price is zero.
pub fn spendable_gas(balance: U256, gas_price: u128) -> u64 {
    if gas_price == 0 {
        0
    } else {
        (balance / U256::from(gas_price)).saturating_to::<u64>()
    }
}

/// Façade over one chain RPC endpoint.
#[derive(Debug, Clone)]
pub struct ChainGateway {
    provider: DynProvider,
    config: Arc<EnvelopingConfig>,
}

impl ChainGateway {
    /// Wraps a provider with the client configuration.
    pub fn new(provider: DynProvider, config: Arc<EnvelopingConfig>) -> Self {
        Self { provider, config }
    }

    /// The underlying provider.
    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }

    /// Reads the request nonce: the factory's per-owner counter for deploy
    /// requests, the forwarding wallet's own counter otherwise.
    pub async fn get_nonce(
        &self,
        owner_or_wallet: Address,
        is_deploy: bool,
    ) -> Result<U256, GatewayError> {
        let nonce = if is_deploy {
            WalletFactory::new(self.config.smart_wallet_factory_address, &self.provider)
                .nonce(owner_or_wallet)
                .call()
                .await?
        } else {
            ForwardingWallet::new(owner_or_wallet, &self.provider)
                .nonce()
                .call()
                .await?
        };
        Ok(nonce)
    }

    /// Counterfactual wallet address the factory would deploy to.
    pub async fn predict_wallet_address(
        &self,
        owner: Address,
        recoverer: Address,
        index: U256,
    ) -> Result<Address, GatewayError> {
        let address =
            WalletFactory::new(self.config.smart_wallet_factory_address, &self.provider)
                .getSmartWalletAddress(owner, recoverer, index)
                .call()
                .await?;
        Ok(address)
    }

    /// Estimates the gas of the destination call as the forwarding wallet
    /// will make it internally.
    ///
    /// `eth_estimateGas` prices a top-level transaction; the relayed call
    /// runs as an internal `CALL` from the wallet and costs less, so the
    /// fixed correction is subtracted (when `add_correction` is set) before
    /// the safety factor is applied.
    pub async fn estimate_destination_call_gas(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
        gas_price: u128,
        add_correction: bool,
    ) -> Result<u64, GatewayError> {
        let tx = TransactionRequest::default()
            .with_from(from)
            .with_to(to)
            .with_gas_price(gas_price)
            .with_input(data);
        let raw = self.provider.estimate_gas(tx).await?;

        let corrected = if add_correction {
            apply_internal_estimation_correction(raw)
        } else {
            raw
        };
        let estimate = apply_gas_correction_factor(corrected, ESTIMATED_GAS_CORRECTION_FACTOR);
        trace!(raw, estimate, "estimated destination call gas");
        Ok(estimate)
    }

    /// Estimates the gas of the wallet's token-payment transfer.
    pub async fn estimate_token_transfer_gas(
        &self,
        token: Address,
        payer: Address,
        recipient: Address,
        amount: U256,
        gas_price: u128,
    ) -> Result<u64, GatewayError> {
        let data = IERC20::transferCall {
            to: recipient,
            amount,
        }
        .abi_encode();
        self.estimate_destination_call_gas(payer, token, data.into(), gas_price, true)
            .await
    }

    /// Dry-runs a relay call exactly as it will later be broadcast.
    ///
    /// Gas is capped at what the relay worker can spend, so a request that
    /// would exhaust the worker's funds reverts here instead of on-chain.
    pub async fn simulate_relay_call(
        &self,
        request: &RelayRequest,
        signature: &Bytes,
    ) -> Result<SimulationOutcome, GatewayError> {
        let worker = request.relayData.relayWorker;
        let gas_price = request.relayData.gasPrice.saturating_to::<u128>();

        let verifier = RelayVerifier::new(request.relayData.callVerifier, &self.provider);
        if let Err(e) = verifier
            .verifyRelayedCall(request.clone(), signature.clone())
            .from(worker)
            .call()
            .await
        {
            return Ok(SimulationOutcome::verifier_rejected(e.to_string()));
        }

        let gas_cap = spendable_gas(self.balance(worker).await?, gas_price);
        let hub = RelayHub::new(self.config.relay_hub_address, &self.provider);
        match hub
            .relayCall(request.clone(), signature.clone())
            .from(worker)
            .gas(gas_cap)
            .gas_price(gas_price)
            .call()
            .await
        {
            Ok(destination_success) => Ok(SimulationOutcome::accepted(!destination_success)),
            Err(e) => Ok(SimulationOutcome::reverted(e.to_string())),
        }
    }

    /// Dry-runs a deploy call exactly as it will later be broadcast.
    pub async fn simulate_deploy_call(
        &self,
        request: &DeployRequest,
        signature: &Bytes,
    ) -> Result<SimulationOutcome, GatewayError> {
        let worker = request.relayData.relayWorker;
        let gas_price = request.relayData.gasPrice.saturating_to::<u128>();

        let verifier = DeployVerifier::new(request.relayData.callVerifier, &self.provider);
        if let Err(e) = verifier
            .verifyRelayedCall(request.clone(), signature.clone())
            .from(worker)
            .call()
            .await
        {
            return Ok(SimulationOutcome::verifier_rejected(e.to_string()));
        }

        let gas_cap = spendable_gas(self.balance(worker).await?, gas_price);
        let hub = RelayHub::new(self.config.relay_hub_address, &self.provider);
        match hub
            .deployCall(request.clone(), signature.clone())
            .from(worker)
            .gas(gas_cap)
            .gas_price(gas_price)
            .call()
            .await
        {
            Ok(_) => Ok(SimulationOutcome::accepted(false)),
            Err(e) => Ok(SimulationOutcome::reverted(e.to_string())),
        }
    }

    /// Fetches hub logs for the given event signatures in a block range.
    /// `extra_topics` constrains the first indexed parameter (the relay
    /// manager for every registration-lifecycle event).
    pub async fn scan_hub_events(
        &self,
        event_signatures: Vec<B256>,
        extra_topics: Vec<B256>,
        from_block: u64,
        to_block: u64,
    ) -> TransportResult<Vec<Log>> {
        let mut filter = Filter::new()
            .address(self.config.relay_hub_address)
            .from_block(from_block)
            .to_block(to_block)
            .event_signature(event_signatures);
        if !extra_topics.is_empty() {
            filter = filter.topic1(extra_topics);
        }
        self.provider.get_logs(&filter).await
    }

    /// Polls for a mined receipt with exponential backoff.
    pub async fn wait_for_receipt(
        &self,
        hash: B256,
        retries: u32,
        initial_backoff: Duration,
    ) -> Result<TransactionReceipt, GatewayError> {
        let mut backoff = initial_backoff;
        for attempt in 0..retries {
            if let Some(receipt) = self.provider.get_transaction_receipt(hash).await? {
                return Ok(receipt);
            }
            debug!(%hash, attempt, "receipt not found yet, backing off");
            sleep(backoff).await;
            backoff *= 2;
        }
        Err(GatewayError::ReceiptNotFound {
            hash,
            attempts: retries,
        })
    }

    /// Submits a pre-signed raw transaction straight through the node RPC,
    /// without waiting for it to be mined.
    pub async fn broadcast_raw(&self, raw: &Bytes) -> Result<B256, GatewayError> {
        let hash: B256 = self
            .provider
            .client()
            .request("eth_sendRawTransaction", (raw.clone(),))
            .await?;
        Ok(hash)
    }

    /// Whether the transaction is already known to the network, mined or
    /// pending in the mempool.
    pub async fn is_already_submitted(&self, hash: B256) -> Result<bool, GatewayError> {
        let (receipt, pending) = tokio::try_join!(
            self.provider.get_transaction_receipt(hash),
            self.provider.get_transaction_by_hash(hash),
        )?;
        Ok(receipt.is_some() || pending.is_some())
    }

    /// Current account transaction count of `address`.
    pub async fn transaction_count(&self, address: Address) -> Result<u64, GatewayError> {
        Ok(self.provider.get_transaction_count(address).await?)
    }

    /// Current network gas price in wei.
    pub async fn gas_price(&self) -> Result<u128, GatewayError> {
        Ok(self.provider.get_gas_price().await?)
    }

    /// Native balance of `address`.
    pub async fn balance(&self, address: Address) -> Result<U256, GatewayError> {
        Ok(self.provider.get_balance(address).await?)
    }

    /// Latest block number.
    pub async fn block_number(&self) -> Result<u64, GatewayError> {
        Ok(self.provider.get_block_number().await?)
    }

    /// Whether code is deployed at `address`. Some nodes answer `0x00`
    /// instead of empty code for absent contracts, so both count as empty.
    pub async fn is_contract_deployed(&self, address: Address) -> Result<bool, GatewayError> {
        let code = self.provider.get_code_at(address).await?;
        Ok(!(code.is_empty() || code.as_ref() == [0u8]))
    }
}

/// Whether a broadcast error means the transaction is already in flight,
/// which callers treat as success rather than failure.
pub fn is_known_transaction_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("known transaction")
        || message.contains("already known")
        || message.contains("correct nonce")
        || message.contains("nonce too low")
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::{
        primitives::address,
        providers::{mock::Asserter, ProviderBuilder},
    };

    fn mocked_gateway(asserter: &Asserter) -> ChainGateway {
        let provider = ProviderBuilder::new()
            .connect_mocked_client(asserter.clone())
            .erased();
        let config = EnvelopingConfig::default()
            .with_relay_hub(address!("0x66Fa9FEAfB8Db66Fe2160ca7aEAc7FC24e254387"));
        ChainGateway::new(provider, Arc::new(config))
    }

    #[test]
    fn internal_correction_never_underflows() {
        assert_eq!(apply_internal_estimation_correction(70_000), 50_000);
        // At or below the correction the raw estimate passes through.
        assert_eq!(apply_internal_estimation_correction(20_000), 20_000);
        assert_eq!(apply_internal_estimation_correction(19_999), 19_999);
        assert_eq!(apply_internal_estimation_correction(0), 0);
    }

    #[test]
    fn correction_factor_rounds_up() {
        assert_eq!(apply_gas_correction_factor(100, 1.0), 100);
        assert_eq!(apply_gas_correction_factor(100, 1.25), 125);
        assert_eq!(apply_gas_correction_factor(101, 1.25), 127);
        assert_eq!(apply_gas_correction_factor(3, 1.1), 4);
    }

    #[test]
    fn spendable_gas_floors_at_zero_gas_price() {
        assert_eq!(spendable_gas(U256::from(1_000_000u64), 0), 0);
        assert_eq!(spendable_gas(U256::from(1_000_000u64), 100), 10_000);
        // A huge balance saturates instead of overflowing.
        assert_eq!(spendable_gas(U256::MAX, 1), u64::MAX);
    }

    #[test]
    fn known_transaction_errors_are_recognized() {
        assert!(is_known_transaction_error(
            "the tx doesn't have the correct nonce"
        ));
        assert!(is_known_transaction_error("known transaction: 0xabc"));
        assert!(is_known_transaction_error("ALREADY KNOWN"));
        assert!(!is_known_transaction_error("insufficient funds"));
    }

    #[tokio::test]
    async fn estimate_applies_the_internal_correction() {
        let asserter = Asserter::new();
        let gateway = mocked_gateway(&asserter);

        // Raw estimate of 70_000 gas.
        asserter.push_success(&format!("0x{:x}", 70_000u64));
        let estimate = gateway
            .estimate_destination_call_gas(
                address!("0x8464135C8f25da09e49bc8782676A84730c318bC"),
                address!("0x5FC8d32690CC91d4C39d9D3ABCBD16989f875707"),
                Bytes::new(),
                1_000_000_000,
                true,
            )
            .await
            .unwrap();
        assert_eq!(estimate, 50_000);

        // Without the correction the raw estimate is only factored.
        asserter.push_success(&format!("0x{:x}", 70_000u64));
        let estimate = gateway
            .estimate_destination_call_gas(
                address!("0x8464135C8f25da09e49bc8782676A84730c318bC"),
                address!("0x5FC8d32690CC91d4C39d9D3ABCBD16989f875707"),
                Bytes::new(),
                1_000_000_000,
                false,
            )
            .await
            .unwrap();
        assert_eq!(estimate, 70_000);
    }

    #[tokio::test]
    async fn receipt_polling_gives_up_after_retries() {
        let asserter = Asserter::new();
        let gateway = mocked_gateway(&asserter);

        for _ in 0..3 {
            asserter.push_success(&serde_json::Value::Null);
        }
        let err = gateway
            .wait_for_receipt(B256::ZERO, 3, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::ReceiptNotFound { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn wallet_nonce_is_read_from_the_wallet_itself() {
        let asserter = Asserter::new();
        let gateway = mocked_gateway(&asserter);

        asserter.push_success(
            &"0x0000000000000000000000000000000000000000000000000000000000000005",
        );
        let nonce = gateway
            .get_nonce(
                address!("0x8464135C8f25da09e49bc8782676A84730c318bC"),
                false,
            )
            .await
            .unwrap();
        assert_eq!(nonce, U256::from(5));
    }

    #[tokio::test]
    async fn unknown_hash_is_not_already_submitted() {
        let asserter = Asserter::new();
        let gateway = mocked_gateway(&asserter);

        asserter.push_success(&serde_json::Value::Null);
        asserter.push_success(&serde_json::Value::Null);
        assert!(!gateway.is_already_submitted(B256::ZERO).await.unwrap());
    }
}
