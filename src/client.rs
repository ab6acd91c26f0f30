//! The relay client: public entry point of the pipeline.
//!
//! `relay()` discovers viable relays, races them for the fastest usable one,
//! builds and signs the typed request, dry-runs it before any gas is risked,
//! submits it, validates what the relay returns, and independently
//! re-broadcasts the signed transaction as a liveness guarantee against a
//! relay that silently drops it.

use crate::{
    config::EnvelopingConfig,
    directory::RelayDirectory,
    error::{
        EnvelopingError, GatewayError, PingError, RelayingError, ValidationError,
    },
    events::{RelayEvent, RelayEvents},
    gateway::{is_known_transaction_error, ChainGateway},
    selector::{PingFilter, RelayInfo, RelaySelector},
    signer::RequestSigner,
    transport::{HttpRelayTransport, RelayTransport},
    types::{
        contracts::{DeployForwardRequest, ForwardRequest},
        domain_separator, DeployRequest, EnvelopingRequest, RelayData, RelayMetadata,
        RelayRequest, RelayTransactionRequest,
    },
    validator::validate_relay_response,
};
use alloy::{
    consensus::TxEnvelope,
    eips::eip2718::Decodable2718,
    primitives::{Address, Bytes, U256},
    providers::DynProvider,
};
use std::{collections::HashMap, fmt::Write as _, sync::Arc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Wallet-deployment parameters of a deploy request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deployment {
    /// Wallet index, letting one owner deploy multiple wallets.
    pub index: U256,
    /// Recovery address baked into the new wallet, zero for none.
    pub recoverer: Address,
}

/// User-level description of the transaction to relay.
///
/// The deploy shape is selected by `deployment`; everything downstream
/// carries that tag explicitly.
#[derive(Debug, Clone, Default)]
pub struct TransactionDetails {
    /// Sender EOA owning the forwarding wallet.
    pub from: Address,
    /// Destination contract of the relayed call.
    pub to: Address,
    /// Call data for the destination contract.
    pub data: Bytes,
    /// Native value forwarded with the call.
    pub value: U256,
    /// Token the relay is paid in, zero address for a subsidized call.
    pub token_contract: Address,
    /// Token amount paid to the relay, zero if subsidized.
    pub token_amount: U256,
    /// Gas limit of the token payment; estimated when absent.
    pub token_gas: Option<U256>,
    /// Gas limit of the destination call; estimated when absent.
    pub gas_limit: Option<u64>,
    /// Gas price override; computed from the network price when absent.
    pub force_gas_price: Option<u128>,
    /// Unix timestamp after which the request must not execute, zero for no
    /// expiry.
    pub valid_until_time: u64,
    /// Forwarding wallet override; the configured one is used when absent.
    pub call_forwarder: Option<Address>,
    /// Verifier override; the configured per-kind verifier is used when
    /// absent.
    pub call_verifier: Option<Address>,
    /// Per-call override of the configured only-preferred policy.
    pub only_preferred_relays: Option<bool>,
    /// Present on requests that deploy a new forwarding wallet.
    pub deployment: Option<Deployment>,
}

impl TransactionDetails {
    /// A relayed call through an existing forwarding wallet.
    pub fn call(from: Address, to: Address, data: Bytes) -> Self {
        Self {
            from,
            to,
            data,
            ..Default::default()
        }
    }

    /// A deploy request for a new forwarding wallet.
    pub fn deploy(from: Address, index: U256) -> Self {
        Self {
            from,
            deployment: Some(Deployment {
                index,
                recoverer: Address::ZERO,
            }),
            ..Default::default()
        }
    }

    fn is_deploy(&self) -> bool {
        self.deployment.is_some()
    }
}

/// Outcome of one `relay()` call.
///
/// Per-relay failures are reported here in full, keyed by relay URL, so a
/// caller can tell a systemic condition (every relay demanding a higher gas
/// price) from one bad relay.
#[derive(Debug)]
pub struct RelayingResult {
    /// The relay's signed transaction, once one passed validation. `None`
    /// when every candidate was exhausted.
    pub transaction: Option<TxEnvelope>,
    /// Ping failures per relay URL.
    pub ping_errors: HashMap<String, PingError>,
    /// Relaying failures per relay URL.
    pub relaying_errors: HashMap<String, RelayingError>,
    /// The pre-flight dry run predicted the destination call will revert.
    /// The wallet pays the relay regardless; what to do about the fee is the
    /// caller's decision.
    pub destination_reverted: bool,
}

impl RelayingResult {
    /// Renders every recorded failure for diagnostics.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        if !self.ping_errors.is_empty() {
            let _ = writeln!(out, "Ping errors ({}):", self.ping_errors.len());
            for (url, error) in &self.ping_errors {
                let _ = writeln!(out, "{url} => {error}");
            }
        }
        if !self.relaying_errors.is_empty() {
            let _ = writeln!(out, "Relaying errors ({}):", self.relaying_errors.len());
            for (url, error) in &self.relaying_errors {
                let _ = writeln!(out, "{url} => {error}");
            }
        }
        out
    }
}

/// Default ping filter: a relay demanding more than the gas price proposed
/// for this attempt is rejected.
pub fn gas_price_ping_filter() -> PingFilter {
    Arc::new(|ping, proposed_gas_price| {
        if ping.min_gas_price > U256::from(proposed_gas_price) {
            Err(format!(
                "proposed gas price {proposed_gas_price} below relay minimum {}",
                ping.min_gas_price
            ))
        } else {
            Ok(())
        }
    })
}

enum AttemptError {
    /// Stops the whole `relay()` call.
    Fatal(EnvelopingError),
    /// Recorded against the relay; the next candidate is tried.
    Relay(RelayingError),
}

impl From<RelayingError> for AttemptError {
    fn from(error: RelayingError) -> Self {
        Self::Relay(error)
    }
}

impl From<GatewayError> for AttemptError {
    fn from(error: GatewayError) -> Self {
        Self::Relay(error.into())
    }
}

/// Client that relays transactions through third-party relay servers.
pub struct RelayClient<T: RelayTransport = HttpRelayTransport> {
    config: Arc<EnvelopingConfig>,
    gateway: Arc<ChainGateway>,
    directory: RelayDirectory,
    transport: T,
    signer: Arc<dyn RequestSigner>,
    ping_filter: PingFilter,
    events: RelayEvents,
}

impl RelayClient<HttpRelayTransport> {
    /// Creates a client over the given provider with the reqwest transport.
    pub fn new(
        provider: DynProvider,
        config: EnvelopingConfig,
        signer: Arc<dyn RequestSigner>,
    ) -> Result<Self, EnvelopingError> {
        let transport = HttpRelayTransport::new(config.http_timeout)?;
        Self::with_transport(provider, config, signer, transport)
    }
}

impl<T: RelayTransport> RelayClient<T> {
    /// Creates a client with a caller-supplied relay transport.
    pub fn with_transport(
        provider: DynProvider,
        config: EnvelopingConfig,
        signer: Arc<dyn RequestSigner>,
        transport: T,
    ) -> Result<Self, EnvelopingError> {
        config.validate()?;
        let config = Arc::new(config);
        let gateway = Arc::new(ChainGateway::new(provider, config.clone()));
        let directory = RelayDirectory::new(gateway.clone(), config.clone());
        Ok(Self {
            config,
            gateway,
            directory,
            transport,
            signer,
            ping_filter: gas_price_ping_filter(),
            events: RelayEvents::new(),
        })
    }

    /// Replaces the ping filter applied during relay selection.
    pub fn with_ping_filter(mut self, filter: PingFilter) -> Self {
        self.ping_filter = filter;
        self
    }

    /// The known-relay directory backing this client.
    pub fn directory(&self) -> &RelayDirectory {
        &self.directory
    }

    /// The chain gateway backing this client.
    pub fn gateway(&self) -> &ChainGateway {
        &self.gateway
    }

    /// The relay transport backing this client.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Subscribes to lifecycle progress events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Relays `details` through the best currently-available relay.
    ///
    /// Per-relay failures rotate to the next candidate; only configuration
    /// faults, discovery failure, a total lack of candidates, or an
    /// integrity violation in a relay's response abort the call.
    pub async fn relay(
        &self,
        details: TransactionDetails,
    ) -> Result<RelayingResult, EnvelopingError> {
        self.events.emit(RelayEvent::Init);
        let forwarder = self.resolve_forwarder(&details)?;
        let verifier = self.resolve_verifier(&details)?;

        self.events.emit(RelayEvent::RefreshRelays);
        self.directory
            .refresh()
            .await
            .map_err(EnvelopingError::DirectoryUnavailable)?;

        let gas_price = match details.force_gas_price {
            Some(price) => price,
            None => self.calculate_gas_price().await?,
        };

        // The hub budgets the destination call for relay requests only; a
        // deploy carries a zero placeholder.
        let gas_limit = if details.is_deploy() {
            0
        } else {
            match details.gas_limit {
                Some(gas) => gas,
                None => {
                    self.gateway
                        .estimate_destination_call_gas(
                            forwarder,
                            details.to,
                            details.data.clone(),
                            gas_price,
                            true,
                        )
                        .await?
                }
            }
        };
        let token_gas = self.resolve_token_gas(&details, forwarder, gas_price).await?;

        let only_preferred = details
            .only_preferred_relays
            .unwrap_or(self.config.only_preferred_relays);
        let mut tiers = self.directory.tiers().await;
        if only_preferred {
            tiers.truncate(1);
        }
        let mut selector = RelaySelector::new(
            &self.directory,
            &self.transport,
            self.config.as_ref(),
            self.ping_filter.clone(),
            Some(verifier),
            gas_price,
            tiers,
        );
        if selector.candidates_left() == 0 {
            return Err(EnvelopingError::NoRegisteredRelays);
        }
        self.events.emit(RelayEvent::DoneRefreshRelays {
            relays_count: selector.candidates_left(),
        });

        let mut relaying_errors = HashMap::new();
        let mut destination_reverted = false;
        loop {
            let Some(relay_info) = selector.select_next_relay().await? else {
                break;
            };
            let url = relay_info.endpoint.url.clone();
            self.events.emit(RelayEvent::NextRelay { url: url.clone() });

            match self
                .attempt_relay(
                    &relay_info,
                    &details,
                    forwarder,
                    verifier,
                    gas_price,
                    gas_limit,
                    token_gas,
                    &mut destination_reverted,
                )
                .await
            {
                Ok(transaction) => {
                    info!(url = %url, hash = %transaction.tx_hash(), "transaction relayed");
                    return Ok(RelayingResult {
                        transaction: Some(transaction),
                        ping_errors: selector.into_errors(),
                        relaying_errors,
                        destination_reverted,
                    });
                }
                Err(AttemptError::Fatal(error)) => return Err(error),
                Err(AttemptError::Relay(error)) => {
                    warn!(url = %url, error = %error, "relay attempt failed, rotating");
                    relaying_errors.insert(url.as_str().to_string(), error);
                }
            }
        }

        Ok(RelayingResult {
            transaction: None,
            ping_errors: selector.into_errors(),
            relaying_errors,
            destination_reverted,
        })
    }

    /// Assembles and signs the typed request for a known relay worker,
    /// without contacting any relay.
    ///
    /// Resolves the nonce, gas price, destination-call gas and token-payment
    /// gas the same way `relay()` does; useful for embedders that submit the
    /// request through their own channel.
    pub async fn prepare_request(
        &self,
        details: &TransactionDetails,
        relay_worker: Address,
    ) -> Result<(EnvelopingRequest, Bytes), EnvelopingError> {
        let forwarder = self.resolve_forwarder(details)?;
        let verifier = self.resolve_verifier(details)?;
        let gas_price = match details.force_gas_price {
            Some(price) => price,
            None => self.calculate_gas_price().await?,
        };
        let gas_limit = if details.is_deploy() {
            0
        } else {
            match details.gas_limit {
                Some(gas) => gas,
                None => {
                    self.gateway
                        .estimate_destination_call_gas(
                            forwarder,
                            details.to,
                            details.data.clone(),
                            gas_price,
                            true,
                        )
                        .await?
                }
            }
        };
        let token_gas = self.resolve_token_gas(details, forwarder, gas_price).await?;
        let nonce = if details.is_deploy() {
            self.gateway.get_nonce(details.from, true).await?
        } else {
            self.gateway.get_nonce(forwarder, false).await?
        };

        let request = self.build_typed_request(
            details,
            forwarder,
            verifier,
            relay_worker,
            gas_price,
            gas_limit,
            token_gas,
            nonce,
        );
        let signature = self
            .signer
            .sign_request(&request, self.config.chain_id)
            .await?;
        Ok((request, signature))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_typed_request(
        &self,
        details: &TransactionDetails,
        forwarder: Address,
        verifier: Address,
        relay_worker: Address,
        gas_price: u128,
        gas_limit: u64,
        token_gas: U256,
        nonce: U256,
    ) -> EnvelopingRequest {
        let relay_data = RelayData {
            gasPrice: U256::from(gas_price),
            domainSeparator: domain_separator(forwarder, self.config.chain_id),
            relayWorker: relay_worker,
            callForwarder: forwarder,
            callVerifier: verifier,
        };
        match &details.deployment {
            Some(deployment) => EnvelopingRequest::Deploy(DeployRequest {
                request: DeployForwardRequest {
                    relayHub: self.config.relay_hub_address,
                    from: details.from,
                    to: details.to,
                    tokenContract: details.token_contract,
                    recoverer: deployment.recoverer,
                    value: details.value,
                    nonce,
                    tokenAmount: details.token_amount,
                    tokenGas: token_gas,
                    validUntilTime: U256::from(details.valid_until_time),
                    index: deployment.index,
                    data: details.data.clone(),
                },
                relayData: relay_data,
            }),
            None => EnvelopingRequest::Relay(RelayRequest {
                request: ForwardRequest {
                    relayHub: self.config.relay_hub_address,
                    from: details.from,
                    to: details.to,
                    tokenContract: details.token_contract,
                    value: details.value,
                    gas: U256::from(gas_limit),
                    nonce,
                    tokenAmount: details.token_amount,
                    tokenGas: token_gas,
                    validUntilTime: U256::from(details.valid_until_time),
                    data: details.data.clone(),
                },
                relayData: relay_data,
            }),
        }
    }

    /// Network gas price with the configured markup, floored at the minimum.
    async fn calculate_gas_price(&self) -> Result<u128, EnvelopingError> {
        let network = self.gateway.gas_price().await?;
        let factor = u128::from(self.config.gas_price_factor_percent);
        let marked_up = network.saturating_mul(100 + factor) / 100;
        Ok(marked_up.max(self.config.min_gas_price))
    }

    fn resolve_forwarder(&self, details: &TransactionDetails) -> Result<Address, EnvelopingError> {
        let forwarder = if details.is_deploy() {
            self.config.smart_wallet_factory_address
        } else {
            details
                .call_forwarder
                .unwrap_or(self.config.forwarder_address)
        };
        if forwarder == Address::ZERO {
            return Err(EnvelopingError::Configuration(if details.is_deploy() {
                "no wallet factory address configured".into()
            } else {
                "no forwarder address configured".into()
            }));
        }
        Ok(forwarder)
    }

    fn resolve_verifier(&self, details: &TransactionDetails) -> Result<Address, EnvelopingError> {
        let verifier = details.call_verifier.unwrap_or(if details.is_deploy() {
            self.config.deploy_verifier_address
        } else {
            self.config.relay_verifier_address
        });
        if verifier == Address::ZERO {
            return Err(EnvelopingError::Configuration(
                "no verifier address configured".into(),
            ));
        }
        Ok(verifier)
    }

    /// Resolves the token-payment gas: the caller's value, or an estimate of
    /// the wallet's transfer call. For a deploy the paying wallet does not
    /// exist yet, so the estimate runs from its counterfactual address.
    async fn resolve_token_gas(
        &self,
        details: &TransactionDetails,
        forwarder: Address,
        gas_price: u128,
    ) -> Result<U256, EnvelopingError> {
        if let Some(token_gas) = details.token_gas {
            return Ok(token_gas);
        }
        if details.token_amount.is_zero() || details.token_contract == Address::ZERO {
            return Ok(U256::ZERO);
        }

        let payer = match &details.deployment {
            Some(deployment) => {
                self.gateway
                    .predict_wallet_address(details.from, deployment.recoverer, deployment.index)
                    .await?
            }
            None => forwarder,
        };
        let gas = self
            .gateway
            .estimate_token_transfer_gas(
                details.token_contract,
                payer,
                Address::ZERO,
                details.token_amount,
                gas_price,
            )
            .await?;
        Ok(U256::from(gas))
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_relay(
        &self,
        relay_info: &RelayInfo,
        details: &TransactionDetails,
        forwarder: Address,
        verifier: Address,
        gas_price: u128,
        gas_limit: u64,
        token_gas: U256,
        destination_reverted: &mut bool,
    ) -> Result<TxEnvelope, AttemptError> {
        let url = &relay_info.endpoint.url;
        let manager = relay_info.endpoint.manager;
        let worker = relay_info.ping.relay_worker_address;
        debug!(url = %url, worker = %worker, "attempting relay");

        let nonce = if details.is_deploy() {
            self.gateway.get_nonce(details.from, true).await?
        } else {
            self.gateway.get_nonce(forwarder, false).await?
        };

        let request = self.build_typed_request(
            details,
            forwarder,
            verifier,
            worker,
            gas_price,
            gas_limit,
            token_gas,
            nonce,
        );

        self.events.emit(RelayEvent::SignRequest);
        let signature = self
            .signer
            .sign_request(&request, self.config.chain_id)
            .await
            .map_err(RelayingError::from)?;

        // The nonce bound is not signed; on-chain logic cannot check it.
        let worker_nonce = self.gateway.transaction_count(worker).await?;
        let metadata = RelayMetadata {
            relay_hub_address: self.config.relay_hub_address,
            signature: signature.clone(),
            relay_max_nonce: worker_nonce + self.config.max_relay_nonce_gap,
        };

        self.events.emit(RelayEvent::ValidateRequest);
        let outcome = match &request {
            EnvelopingRequest::Relay(relay_request) => {
                self.gateway
                    .simulate_relay_call(relay_request, &signature)
                    .await?
            }
            EnvelopingRequest::Deploy(deploy_request) => {
                self.gateway
                    .simulate_deploy_call(deploy_request, &signature)
                    .await?
            }
        };
        if !outcome.verifier_accepted {
            return Err(RelayingError::VerifierRejected {
                reason: outcome.message.unwrap_or_default(),
            }
            .into());
        }
        if outcome.reverted {
            return Err(RelayingError::SimulationReverted {
                reason: outcome.message.unwrap_or_default(),
            }
            .into());
        }
        if outcome.reverted_in_destination {
            // The relay still gets paid; surface the prediction to the
            // caller instead of rejecting the relay.
            warn!(url = %url, "dry run predicts the destination call will revert");
            *destination_reverted = true;
        }

        self.events.emit(RelayEvent::SendToRelayer { url: url.clone() });
        let wire_request = RelayTransactionRequest {
            request: request.clone(),
            metadata: metadata.clone(),
        };
        let raw = match self.transport.relay_transaction(url, &wire_request).await {
            Ok(raw) => raw,
            Err(error) => {
                self.directory.record_failure(manager, url).await;
                return Err(error.into());
            }
        };

        match validate_relay_response(&request, &metadata, self.config.relay_hub_address, &raw) {
            Ok(()) => self.events.emit(RelayEvent::RelayerResponse { success: true }),
            Err(ValidationError::NonceAboveMaximum { max_nonce, got }) => {
                self.events.emit(RelayEvent::RelayerResponse { success: false });
                return Err(AttemptError::Fatal(
                    EnvelopingError::NonceIntegrityViolation { max_nonce, got },
                ));
            }
            Err(validation) => {
                self.events.emit(RelayEvent::RelayerResponse { success: false });
                self.directory.record_failure(manager, url).await;
                return Err(RelayingError::from(validation).into());
            }
        }

        let transaction = TxEnvelope::decode_2718(&mut raw.as_ref()).map_err(|e| {
            RelayingError::from(ValidationError::MalformedTransaction(e.to_string()))
        })?;
        self.broadcast_defensively(&transaction, &raw).await;
        Ok(transaction)
    }

    /// Re-broadcasts the relay's signed transaction through the client's own
    /// node.
    ///
    /// If the relay never submits the transaction, this still gets it into
    /// the mempool. A nonce-already-used or known-transaction error means
    /// someone (most likely the relay) already broadcast it, so neither case
    /// fails the attempt.
    async fn broadcast_defensively(&self, transaction: &TxEnvelope, raw: &Bytes) {
        let hash = *transaction.tx_hash();
        match self.gateway.is_already_submitted(hash).await {
            Ok(true) => {
                debug!(%hash, "transaction already known to the network");
                return;
            }
            Ok(false) => {}
            Err(error) => {
                warn!(%hash, %error, "could not check the mempool before broadcasting");
            }
        }

        match self.gateway.broadcast_raw(raw).await {
            Ok(_) => info!(%hash, "independently broadcast the relayed transaction"),
            Err(error) => {
                let message = error.to_string();
                if is_known_transaction_error(&message) {
                    debug!(%hash, "broadcast reports the transaction already in flight");
                } else {
                    warn!(%hash, error = %message, "independent broadcast failed");
                }
            }
        }
    }
}
