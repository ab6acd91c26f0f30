//! Typed enveloping requests and their wire envelope.

use crate::{
    constants::{EIP712_DOMAIN_NAME, EIP712_DOMAIN_VERSION},
    types::contracts::{DeployRequest, RelayData, RelayHub, RelayRequest},
};
use alloy::{
    primitives::{Address, Bytes, B256, U256},
    sol_types::{Eip712Domain, SolCall, SolStruct},
};
use serde::{Deserialize, Serialize};

/// EIP-712 domain of the contract verifying the signed request: the
/// forwarding wallet for relay requests, the factory for deploy requests.
pub fn eip712_domain(verifying_contract: Address, chain_id: u64) -> Eip712Domain {
    Eip712Domain::new(
        Some(EIP712_DOMAIN_NAME.into()),
        Some(EIP712_DOMAIN_VERSION.into()),
        Some(U256::from(chain_id)),
        Some(verifying_contract),
        None,
    )
}

/// EIP-712 domain separator carried in [`RelayData`] and checked on-chain.
pub fn domain_separator(verifying_contract: Address, chain_id: u64) -> B256 {
    eip712_domain(verifying_contract, chain_id).hash_struct()
}

/// A request travelling through the relay pipeline.
///
/// Exactly one of the two shapes is active, and the tag is carried through
/// signing, simulation and validation; nothing downstream inspects field
/// presence to tell the shapes apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopingRequest {
    /// Call an existing forwarding wallet.
    #[serde(rename = "relayRequest")]
    Relay(RelayRequest),
    /// Instantiate a new forwarding wallet through the factory.
    #[serde(rename = "deployRequest")]
    Deploy(DeployRequest),
}

impl EnvelopingRequest {
    /// Whether this is a deploy request.
    pub fn is_deploy(&self) -> bool {
        matches!(self, Self::Deploy(_))
    }

    /// The sender the request was built for.
    pub fn from(&self) -> Address {
        match self {
            Self::Relay(request) => request.request.from,
            Self::Deploy(request) => request.request.from,
        }
    }

    /// The relay-execution parameters common to both shapes.
    pub fn relay_data(&self) -> &RelayData {
        match self {
            Self::Relay(request) => &request.relayData,
            Self::Deploy(request) => &request.relayData,
        }
    }

    /// EIP-712 digest the sender signs.
    ///
    /// The verifying contract is the call forwarder named in the relay data,
    /// which is also the contract whose domain separator is embedded there.
    pub fn signing_hash(&self, chain_id: u64) -> B256 {
        let domain = eip712_domain(self.relay_data().callForwarder, chain_id);
        match self {
            Self::Relay(request) => request.eip712_signing_hash(&domain),
            Self::Deploy(request) => request.eip712_signing_hash(&domain),
        }
    }

    /// ABI-encodes the hub call the relay worker is expected to broadcast.
    pub fn encode_hub_call(&self, signature: &Bytes) -> Bytes {
        match self {
            Self::Relay(request) => RelayHub::relayCallCall {
                relayRequest: request.clone(),
                signature: signature.clone(),
            }
            .abi_encode()
            .into(),
            Self::Deploy(request) => RelayHub::deployCallCall {
                deployRequest: request.clone(),
                signature: signature.clone(),
            }
            .abi_encode()
            .into(),
        }
    }
}

/// Request metadata sent alongside the signed payload.
///
/// `relay_max_nonce` is deliberately unsigned: on-chain logic cannot see
/// off-chain account nonces ahead of time, so the bound is enforced by the
/// client when the relay's signed transaction comes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMetadata {
    /// Hub the relay is expected to submit the request through.
    pub relay_hub_address: Address,
    /// EIP-712 signature over the request.
    pub signature: Bytes,
    /// Highest transaction nonce the client will accept from the worker.
    pub relay_max_nonce: u64,
}

/// Body of the `POST /relay` call: the signed request plus its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayTransactionRequest {
    /// The signed request, keyed `relayRequest` or `deployRequest` on the
    /// wire depending on its shape.
    #[serde(flatten)]
    pub request: EnvelopingRequest,
    /// Unsigned request metadata.
    pub metadata: RelayMetadata,
}
