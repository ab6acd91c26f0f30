//! Contract bindings for the relay hub, the forwarding wallet, the wallet
//! factory, the verifiers and the fee token.
//!
//! The request structs double as the EIP-712 payloads the sender signs and as
//! the ABI tuples the hub call is encoded with, so they live in one place.

use alloy::sol;
use serde::{Deserialize, Serialize};

sol! {
    /// The signed body of a relay request: a call made by an existing
    /// forwarding wallet on the sender's behalf.
    #[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    struct ForwardRequest {
        address relayHub;
        address from;
        address to;
        address tokenContract;
        uint256 value;
        uint256 gas;
        uint256 nonce;
        uint256 tokenAmount;
        uint256 tokenGas;
        uint256 validUntilTime;
        bytes data;
    }

    /// The signed body of a deploy request: instantiates a new forwarding
    /// wallet through the factory instead of calling an existing one.
    #[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    struct DeployForwardRequest {
        address relayHub;
        address from;
        address to;
        address tokenContract;
        address recoverer;
        uint256 value;
        uint256 nonce;
        uint256 tokenAmount;
        uint256 tokenGas;
        uint256 validUntilTime;
        uint256 index;
        bytes data;
    }

    /// Relay-execution parameters shared by both request shapes.
    #[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    struct RelayData {
        uint256 gasPrice;
        bytes32 domainSeparator;
        address relayWorker;
        address callForwarder;
        address callVerifier;
    }

    /// A relay request as signed by the sender and encoded for the hub.
    #[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    struct RelayRequest {
        ForwardRequest request;
        RelayData relayData;
    }

    /// A deploy request as signed by the sender and encoded for the hub.
    #[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    struct DeployRequest {
        DeployForwardRequest request;
        RelayData relayData;
    }

    /// The relay hub: entry point the relay worker's transaction targets,
    /// and emitter of the relay registration lifecycle events.
    #[sol(rpc)]
    #[derive(Debug)]
    contract RelayHub {
        /// Emitted when a relay manager (re-)registers its server URL.
        event RelayServerRegistered(address indexed relayManager, string relayUrl);

        /// Emitted when a relay manager's stake is unlocked; the relay is no
        /// longer eligible to serve requests.
        event StakeUnlocked(address indexed relayManager, address indexed owner, uint256 withdrawBlock);

        /// Emitted when a relay manager is penalized and its stake slashed.
        event StakePenalized(address indexed relayManager, address beneficiary, uint256 reward);

        function relayCall(RelayRequest relayRequest, bytes signature) external returns (bool destinationCallSuccess);

        function deployCall(DeployRequest deployRequest, bytes signature) external;
    }

    /// Verifier consulted before a relay call; reverts to reject.
    #[sol(rpc)]
    contract RelayVerifier {
        function verifyRelayedCall(RelayRequest relayRequest, bytes signature) external view returns (bytes context);
    }

    /// Verifier consulted before a deploy call; reverts to reject.
    #[sol(rpc)]
    contract DeployVerifier {
        function verifyRelayedCall(DeployRequest deployRequest, bytes signature) external view returns (bytes context);
    }

    /// The per-user forwarding wallet.
    #[sol(rpc)]
    contract ForwardingWallet {
        function nonce() external view returns (uint256);
    }

    /// Factory that instantiates forwarding wallets at predictable addresses.
    #[sol(rpc)]
    contract WalletFactory {
        function nonce(address from) external view returns (uint256);

        function getSmartWalletAddress(address owner, address recoverer, uint256 index) external view returns (address);
    }

    /// Minimal ERC-20 surface used for token-payment gas estimation.
    #[sol(rpc)]
    contract IERC20 {
        function transfer(address to, uint256 amount) external returns (bool);

        function balanceOf(address owner) external view returns (uint256);
    }
}
