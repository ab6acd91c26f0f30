//! # Enveloping Client
//!
//! Client library for relaying gas-less meta-transactions through
//! third-party relay servers: the sender signs a typed request, a relay pays
//! the gas and executes it on-chain through a forwarding wallet, and is
//! reimbursed in an ERC-20 token or native currency taken from that wallet.
//!
//! The pipeline discovers viable relays from on-chain registration events,
//! races them for the fastest usable one, dry-runs the request before any
//! gas is risked, validates the relay's signed transaction against what was
//! asked of it, and independently re-broadcasts it in case the relay drops
//! it.

pub mod client;
pub mod config;
pub mod constants;
pub mod directory;
pub mod error;
pub mod events;
pub mod gateway;
pub mod selector;
pub mod signer;
pub mod transport;
pub mod types;
pub mod validator;

pub use client::{Deployment, RelayClient, RelayingResult, TransactionDetails};
pub use config::EnvelopingConfig;
pub use error::EnvelopingError;
