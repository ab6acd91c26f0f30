//! Shared types of the relay pipeline.

pub mod contracts;
pub mod ping;
pub mod registration;
pub mod request;

pub use contracts::{
    DeployForwardRequest, DeployRequest, ForwardRequest, RelayData, RelayRequest,
};
pub use ping::PingResponse;
pub use registration::{RegistrationEvent, RelayEndpoint, RelayFailureInfo};
pub use request::{
    domain_separator, eip712_domain, EnvelopingRequest, RelayMetadata, RelayTransactionRequest,
};
