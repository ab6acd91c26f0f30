//! On-chain relay registration state: event variants, the active-set replay,
//! and the endpoint/failure records derived from it.

use crate::types::contracts::RelayHub;
use alloy::{
    primitives::Address,
    rpc::types::Log,
    sol_types::SolEvent,
};
use std::{
    collections::{HashMap, HashSet},
    time::SystemTime,
};
use url::Url;

/// A relay candidate: an advertised URL, plus the manager it is registered
/// under once that is known. Preferred relays start out with no manager and
/// are completed from chain state after they win a ping race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    /// Advertised relay server URL.
    pub url: Url,
    /// On-chain relay manager, when the endpoint came from discovery.
    pub manager: Option<Address>,
}

impl RelayEndpoint {
    /// An endpoint known only by URL, ahead of any on-chain association.
    pub fn preferred(url: Url) -> Self {
        Self { url, manager: None }
    }
}

/// One recorded failure of a relay, forgotten after the configured grace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFailureInfo {
    /// When the failure happened.
    pub last_error_time: SystemTime,
    /// Manager of the failing relay, when known.
    pub relay_manager: Option<Address>,
    /// URL the failure was observed against.
    pub relay_url: Url,
}

/// The closed set of registration-lifecycle events the directory replays.
///
/// Ordering is `(block_number, transaction_index)`; replay folds the sorted
/// sequence left to right, so a later event always overrides an earlier one
/// for the same manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// The manager (re-)registered a server URL; inserts into the active set.
    Registered {
        /// Registering relay manager.
        manager: Address,
        /// URL advertised in the registration.
        url: String,
        /// Block the event was emitted in.
        block_number: u64,
        /// Index of the emitting transaction within the block.
        transaction_index: u64,
    },
    /// The manager's stake was unlocked; removes it from the active set.
    Unlocked {
        /// Affected relay manager.
        manager: Address,
        /// Block the event was emitted in.
        block_number: u64,
        /// Index of the emitting transaction within the block.
        transaction_index: u64,
    },
    /// The manager was penalized; removes it from the active set.
    Penalized {
        /// Affected relay manager.
        manager: Address,
        /// Block the event was emitted in.
        block_number: u64,
        /// Index of the emitting transaction within the block.
        transaction_index: u64,
    },
}

impl RegistrationEvent {
    /// Decodes a hub log into a registration event, if it is one.
    pub fn try_from_log(log: &Log) -> Option<Self> {
        let block_number = log.block_number?;
        let transaction_index = log.transaction_index?;
        let topic0 = log.topic0()?;

        if *topic0 == RelayHub::RelayServerRegistered::SIGNATURE_HASH {
            let decoded = RelayHub::RelayServerRegistered::decode_log(&log.inner).ok()?;
            Some(Self::Registered {
                manager: decoded.data.relayManager,
                url: decoded.data.relayUrl.clone(),
                block_number,
                transaction_index,
            })
        } else if *topic0 == RelayHub::StakeUnlocked::SIGNATURE_HASH {
            let decoded = RelayHub::StakeUnlocked::decode_log(&log.inner).ok()?;
            Some(Self::Unlocked {
                manager: decoded.data.relayManager,
                block_number,
                transaction_index,
            })
        } else if *topic0 == RelayHub::StakePenalized::SIGNATURE_HASH {
            let decoded = RelayHub::StakePenalized::decode_log(&log.inner).ok()?;
            Some(Self::Penalized {
                manager: decoded.data.relayManager,
                block_number,
                transaction_index,
            })
        } else {
            None
        }
    }

    /// The manager the event concerns.
    pub fn manager(&self) -> Address {
        match self {
            Self::Registered { manager, .. }
            | Self::Unlocked { manager, .. }
            | Self::Penalized { manager, .. } => *manager,
        }
    }

    /// Global ordering key.
    pub fn position(&self) -> (u64, u64) {
        match self {
            Self::Registered {
                block_number,
                transaction_index,
                ..
            }
            | Self::Unlocked {
                block_number,
                transaction_index,
                ..
            }
            | Self::Penalized {
                block_number,
                transaction_index,
                ..
            } => (*block_number, *transaction_index),
        }
    }
}

/// Normalizes events to global order, regardless of which sub-range query
/// returned them first.
pub fn sort_by_position(events: &mut [RegistrationEvent]) {
    events.sort_by_key(RegistrationEvent::position);
}

/// Replays the lifecycle events and returns the managers still active at the
/// end of the window.
pub fn replay_active_managers(mut events: Vec<RegistrationEvent>) -> HashSet<Address> {
    sort_by_position(&mut events);
    let mut active = HashSet::new();
    for event in events {
        match event {
            RegistrationEvent::Registered { manager, .. } => {
                active.insert(manager);
            }
            RegistrationEvent::Unlocked { manager, .. }
            | RegistrationEvent::Penalized { manager, .. } => {
                active.remove(&manager);
            }
        }
    }
    active
}

/// The latest advertised URL per manager, taken from registration events.
pub fn latest_registered_urls(mut events: Vec<RegistrationEvent>) -> HashMap<Address, String> {
    sort_by_position(&mut events);
    let mut urls = HashMap::new();
    for event in events {
        if let RegistrationEvent::Registered { manager, url, .. } = event {
            urls.insert(manager, url);
        }
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const M1: Address = address!("0x0000000000000000000000000000000000000a01");
    const M2: Address = address!("0x0000000000000000000000000000000000000a02");

    fn registered(manager: Address, url: &str, block: u64, tx: u64) -> RegistrationEvent {
        RegistrationEvent::Registered {
            manager,
            url: url.to_string(),
            block_number: block,
            transaction_index: tx,
        }
    }

    fn unlocked(manager: Address, block: u64, tx: u64) -> RegistrationEvent {
        RegistrationEvent::Unlocked {
            manager,
            block_number: block,
            transaction_index: tx,
        }
    }

    #[test]
    fn replay_is_insensitive_to_arrival_order() {
        // Events delivered out of order, as concurrent sub-range queries do.
        let shuffled = vec![
            unlocked(M1, 20, 0),
            registered(M2, "http://r2", 5, 3),
            registered(M1, "http://r1", 10, 1),
            registered(M1, "http://r1-bis", 25, 0),
            unlocked(M2, 25, 1),
        ];

        let active = replay_active_managers(shuffled);
        // M1 re-registered after its unlock; M2 was unlocked last.
        assert_eq!(active, HashSet::from([M1]));
    }

    #[test]
    fn same_block_events_order_by_transaction_index() {
        let events = vec![
            unlocked(M1, 10, 2),
            registered(M1, "http://r1", 10, 1),
        ];
        assert!(replay_active_managers(events).is_empty());

        let events = vec![
            registered(M1, "http://r1", 10, 2),
            unlocked(M1, 10, 1),
        ];
        assert_eq!(replay_active_managers(events), HashSet::from([M1]));
    }

    #[test]
    fn latest_registration_wins_for_urls() {
        let events = vec![
            registered(M1, "http://new", 30, 0),
            registered(M1, "http://old", 10, 0),
            registered(M2, "http://r2", 20, 0),
        ];
        let urls = latest_registered_urls(events);
        assert_eq!(urls[&M1], "http://new");
        assert_eq!(urls[&M2], "http://r2");
    }
}
