//! Relay selection: racing candidate relays for the fastest usable one.
//!
//! A selector is single-use: it is constructed over a snapshot of the
//! directory tiers for one send attempt, and its "already tried" state is
//! not meant to survive into the next attempt.

use crate::{
    config::EnvelopingConfig,
    directory::RelayDirectory,
    error::{EnvelopingError, PingError},
    transport::RelayTransport,
    types::{PingResponse, RelayEndpoint},
};
use alloy::primitives::Address;
use futures_util::{stream::FuturesUnordered, StreamExt};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, info};

/// Filter applied to a ping response before its relay can win a race.
/// The second argument is the gas price proposed for this attempt.
pub type PingFilter = Arc<dyn Fn(&PingResponse, u128) -> Result<(), String> + Send + Sync>;

/// A selected relay: its endpoint, now with a resolved manager, and the ping
/// it won the race with.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    /// The relay endpoint, manager included.
    pub endpoint: RelayEndpoint,
    /// The winning ping response.
    pub ping: PingResponse,
}

struct RaceOutcome {
    winner: Option<(RelayEndpoint, PingResponse)>,
    errors: HashMap<String, PingError>,
}

/// Races relays out of tier snapshots, never trying the same relay twice
/// within one attempt.
pub struct RelaySelector<'a, T: RelayTransport + ?Sized> {
    directory: &'a RelayDirectory,
    transport: &'a T,
    config: &'a EnvelopingConfig,
    ping_filter: PingFilter,
    verifier: Option<Address>,
    proposed_gas_price: u128,
    remaining: Vec<Vec<RelayEndpoint>>,
    errors: HashMap<String, PingError>,
}

impl<'a, T: RelayTransport + ?Sized> RelaySelector<'a, T> {
    /// Creates a selector over a tier snapshot for one send attempt.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: &'a RelayDirectory,
        transport: &'a T,
        config: &'a EnvelopingConfig,
        ping_filter: PingFilter,
        verifier: Option<Address>,
        proposed_gas_price: u128,
        tiers: Vec<Vec<RelayEndpoint>>,
    ) -> Self {
        Self {
            directory,
            transport,
            config,
            ping_filter,
            verifier,
            proposed_gas_price,
            remaining: tiers,
            errors: HashMap::new(),
        }
    }

    /// Relays left to try across all tiers.
    pub fn candidates_left(&self) -> usize {
        self.remaining.iter().map(Vec::len).sum()
    }

    /// Ping errors accumulated so far, keyed by relay URL.
    pub fn errors(&self) -> &HashMap<String, PingError> {
        &self.errors
    }

    /// Consumes the selector, yielding the accumulated ping errors.
    pub fn into_errors(self) -> HashMap<String, PingError> {
        self.errors
    }

    /// Finds the next usable relay, or `None` once every tier is exhausted.
    ///
    /// Draws a slice from the first non-empty tier, races it, and removes
    /// both the winner and every relay that errored from all remaining
    /// tiers, so no relay is raced twice within this attempt.
    pub async fn select_next_relay(&mut self) -> Result<Option<RelayInfo>, EnvelopingError> {
        loop {
            let slice = self.next_slice();
            if slice.is_empty() {
                debug!("all relay tiers exhausted");
                return Ok(None);
            }
            info!(relays = slice.len(), "racing relay slice");

            let outcome = self.race(slice).await;
            let winner_url = outcome.winner.as_ref().map(|(relay, _)| relay.url.clone());
            for tier in &mut self.remaining {
                tier.retain(|relay| {
                    Some(&relay.url) != winner_url.as_ref()
                        && !outcome.errors.contains_key(relay.url.as_str())
                });
            }
            self.errors.extend(outcome.errors);

            let Some((endpoint, ping)) = outcome.winner else {
                continue;
            };
            info!(url = %endpoint.url, worker = %ping.relay_worker_address, "relay won the ping race");

            if endpoint.manager.is_some() {
                return Ok(Some(RelayInfo { endpoint, ping }));
            }

            // A preferred relay is known by URL only; recover its on-chain
            // registration through the manager it reported in the ping. It
            // may have deregistered since it was configured.
            let manager = ping.relay_manager_address;
            let active = self
                .directory
                .get_active_relays(&HashSet::from([manager]))
                .await
                .map_err(EnvelopingError::DirectoryUnavailable)?;
            if active.is_empty() {
                return Err(EnvelopingError::UnknownPreferredRelay { manager });
            }
            return Ok(Some(RelayInfo {
                endpoint: RelayEndpoint {
                    url: endpoint.url,
                    manager: Some(manager),
                },
                ping,
            }));
        }
    }

    fn next_slice(&self) -> Vec<RelayEndpoint> {
        for tier in &self.remaining {
            if !tier.is_empty() {
                let size = self.config.slice_size.min(tier.len());
                return tier[..size].to_vec();
            }
        }
        Vec::new()
    }

    /// Pings the whole slice concurrently. The first response that is
    /// well-formed and passes the filter wins; every other ping is still
    /// drained, its error recorded or its late success discarded, before the
    /// next slice can be drawn.
    async fn race(&self, slice: Vec<RelayEndpoint>) -> RaceOutcome {
        let mut pings: FuturesUnordered<_> = slice
            .into_iter()
            .map(|relay| self.ping_endpoint(relay))
            .collect();

        let mut winner = None;
        let mut errors = HashMap::new();
        while let Some((relay, result)) = pings.next().await {
            match result {
                Ok(ping) if winner.is_none() => winner = Some((relay, ping)),
                Ok(_) => debug!(url = %relay.url, "discarding ping that lost the race"),
                Err(e) => {
                    debug!(url = %relay.url, error = %e, "ping failed");
                    errors.insert(relay.url.as_str().to_string(), e);
                }
            }
        }
        RaceOutcome { winner, errors }
    }

    async fn ping_endpoint(
        &self,
        relay: RelayEndpoint,
    ) -> (RelayEndpoint, Result<PingResponse, PingError>) {
        let result = self
            .transport
            .ping(&relay.url, self.verifier)
            .await
            .and_then(|ping| {
                if !ping.ready {
                    return Err(PingError::NotReady);
                }
                if let Some(chain_id) = ping.chain_id {
                    if chain_id != self.config.chain_id {
                        return Err(PingError::MismatchedChain {
                            expected: self.config.chain_id,
                            got: chain_id,
                        });
                    }
                }
                if ping.relay_hub_address != self.config.relay_hub_address {
                    return Err(PingError::MismatchedHub {
                        expected: self.config.relay_hub_address,
                        got: ping.relay_hub_address,
                    });
                }
                (self.ping_filter)(&ping, self.proposed_gas_price).map_err(PingError::Rejected)?;
                Ok(ping)
            });
        (relay, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::RelayingError,
        gateway::ChainGateway,
        types::{contracts::RelayHub, RelayTransactionRequest},
    };
    use alloy::{
        primitives::{address, Bytes, B256, U256},
        providers::{mock::Asserter, Provider, ProviderBuilder},
        sol_types::SolEvent,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::{sync::Mutex, time::Duration};
    use url::Url;

    const HUB: Address = address!("0x66Fa9FEAfB8Db66Fe2160ca7aEAc7FC24e254387");
    const M1: Address = address!("0x0000000000000000000000000000000000000a01");

    #[derive(Clone)]
    enum MockPing {
        Ok,
        SlowOk(Duration),
        NotReady,
        Timeout,
        Refused,
    }

    struct MockTransport {
        responses: HashMap<String, MockPing>,
        calls: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn new(responses: Vec<(&str, MockPing)>) -> Self {
            Self {
                responses: responses
                    .into_iter()
                    .map(|(url, ping)| (url.to_string(), ping))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn ping_response() -> PingResponse {
        PingResponse {
            relay_worker_address: address!("0x3C44CdDdB6a900fa2B585dd299E03D12FA4293bC"),
            relay_manager_address: M1,
            relay_hub_address: HUB,
            min_gas_price: U256::from(1u64),
            ready: true,
            version: "2.0.1".into(),
            chain_id: None,
        }
    }

    #[async_trait]
    impl RelayTransport for MockTransport {
        async fn ping(
            &self,
            url: &Url,
            _verifier: Option<Address>,
        ) -> Result<PingResponse, PingError> {
            self.calls.lock().unwrap().push(url.as_str().to_string());
            match self.responses.get(url.as_str()).cloned() {
                Some(MockPing::Ok) => Ok(ping_response()),
                Some(MockPing::SlowOk(delay)) => {
                    tokio::time::sleep(delay).await;
                    Ok(ping_response())
                }
                Some(MockPing::NotReady) => Ok(PingResponse {
                    ready: false,
                    ..ping_response()
                }),
                Some(MockPing::Timeout) => Err(PingError::Timeout),
                Some(MockPing::Refused) | None => {
                    Err(PingError::Transport("connection refused".into()))
                }
            }
        }

        async fn relay_transaction(
            &self,
            _url: &Url,
            _request: &RelayTransactionRequest,
        ) -> Result<Bytes, RelayingError> {
            Err(RelayingError::MissingSignedTx)
        }
    }

    fn test_config() -> EnvelopingConfig {
        EnvelopingConfig::default().with_relay_hub(HUB)
    }

    fn test_directory(asserter: &Asserter, config: &EnvelopingConfig) -> RelayDirectory {
        let provider = ProviderBuilder::new()
            .connect_mocked_client(asserter.clone())
            .erased();
        let config = Arc::new(config.clone());
        RelayDirectory::new(Arc::new(ChainGateway::new(provider, config.clone())), config)
    }

    fn endpoint(url: &str, manager: Option<Address>) -> RelayEndpoint {
        RelayEndpoint {
            url: Url::parse(url).unwrap(),
            manager,
        }
    }

    fn accept_all() -> PingFilter {
        Arc::new(|_, _| Ok(()))
    }

    #[tokio::test]
    async fn single_responder_wins_and_errors_are_recorded() {
        let config = test_config();
        let asserter = Asserter::new();
        let directory = test_directory(&asserter, &config);
        let transport = MockTransport::new(vec![
            ("http://r1.example/", MockPing::Refused),
            ("http://r2.example/", MockPing::Ok),
            ("http://r3.example/", MockPing::Timeout),
        ]);

        let tiers = vec![vec![
            endpoint("http://r1.example/", Some(M1)),
            endpoint("http://r2.example/", Some(M1)),
            endpoint("http://r3.example/", Some(M1)),
        ]];
        let mut selector = RelaySelector::new(
            &directory,
            &transport,
            &config,
            accept_all(),
            None,
            1_000_000_000,
            tiers,
        );

        let winner = selector.select_next_relay().await.unwrap().unwrap();
        assert_eq!(winner.endpoint.url.as_str(), "http://r2.example/");

        // Exactly the two losers are in the error map, the timeout
        // distinguishable from the refusal.
        assert_eq!(selector.errors().len(), 2);
        assert!(matches!(
            selector.errors()["http://r3.example/"],
            PingError::Timeout
        ));
        assert!(matches!(
            selector.errors()["http://r1.example/"],
            PingError::Transport(_)
        ));
    }

    #[tokio::test]
    async fn all_error_slice_advances_to_the_next_tier() {
        let config = test_config();
        let asserter = Asserter::new();
        let directory = test_directory(&asserter, &config);
        let transport = MockTransport::new(vec![
            ("http://p1.example/", MockPing::Refused),
            ("http://p2.example/", MockPing::NotReady),
            ("http://d1.example/", MockPing::Ok),
        ]);

        let tiers = vec![
            vec![
                endpoint("http://p1.example/", Some(M1)),
                endpoint("http://p2.example/", Some(M1)),
            ],
            vec![endpoint("http://d1.example/", Some(M1))],
        ];
        let mut selector = RelaySelector::new(
            &directory,
            &transport,
            &config,
            accept_all(),
            None,
            1_000_000_000,
            tiers,
        );

        let winner = selector.select_next_relay().await.unwrap().unwrap();
        assert_eq!(winner.endpoint.url.as_str(), "http://d1.example/");
        assert!(matches!(
            selector.errors()["http://p2.example/"],
            PingError::NotReady
        ));
    }

    #[tokio::test]
    async fn no_relay_is_raced_twice_within_an_attempt() {
        let mut config = test_config();
        config.slice_size = 2;
        let asserter = Asserter::new();
        let directory = test_directory(&asserter, &config);
        let transport = MockTransport::new(vec![
            ("http://r1.example/", MockPing::Ok),
            ("http://r2.example/", MockPing::Refused),
            ("http://r3.example/", MockPing::Ok),
        ]);

        let tiers = vec![vec![
            endpoint("http://r1.example/", Some(M1)),
            endpoint("http://r2.example/", Some(M1)),
            endpoint("http://r3.example/", Some(M1)),
        ]];
        let mut selector = RelaySelector::new(
            &directory,
            &transport,
            &config,
            accept_all(),
            None,
            1_000_000_000,
            tiers,
        );

        let first = selector.select_next_relay().await.unwrap().unwrap();
        assert_eq!(first.endpoint.url.as_str(), "http://r1.example/");
        let second = selector.select_next_relay().await.unwrap().unwrap();
        assert_eq!(second.endpoint.url.as_str(), "http://r3.example/");
        assert!(selector.select_next_relay().await.unwrap().is_none());

        let mut calls = transport.calls();
        calls.sort();
        calls.dedup();
        assert_eq!(transport.calls().len(), calls.len(), "a relay was pinged twice");
    }

    #[tokio::test]
    async fn late_success_is_discarded_not_recorded() {
        let config = test_config();
        let asserter = Asserter::new();
        let directory = test_directory(&asserter, &config);
        let transport = MockTransport::new(vec![
            ("http://slow.example/", MockPing::SlowOk(Duration::from_millis(50))),
            ("http://fast.example/", MockPing::Ok),
        ]);

        let tiers = vec![vec![
            endpoint("http://slow.example/", Some(M1)),
            endpoint("http://fast.example/", Some(M1)),
        ]];
        let mut selector = RelaySelector::new(
            &directory,
            &transport,
            &config,
            accept_all(),
            None,
            1_000_000_000,
            tiers,
        );

        let winner = selector.select_next_relay().await.unwrap().unwrap();
        assert_eq!(winner.endpoint.url.as_str(), "http://fast.example/");
        // The slow relay neither won nor errored; it was drained silently
        // and stays available for the next slice.
        assert!(selector.errors().is_empty());
        assert_eq!(selector.candidates_left(), 1);
    }

    #[tokio::test]
    async fn filter_rejection_behaves_like_a_failure() {
        let config = test_config();
        let asserter = Asserter::new();
        let directory = test_directory(&asserter, &config);
        let transport = MockTransport::new(vec![("http://r1.example/", MockPing::Ok)]);

        let filter: PingFilter = Arc::new(|_, _| Err("gas price too low".into()));
        let tiers = vec![vec![endpoint("http://r1.example/", Some(M1))]];
        let mut selector = RelaySelector::new(
            &directory,
            &transport,
            &config,
            filter,
            None,
            1_000_000_000,
            tiers,
        );

        assert!(selector.select_next_relay().await.unwrap().is_none());
        assert!(matches!(
            selector.errors()["http://r1.example/"],
            PingError::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn preferred_winner_is_completed_from_chain_state() {
        let config = test_config();
        let asserter = Asserter::new();
        let directory = test_directory(&asserter, &config);
        let transport = MockTransport::new(vec![("http://pref.example/", MockPing::Ok)]);

        // Registration lookup by the ping-reported manager.
        let event = RelayHub::RelayServerRegistered {
            relayManager: M1,
            relayUrl: "http://pref.example/".into(),
        };
        let data = event.encode_log_data();
        asserter.push_success(&"0x100");
        asserter.push_success(&json!([{
            "address": HUB,
            "topics": data.topics(),
            "data": data.data,
            "blockNumber": "0xa",
            "transactionIndex": "0x0",
            "transactionHash": B256::ZERO,
            "blockHash": B256::ZERO,
            "logIndex": "0x0",
            "removed": false,
        }]));

        let tiers = vec![vec![endpoint("http://pref.example/", None)]];
        let mut selector = RelaySelector::new(
            &directory,
            &transport,
            &config,
            accept_all(),
            None,
            1_000_000_000,
            tiers,
        );

        let winner = selector.select_next_relay().await.unwrap().unwrap();
        assert_eq!(winner.endpoint.manager, Some(M1));
        assert_eq!(winner.endpoint.url.as_str(), "http://pref.example/");
    }

    #[tokio::test]
    async fn deregistered_preferred_winner_fails_selection() {
        let config = test_config();
        let asserter = Asserter::new();
        let directory = test_directory(&asserter, &config);
        let transport = MockTransport::new(vec![("http://pref.example/", MockPing::Ok)]);

        asserter.push_success(&"0x100");
        asserter.push_success(&json!([]));

        let tiers = vec![vec![endpoint("http://pref.example/", None)]];
        let mut selector = RelaySelector::new(
            &directory,
            &transport,
            &config,
            accept_all(),
            None,
            1_000_000_000,
            tiers,
        );

        let err = selector.select_next_relay().await.unwrap_err();
        assert!(matches!(
            err,
            EnvelopingError::UnknownPreferredRelay { manager } if manager == M1
        ));
    }
}
