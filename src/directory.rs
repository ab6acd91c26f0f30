//! Known-relay directory.
//!
//! Answers "which relay managers are currently active, and in what order
//! should we try them" from chain state plus local failure memory. The
//! directory owns the failure history and the last computed tiers; callers
//! only ever see snapshots.

use crate::{
    config::EnvelopingConfig,
    constants::{LOOKUP_WINDOW_PARTS_GROWTH, MAX_LOOKUP_WINDOW_PARTS},
    error::DirectoryError,
    gateway::ChainGateway,
    types::{
        contracts::RelayHub,
        registration::{
            latest_registered_urls, replay_active_managers, sort_by_position, RegistrationEvent,
        },
        RelayEndpoint, RelayFailureInfo,
    },
};
use alloy::{
    primitives::{Address, B256},
    providers::Provider,
    sol_types::SolEvent,
    transports::{RpcError, TransportErrorKind},
};
use futures_util::future::try_join_all;
use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

/// Predicate applied to discovered relays before they enter the tiers.
pub type RelayFilter = Arc<dyn Fn(&RelayEndpoint) -> bool + Send + Sync>;

/// Score function used to order discovered relays, higher first.
pub type RelayScore = Arc<dyn Fn(&RelayEndpoint, &[RelayFailureInfo]) -> f64 + Send + Sync>;

/// Default score: geometric decay in the number of recent failures. Relays
/// that just failed sink in the ordering without being excluded outright.
pub fn default_relay_score(_relay: &RelayEndpoint, failures: &[RelayFailureInfo]) -> f64 {
    0.9f64.powi(failures.len() as i32)
}

/// Splits `[from_block, to_block]` into `splits` consecutive sub-ranges that
/// cover it exactly.
pub fn split_range(from_block: u64, to_block: u64, splits: u64) -> Vec<(u64, u64)> {
    let total = to_block.saturating_sub(from_block) + 1;
    let size = total.div_ceil(splits.max(1));
    let mut ranges = Vec::new();
    let mut start = from_block;
    while start <= to_block {
        let end = to_block.min(start.saturating_add(size - 1));
        ranges.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    ranges
}

fn is_query_overflow(error: &RpcError<TransportErrorKind>) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("query returned more than") || message.contains("response size exceeded")
}

fn prune_failures(failures: &mut HashMap<String, Vec<RelayFailureInfo>>, grace: Duration) {
    for entries in failures.values_mut() {
        entries.retain(|failure| {
            failure
                .last_error_time
                .elapsed()
                .map(|elapsed| elapsed < grace)
                .unwrap_or(true)
        });
    }
    failures.retain(|_, entries| !entries.is_empty());
}

#[derive(Debug, Default)]
struct DirectoryState {
    failures: HashMap<String, Vec<RelayFailureInfo>>,
    preferred: Vec<RelayEndpoint>,
    discovered: Vec<RelayEndpoint>,
    lookup_window_parts: u32,
}

/// Directory of currently-known relays, refreshed from hub events.
pub struct RelayDirectory {
    gateway: Arc<ChainGateway>,
    config: Arc<EnvelopingConfig>,
    filter: RelayFilter,
    score: RelayScore,
    state: Mutex<DirectoryState>,
}

impl RelayDirectory {
    /// Creates a directory with the default filter and score.
    pub fn new(gateway: Arc<ChainGateway>, config: Arc<EnvelopingConfig>) -> Self {
        let lookup_window_parts = config.relay_lookup_window_parts;
        Self {
            gateway,
            config,
            filter: Arc::new(|_| true),
            score: Arc::new(default_relay_score),
            state: Mutex::new(DirectoryState {
                lookup_window_parts,
                ..Default::default()
            }),
        }
    }

    /// Replaces the relay filter.
    pub fn with_relay_filter(mut self, filter: RelayFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Replaces the score function.
    pub fn with_score_calculator(mut self, score: RelayScore) -> Self {
        self.score = score;
        self
    }

    /// Current split factor of the event scan, as widened by past refreshes.
    pub async fn lookup_window_parts(&self) -> u32 {
        self.state.lock().await.lookup_window_parts
    }

    /// Number of failures currently remembered against a relay URL.
    pub async fn failure_count(&self, url: &Url) -> usize {
        self.state
            .lock()
            .await
            .failures
            .get(url.as_str())
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Records a failure against a relay. Forgotten once
    /// `relay_timeout_grace` has elapsed.
    pub async fn record_failure(&self, manager: Option<Address>, url: &Url) {
        let mut state = self.state.lock().await;
        state
            .failures
            .entry(url.as_str().to_string())
            .or_default()
            .push(RelayFailureInfo {
                last_error_time: SystemTime::now(),
                relay_manager: manager,
                relay_url: url.clone(),
            });
    }

    /// Rebuilds the candidate tiers from chain state.
    ///
    /// Holding the state lock across the scan serializes concurrent
    /// refreshes: a second caller waits instead of replaying the same events.
    /// Zero discovered relays is a valid outcome, not an error.
    pub async fn refresh(&self) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        prune_failures(
            &mut state.failures,
            Duration::from_secs(self.config.relay_timeout_grace),
        );

        let to_block = self.gateway.provider().get_block_number().await?;
        let from_block = to_block.saturating_sub(self.config.relay_lookup_window_blocks);

        let lifecycle = vec![
            RelayHub::RelayServerRegistered::SIGNATURE_HASH,
            RelayHub::StakeUnlocked::SIGNATURE_HASH,
            RelayHub::StakePenalized::SIGNATURE_HASH,
        ];
        let mut parts = state.lookup_window_parts;
        let events = self
            .scan_registration_events(&mut parts, lifecycle, Vec::new(), from_block, to_block)
            .await?;
        state.lookup_window_parts = parts;
        info!(events = events.len(), from_block, to_block, "scanned relay lifecycle events");

        let active = replay_active_managers(events);
        let discovered = self.get_active_relays(&active).await?;

        state.preferred = self
            .config
            .preferred_relays
            .iter()
            .cloned()
            .map(RelayEndpoint::preferred)
            .collect();
        state.discovered = discovered;
        debug!(
            preferred = state.preferred.len(),
            discovered = state.discovered.len(),
            "relay directory refreshed"
        );
        Ok(())
    }

    /// Resolves the advertised URL of every given active manager from its
    /// latest registration event, applying the relay filter.
    pub async fn get_active_relays(
        &self,
        managers: &HashSet<Address>,
    ) -> Result<Vec<RelayEndpoint>, DirectoryError> {
        // An empty topic set would match every registration event.
        if managers.is_empty() {
            return Ok(Vec::new());
        }

        let to_block = self.gateway.provider().get_block_number().await?;
        let from_block = to_block.saturating_sub(self.config.relay_lookup_window_blocks);
        let mut parts = self.config.relay_lookup_window_parts;
        let topics = managers.iter().map(|m| m.into_word()).collect();
        let events = self
            .scan_registration_events(
                &mut parts,
                vec![RelayHub::RelayServerRegistered::SIGNATURE_HASH],
                topics,
                from_block,
                to_block,
            )
            .await?;

        let mut relays = Vec::new();
        for (manager, raw_url) in latest_registered_urls(events) {
            let url = match Url::parse(&raw_url) {
                Ok(url) => url,
                Err(e) => {
                    warn!(%manager, raw_url, %e, "skipping relay with unparsable registered url");
                    continue;
                }
            };
            let endpoint = RelayEndpoint {
                url,
                manager: Some(manager),
            };
            if (self.filter)(&endpoint) {
                relays.push(endpoint);
            }
        }
        Ok(relays)
    }

    /// Snapshot of the candidate tiers: the configured preferred relays
    /// verbatim, then the discovered set ordered by descending score.
    pub async fn tiers(&self) -> Vec<Vec<RelayEndpoint>> {
        let state = self.state.lock().await;
        let mut discovered: Vec<(f64, RelayEndpoint)> = state
            .discovered
            .iter()
            .map(|relay| {
                let failures = state
                    .failures
                    .get(relay.url.as_str())
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                ((self.score)(relay, failures), relay.clone())
            })
            .collect();
        discovered
            .sort_by(|(a, _), (b, _)| b.partial_cmp(a).unwrap_or(Ordering::Equal));

        vec![
            state.preferred.clone(),
            discovered.into_iter().map(|(_, relay)| relay).collect(),
        ]
    }

    /// Runs the event scan, splitting the window into concurrent sub-ranges
    /// and widening the split factor on node-side overflow rejects.
    ///
    /// Any sub-range overflow restarts the whole scan at the widened factor,
    /// re-issuing sub-queries that had already succeeded; factors above
    /// [`MAX_LOOKUP_WINDOW_PARTS`] fail instead of widening further.
    async fn scan_registration_events(
        &self,
        parts: &mut u32,
        signatures: Vec<B256>,
        extra_topics: Vec<B256>,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RegistrationEvent>, DirectoryError> {
        loop {
            let ranges = split_range(from_block, to_block, u64::from(*parts));
            let scans = ranges.iter().map(|&(from, to)| {
                self.gateway
                    .scan_hub_events(signatures.clone(), extra_topics.clone(), from, to)
            });
            match try_join_all(scans).await {
                Ok(chunks) => {
                    let mut events: Vec<RegistrationEvent> = chunks
                        .iter()
                        .flatten()
                        .filter_map(RegistrationEvent::try_from_log)
                        .collect();
                    sort_by_position(&mut events);
                    return Ok(events);
                }
                Err(e)
                    if is_query_overflow(&e)
                        && self.config.relay_lookup_window_blocks > u64::from(*parts) =>
                {
                    if *parts >= MAX_LOOKUP_WINDOW_PARTS {
                        return Err(DirectoryError::TooManyEvents { parts: *parts });
                    }
                    *parts *= LOOKUP_WINDOW_PARTS_GROWTH;
                    debug!(parts = *parts, "log query overflowed, widening the split factor");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl std::fmt::Debug for RelayDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayDirectory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::{
        primitives::{address, U256},
        providers::{mock::Asserter, ProviderBuilder},
    };
    use serde_json::json;

    const HUB: Address = address!("0x66Fa9FEAfB8Db66Fe2160ca7aEAc7FC24e254387");
    const M1: Address = address!("0x0000000000000000000000000000000000000a01");
    const M2: Address = address!("0x0000000000000000000000000000000000000a02");

    fn directory(asserter: &Asserter, parts: u32) -> RelayDirectory {
        let provider = ProviderBuilder::new()
            .connect_mocked_client(asserter.clone())
            .erased();
        let mut config = EnvelopingConfig::default().with_relay_hub(HUB);
        config.relay_lookup_window_parts = parts;
        let config = Arc::new(config);
        let gateway = Arc::new(ChainGateway::new(provider, config.clone()));
        RelayDirectory::new(gateway, config)
    }

    fn registered_log(manager: Address, url: &str, block: u64, tx_index: u64) -> serde_json::Value {
        let event = RelayHub::RelayServerRegistered {
            relayManager: manager,
            relayUrl: url.to_string(),
        };
        log_json(event.encode_log_data(), block, tx_index)
    }

    fn unlocked_log(manager: Address, block: u64, tx_index: u64) -> serde_json::Value {
        let event = RelayHub::StakeUnlocked {
            relayManager: manager,
            owner: Address::ZERO,
            withdrawBlock: U256::ZERO,
        };
        log_json(event.encode_log_data(), block, tx_index)
    }

    fn log_json(data: alloy::primitives::LogData, block: u64, tx_index: u64) -> serde_json::Value {
        json!({
            "address": HUB,
            "topics": data.topics(),
            "data": data.data,
            "blockNumber": format!("0x{block:x}"),
            "transactionIndex": format!("0x{tx_index:x}"),
            "transactionHash": B256::ZERO,
            "blockHash": B256::ZERO,
            "logIndex": "0x0",
            "removed": false,
        })
    }

    #[test]
    fn split_range_partitions_the_window() {
        assert_eq!(split_range(0, 9, 1), vec![(0, 9)]);
        assert_eq!(split_range(0, 9, 2), vec![(0, 4), (5, 9)]);
        // Uneven split: last range is shorter.
        assert_eq!(split_range(0, 10, 4), vec![(0, 2), (3, 5), (6, 8), (9, 10)]);
        // A single-block window is still covered.
        assert_eq!(split_range(7, 7, 4), vec![(7, 7)]);
    }

    #[test]
    fn stale_failures_are_pruned() {
        let url = Url::parse("http://r1.example").unwrap();
        let stale = RelayFailureInfo {
            last_error_time: SystemTime::now() - Duration::from_secs(3600),
            relay_manager: None,
            relay_url: url.clone(),
        };
        let fresh = RelayFailureInfo {
            last_error_time: SystemTime::now(),
            ..stale.clone()
        };
        let mut failures = HashMap::from([(url.as_str().to_string(), vec![stale, fresh])]);

        prune_failures(&mut failures, Duration::from_secs(1800));
        assert_eq!(failures[url.as_str()].len(), 1);

        prune_failures(&mut failures, Duration::from_secs(0));
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn refresh_replays_lifecycle_events_into_tiers() {
        let asserter = Asserter::new();
        let directory = directory(&asserter, 1);

        // Lifecycle scan: M1 registered then unlocked, M2 stays registered.
        asserter.push_success(&"0x100");
        asserter.push_success(&json!([
            registered_log(M1, "http://r1.example", 10, 0),
            registered_log(M2, "http://r2.example", 11, 0),
            unlocked_log(M1, 12, 0),
        ]));
        // URL lookup for the single active manager.
        asserter.push_success(&"0x100");
        asserter.push_success(&json!([registered_log(M2, "http://r2.example", 11, 0)]));

        directory.refresh().await.unwrap();

        let tiers = directory.tiers().await;
        assert!(tiers[0].is_empty());
        assert_eq!(tiers[1].len(), 1);
        assert_eq!(tiers[1][0].manager, Some(M2));
        assert_eq!(tiers[1][0].url.as_str(), "http://r2.example/");
    }

    #[tokio::test]
    async fn zero_relays_is_not_an_error() {
        let asserter = Asserter::new();
        let directory = directory(&asserter, 1);

        asserter.push_success(&"0x100");
        asserter.push_success(&json!([]));
        directory.refresh().await.unwrap();

        let tiers = directory.tiers().await;
        assert!(tiers.iter().all(Vec::is_empty));
    }

    #[tokio::test]
    async fn overflow_widens_the_split_factor_by_four() {
        let asserter = Asserter::new();
        let directory = directory(&asserter, 1);

        asserter.push_success(&"0x100");
        asserter.push_failure_msg("query returned more than 10000 results");
        // Retried from scratch at 4 parts.
        for _ in 0..4 {
            asserter.push_success(&json!([]));
        }
        directory.refresh().await.unwrap();
        assert_eq!(directory.lookup_window_parts().await, 4);
    }

    #[tokio::test]
    async fn overflow_at_the_ceiling_is_a_hard_failure() {
        let asserter = Asserter::new();
        let directory = directory(&asserter, 16);

        asserter.push_success(&"0x100");
        for _ in 0..16 {
            asserter.push_failure_msg("query returned more than 10000 results");
        }
        let err = directory.refresh().await.unwrap_err();
        assert!(matches!(err, DirectoryError::TooManyEvents { parts: 16 }));
    }

    #[tokio::test]
    async fn non_overflow_rpc_errors_propagate_unchanged() {
        let asserter = Asserter::new();
        let directory = directory(&asserter, 1);

        asserter.push_success(&"0x100");
        asserter.push_failure_msg("connection refused");
        assert!(matches!(
            directory.refresh().await.unwrap_err(),
            DirectoryError::Rpc(_)
        ));
    }

    #[tokio::test]
    async fn failures_sink_a_relay_in_the_scored_tier() {
        let asserter = Asserter::new();
        let directory = directory(&asserter, 1);

        asserter.push_success(&"0x100");
        asserter.push_success(&json!([
            registered_log(M1, "http://r1.example", 10, 0),
            registered_log(M2, "http://r2.example", 11, 0),
        ]));
        asserter.push_success(&"0x100");
        asserter.push_success(&json!([
            registered_log(M1, "http://r1.example", 10, 0),
            registered_log(M2, "http://r2.example", 11, 0),
        ]));
        directory.refresh().await.unwrap();

        let r1 = Url::parse("http://r1.example").unwrap();
        directory.record_failure(Some(M1), &r1).await;
        directory.record_failure(Some(M1), &r1).await;

        let tiers = directory.tiers().await;
        assert_eq!(tiers[1][0].manager, Some(M2));
        assert_eq!(tiers[1][1].manager, Some(M1));
        assert_eq!(directory.failure_count(&r1).await, 2);
    }
}
