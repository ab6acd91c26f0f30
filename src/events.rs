//! Lifecycle progress events.
//!
//! External observers can follow a relay attempt through an ordered sequence
//! of events. Emission is fire-and-forget: a full or absent subscriber never
//! blocks or fails the pipeline.

use tokio::sync::broadcast;
use url::Url;

/// Progress events emitted during one `relay()` call, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Client initialization. Not counted towards the step total.
    Init,
    /// On-chain relay discovery started.
    RefreshRelays,
    /// Discovery finished with this many candidates across all tiers.
    DoneRefreshRelays {
        /// Candidates left to try.
        relays_count: usize,
    },
    /// A relay won its ping race and will be attempted next.
    NextRelay {
        /// URL of the chosen relay.
        url: Url,
    },
    /// The typed request is about to be signed.
    SignRequest,
    /// The signed request is being dry-run before any gas is risked.
    ValidateRequest,
    /// The signed request is being POSTed to the relay.
    SendToRelayer {
        /// URL of the relay being contacted.
        url: Url,
    },
    /// The relay answered; `success` reflects response validation.
    RelayerResponse {
        /// Whether the returned transaction passed validation.
        success: bool,
    },
}

impl RelayEvent {
    /// Number of counted steps in a full attempt.
    pub const TOTAL_STEPS: u8 = 7;

    /// Position of this event in the sequence. `Init` is step 0.
    pub fn step(&self) -> u8 {
        match self {
            Self::Init => 0,
            Self::RefreshRelays => 1,
            Self::DoneRefreshRelays { .. } => 2,
            Self::NextRelay { .. } => 3,
            Self::SignRequest => 4,
            Self::ValidateRequest => 5,
            Self::SendToRelayer { .. } => 6,
            Self::RelayerResponse { .. } => 7,
        }
    }
}

/// Broadcast channel the client emits lifecycle events on.
#[derive(Debug)]
pub struct RelayEvents {
    sender: broadcast::Sender<RelayEvent>,
}

impl Default for RelayEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayEvents {
    /// Creates the channel. Slow subscribers lag rather than apply
    /// backpressure.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(32);
        Self { sender }
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }

    /// Emits an event. Errors (no subscribers) are deliberately ignored.
    pub fn emit(&self, event: RelayEvent) {
        let _ = self.sender.send(event);
    }
}
