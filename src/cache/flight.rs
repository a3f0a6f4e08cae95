//! Single Flight
//!
//! At most one computation per key runs at a time. The first caller leads;
//! later callers follow a `watch` channel and receive the leader's serialized
//! result. When the leader fails or is dropped, followers are told to retry
//! and one of them leads the next attempt.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

/// State broadcast to followers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlightState {
    Pending,
    /// Serialized (uncompressed) value
    Done(Bytes),
    /// Leader gave up; followers retry
    Abandoned,
}

/// In-flight computations keyed by cache key
#[derive(Debug, Default)]
pub struct Flights {
    inflight: DashMap<String, watch::Receiver<FlightState>>,
}

/// Role of a caller joining a flight
pub enum Role<'a> {
    Leader(FlightLeader<'a>),
    Follower(FlightFollower),
}

impl Flights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lead a new flight for `key`, or follow the one already running
    pub fn join(&self, key: &str) -> Role<'_> {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(existing) => Role::Follower(FlightFollower {
                rx: existing.get().clone(),
            }),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(FlightState::Pending);
                slot.insert(rx);
                Role::Leader(FlightLeader {
                    flights: self,
                    key: key.to_string(),
                    tx: Some(tx),
                })
            }
        }
    }

    /// Number of running flights
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

/// Leader side of a flight. Dropping it without [`complete`] abandons the
/// flight.
///
/// [`complete`]: FlightLeader::complete
pub struct FlightLeader<'a> {
    flights: &'a Flights,
    key: String,
    tx: Option<watch::Sender<FlightState>>,
}

impl FlightLeader<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Hand the serialized result to every follower
    pub fn complete(mut self, serialized: Bytes) {
        self.finish(FlightState::Done(serialized));
    }

    /// Tell followers to retry
    pub fn abandon(mut self) {
        self.finish(FlightState::Abandoned);
    }

    fn finish(&mut self, state: FlightState) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        // Unlist first so retrying followers start a fresh flight
        self.flights.inflight.remove(&self.key);
        // No followers is fine
        let _ = tx.send(state);
    }
}

impl Drop for FlightLeader<'_> {
    fn drop(&mut self) {
        self.finish(FlightState::Abandoned);
    }
}

/// Follower side of a flight
pub struct FlightFollower {
    rx: watch::Receiver<FlightState>,
}

impl FlightFollower {
    /// Wait for the leader. `None` means the flight was abandoned.
    pub async fn wait(mut self) -> Option<Bytes> {
        let state = match self
            .rx
            .wait_for(|state| !matches!(state, FlightState::Pending))
            .await
        {
            Ok(state) => state.clone(),
            // Sender gone without a verdict
            Err(_) => return None,
        };
        match state {
            FlightState::Done(bytes) => Some(bytes),
            FlightState::Pending | FlightState::Abandoned => None,
        }
    }
}
