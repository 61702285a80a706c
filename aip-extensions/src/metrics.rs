use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use aip_primitives::{CorrelationId, Envelope};

use crate::AipExtension;

const DEFAULT_MAX_IN_FLIGHT: usize = 4096;

/// Point-in-time copy of the collected counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Messages sent, keyed by wire type name.
    pub sent: HashMap<&'static str, u64>,
    /// Messages received, keyed by wire type name.
    pub received: HashMap<&'static str, u64>,
    /// Connections established.
    pub connections_established: u64,
    /// Connections closed.
    pub connections_closed: u64,
    /// Errors reported.
    pub errors: u64,
    /// Requests still awaiting a reply.
    pub in_flight: usize,
    /// Number of recorded round trips.
    pub latency_samples: u64,
    /// Mean round-trip latency.
    pub average_latency: Option<Duration>,
    /// Largest round-trip latency.
    pub max_latency: Option<Duration>,
}

#[derive(Debug, Default)]
struct Counters {
    sent: HashMap<&'static str, u64>,
    received: HashMap<&'static str, u64>,
    connections_established: u64,
    connections_closed: u64,
    errors: u64,
    in_flight: HashMap<CorrelationId, Instant>,
    latency_total: Duration,
    latency_samples: u64,
    max_latency: Option<Duration>,
}

/// Counts traffic and measures request/reply latency.
///
/// Latency is the time between sending a message that carries a request key
/// and receiving a message whose reply key matches it.
#[derive(Debug)]
pub struct MetricsExtension {
    counters: Mutex<Counters>,
    max_in_flight: usize,
}

impl MetricsExtension {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_in_flight(DEFAULT_MAX_IN_FLIGHT)
    }

    /// Creates a collector that tracks at most `max_in_flight` unanswered
    /// requests; further requests are counted but not timed.
    #[must_use]
    pub fn with_max_in_flight(max_in_flight: usize) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            max_in_flight,
        }
    }

    /// Returns a copy of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let average_latency = (counters.latency_samples > 0).then(|| {
            let samples = u32::try_from(counters.latency_samples).unwrap_or(u32::MAX);
            counters.latency_total / samples
        });
        MetricsSnapshot {
            sent: counters.sent.clone(),
            received: counters.received.clone(),
            connections_established: counters.connections_established,
            connections_closed: counters.connections_closed,
            errors: counters.errors,
            in_flight: counters.in_flight.len(),
            latency_samples: counters.latency_samples,
            average_latency,
            max_latency: counters.max_latency,
        }
    }

    /// Clears every counter.
    pub fn reset(&self) {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner) = Counters::default();
    }

    fn with_counters(&self, update: impl FnOnce(&mut Counters)) {
        update(&mut self.counters.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl Default for MetricsExtension {
    fn default() -> Self {
        Self::new()
    }
}

impl AipExtension for MetricsExtension {
    fn name(&self) -> &str {
        "metrics"
    }

    fn on_message_sent(&self, _peer: &str, message: Envelope<'_>) -> anyhow::Result<()> {
        let max_in_flight = self.max_in_flight;
        self.with_counters(|counters| {
            *counters.sent.entry(message.type_name()).or_default() += 1;
            if let Some(key) = message.request_key() {
                if counters.in_flight.len() < max_in_flight {
                    counters.in_flight.insert(key.clone(), Instant::now());
                }
            }
        });
        Ok(())
    }

    fn on_message_received(&self, _peer: &str, message: Envelope<'_>) -> anyhow::Result<()> {
        self.with_counters(|counters| {
            *counters.received.entry(message.type_name()).or_default() += 1;
            let Some(sent_at) = message.reply_key().and_then(|key| counters.in_flight.remove(key))
            else {
                return;
            };
            let latency = sent_at.elapsed();
            counters.latency_total += latency;
            counters.latency_samples += 1;
            counters.max_latency = Some(counters.max_latency.map_or(latency, |max| max.max(latency)));
        });
        Ok(())
    }

    fn on_connection_established(&self, _peer: &str) -> anyhow::Result<()> {
        self.with_counters(|counters| counters.connections_established += 1);
        Ok(())
    }

    fn on_connection_closed(&self, _peer: &str) -> anyhow::Result<()> {
        self.with_counters(|counters| counters.connections_closed += 1);
        Ok(())
    }

    fn on_error(&self, _peer: &str, _error: &(dyn StdError + 'static)) -> anyhow::Result<()> {
        self.with_counters(|counters| counters.errors += 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use aip_primitives::{
        ClientMessage, ClientMessageType, ClientType, ServerMessage, ServerMessageType, WireMessage,
    };

    #[test]
    fn counts_by_type_and_matches_replies() {
        let metrics = MetricsExtension::new();
        let id = CorrelationId::random();

        let request = ClientMessage::new(ClientMessageType::Task, "const", ClientType::Constellation)
            .with_request_id(id.clone());
        metrics.on_message_sent("server", request.envelope()).unwrap();
        assert_eq!(metrics.snapshot().in_flight, 1);

        std::thread::sleep(Duration::from_millis(5));
        let unrelated = ServerMessage::new(ServerMessageType::TaskEnd).with_response_id(CorrelationId::random());
        metrics.on_message_received("server", unrelated.envelope()).unwrap();
        let reply = ServerMessage::new(ServerMessageType::TaskEnd).with_response_id(id);
        metrics.on_message_received("server", reply.envelope()).unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sent.get("task"), Some(&1));
        assert_eq!(snapshot.received.get("task_end"), Some(&2));
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.latency_samples, 1);
        assert!(snapshot.max_latency.unwrap() >= Duration::from_millis(5));
    }

    #[test]
    fn tracks_connections_and_errors() {
        let metrics = MetricsExtension::default();
        metrics.on_connection_established("a").unwrap();
        metrics.on_connection_established("b").unwrap();
        metrics.on_connection_closed("a").unwrap();
        let err = std::io::Error::other("boom");
        metrics.on_error("b", &err).unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_established, 2);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(snapshot.errors, 1);

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
