use super::destinations::{Destination, DestinationBook};
use crate::core::{Result, SignalError};
use chrono::{DateTime, NaiveDateTime, TimeDelta};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{Level, event};

const UNSET: i64 = i64::MIN;

fn to_millis(time: &NaiveDateTime) -> i64 {
    time.and_utc().timestamp_millis()
}

fn from_millis(millis: i64) -> Option<NaiveDateTime> {
    if millis == UNSET {
        return None;
    }
    DateTime::from_timestamp_millis(millis).map(|time| time.naive_utc())
}

/// Runtime timestamps of one client. Written only through [`LivenessWriter`].
#[derive(Debug)]
struct LivenessCell {
    last_access_ms: AtomicI64,
    last_timeout_detected_ms: AtomicI64,
}

/// Read-only view of a client's liveness timestamps.
#[derive(Debug, Clone)]
pub struct LivenessView {
    cell: Arc<LivenessCell>,
}

impl LivenessView {
    pub fn last_access(&self) -> Option<NaiveDateTime> {
        from_millis(self.cell.last_access_ms.load(Ordering::Acquire))
    }

    pub fn last_timeout_detected(&self) -> Option<NaiveDateTime> {
        from_millis(self.cell.last_timeout_detected_ms.load(Ordering::Acquire))
    }
}

/// The single owner allowed to move a client's liveness timestamps.
///
/// Not `Clone`: the registry hands exactly one writer per client to the
/// liveness monitor. Both timestamps only ever move forward.
#[derive(Debug)]
pub struct LivenessWriter {
    client_name: String,
    cell: Arc<LivenessCell>,
}

impl LivenessWriter {
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn view(&self) -> LivenessView {
        LivenessView {
            cell: Arc::clone(&self.cell),
        }
    }

    pub fn last_access(&self) -> Option<NaiveDateTime> {
        self.view().last_access()
    }

    /// Moves `lastAccessTime` forward to `time`; returns false if it was
    /// already at or past it.
    pub fn advance_access(&self, time: NaiveDateTime) -> bool {
        let millis = to_millis(&time);
        self.cell.last_access_ms.fetch_max(millis, Ordering::AcqRel) < millis
    }

    pub fn mark_timeout_detected(&self, time: NaiveDateTime) {
        self.cell
            .last_timeout_detected_ms
            .fetch_max(to_millis(&time), Ordering::AcqRel);
    }
}

/// Silence detection settings of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub enabled: bool,
    pub threshold: TimeDelta,
    pub message: String,
}

/// A configured client and the destinations its notices go to.
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    name: String,
    destinations: Vec<Destination>,
    timeout: TimeoutPolicy,
    liveness: LivenessView,
}

impl ClientRegistration {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    pub fn timeout(&self) -> &TimeoutPolicy {
        &self.timeout
    }

    pub fn liveness(&self) -> &LivenessView {
        &self.liveness
    }
}

/// Parsed `name \t timeoutCheck \t timeoutLength \t timeoutMessage` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientLine {
    pub name: String,
    pub timeout: TimeoutPolicy,
}

impl ClientLine {
    pub fn parse(line: &str) -> Result<Self> {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 4 {
            return Err(SignalError::ConfigError(format!(
                "client line needs 4 columns, got {}: '{}'",
                cols.len(),
                line
            )));
        }

        let name = cols[0].trim();
        if name.is_empty() {
            return Err(SignalError::ConfigError(format!(
                "client line has no name: '{}'",
                line
            )));
        }

        let enabled = match cols[1].trim().to_ascii_lowercase().as_str() {
            "true" => true,
            "false" => false,
            other => {
                return Err(SignalError::ConfigError(format!(
                    "invalid timeout check flag '{}' for client '{}'",
                    other, name
                )));
            }
        };

        let seconds: i64 = cols[2].trim().parse().map_err(|_| {
            SignalError::ConfigError(format!(
                "invalid timeout length '{}' for client '{}'",
                cols[2], name
            ))
        })?;

        let threshold = TimeDelta::try_seconds(seconds.max(0)).ok_or_else(|| {
            SignalError::ConfigError(format!(
                "timeout length {} out of range for client '{}'",
                seconds, name
            ))
        })?;

        Ok(Self {
            name: name.to_string(),
            timeout: TimeoutPolicy {
                enabled,
                threshold,
                message: cols[3].to_string(),
            },
        })
    }
}

/// The loaded client list, shared read-only by every component.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<Vec<ClientRegistration>>,
}

impl ClientRegistry {
    /// Builds registrations from `(client line, destination index list)`
    /// pairs. Returns the shared registry and the liveness writers, which
    /// belong to the liveness monitor alone.
    ///
    /// `loaded_at` seeds every client's `lastAccessTime`.
    pub fn build<S: AsRef<str>>(
        book: &DestinationBook,
        entries: &[(S, S)],
        loaded_at: NaiveDateTime,
    ) -> (Self, Vec<LivenessWriter>) {
        let mut clients = Vec::with_capacity(entries.len());
        let mut writers = Vec::with_capacity(entries.len());

        for (line, index_list) in entries {
            let parsed = match ClientLine::parse(line.as_ref()) {
                Ok(parsed) => parsed,
                Err(err) => {
                    event!(Level::WARN, error = %err, "client registration skipped");
                    continue;
                }
            };

            if clients
                .iter()
                .any(|c: &ClientRegistration| c.name == parsed.name)
            {
                event!(Level::WARN, client = %parsed.name, "duplicate client registration skipped");
                continue;
            }

            let cell = Arc::new(LivenessCell {
                last_access_ms: AtomicI64::new(to_millis(&loaded_at)),
                last_timeout_detected_ms: AtomicI64::new(UNSET),
            });
            let writer = LivenessWriter {
                client_name: parsed.name.clone(),
                cell,
            };

            clients.push(ClientRegistration {
                destinations: book.resolve(index_list.as_ref()),
                name: parsed.name,
                timeout: parsed.timeout,
                liveness: writer.view(),
            });
            writers.push(writer);
        }

        (
            Self {
                clients: Arc::new(clients),
            },
            writers,
        )
    }

    pub fn clients(&self) -> &[ClientRegistration] {
        &self.clients
    }

    pub fn get(&self, name: &str) -> Option<&ClientRegistration> {
        self.clients.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parse_timestamp;

    fn loaded_at() -> NaiveDateTime {
        parse_timestamp("2024/01/01 09:00:00.000").unwrap()
    }

    #[test]
    fn parse_client_line() {
        let line = ClientLine::parse("Press1\tTrue\t60\tPress1 is silent").unwrap();
        assert_eq!(line.name, "Press1");
        assert!(line.timeout.enabled);
        assert_eq!(line.timeout.threshold, TimeDelta::seconds(60));
        assert_eq!(line.timeout.message, "Press1 is silent");

        assert!(ClientLine::parse("Press1\ttrue\t60").is_err());
        assert!(ClientLine::parse("Press1\tmaybe\t60\tx").is_err());
        assert!(ClientLine::parse("\ttrue\t60\tx").is_err());
        assert!(ClientLine::parse("Press1\ttrue\t99999999999999999\tx").is_err());
        assert_eq!(
            ClientLine::parse("Press1\ttrue\t-5\tx").unwrap().timeout.threshold,
            TimeDelta::zero()
        );
    }

    #[test]
    fn build_resolves_destinations_and_skips_bad_lines() {
        let book = DestinationBook::from_lines(&["10.0.0.1\tA", "10.0.0.2\tB"]);
        let (registry, writers) = ClientRegistry::build(
            &book,
            &[
                ("Press1\ttrue\t60\tsilent", "2"),
                ("broken", "ALL"),
                ("Press2\tfalse\t0\t", "ALL"),
            ],
            loaded_at(),
        );

        assert_eq!(registry.len(), 2);
        assert_eq!(writers.len(), 2);
        assert_eq!(registry.get("Press1").unwrap().destinations().len(), 1);
        assert_eq!(registry.get("Press2").unwrap().destinations().len(), 2);
        assert_eq!(
            registry.get("Press1").unwrap().liveness().last_access(),
            Some(loaded_at())
        );
    }

    #[test]
    fn writer_only_moves_forward_and_views_observe_it() {
        let book = DestinationBook::default();
        let (registry, writers) =
            ClientRegistry::build(&book, &[("Press1\ttrue\t60\tsilent", "ALL")], loaded_at());
        let writer = &writers[0];
        let view = registry.get("Press1").unwrap().liveness().clone();

        let later = parse_timestamp("2024/01/01 09:05:00.000").unwrap();
        assert!(writer.advance_access(later));
        assert!(!writer.advance_access(loaded_at()));
        assert_eq!(view.last_access(), Some(later));

        assert_eq!(view.last_timeout_detected(), None);
        writer.mark_timeout_detected(later);
        assert_eq!(view.last_timeout_detected(), Some(later));
    }
}
