//! Monitor event types and levels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Importance of a monitor event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventLevel {
    /// Progress report.
    Info,
    /// Something the caller probably wants to look at.
    Warning,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MonitorEventKind {
    /// Best-so-far fitness improved.
    NewBest {
        fitness: f64,
        /// `None` when no finite best existed before.
        previous: Option<f64>,
    },
    /// Some fitness values were NaN or infinite.
    NonFiniteFitness { count: usize, total: usize },
    /// No improvement for the configured number of generations.
    Stagnation { generations: u64 },
}

/// A single event emitted by a monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub kind: MonitorEventKind,
    /// Path of the emitting monitor node.
    pub monitor: String,
    pub generation: u64,
    /// Lane index within a batched state.
    pub lane: usize,
    pub message: String,
}

impl MonitorEvent {
    pub fn new(
        level: EventLevel,
        kind: MonitorEventKind,
        monitor: impl Into<String>,
        generation: u64,
        lane: usize,
    ) -> Self {
        let message = match &kind {
            MonitorEventKind::NewBest { fitness, previous } => match previous {
                Some(prev) => format!("best fitness improved from {prev:.6e} to {fitness:.6e}"),
                None => format!("first finite best fitness {fitness:.6e}"),
            },
            MonitorEventKind::NonFiniteFitness { count, total } => {
                format!("{count} of {total} fitness values are not finite")
            }
            MonitorEventKind::Stagnation { generations } => {
                format!("no improvement for {generations} generations")
            }
        };
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            kind,
            monitor: monitor.into(),
            generation,
            lane,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(EventLevel::Info < EventLevel::Warning);
    }

    #[test]
    fn message_describes_kind() {
        let event = MonitorEvent::new(
            EventLevel::Warning,
            MonitorEventKind::NonFiniteFitness { count: 2, total: 10 },
            "monitor",
            3,
            0,
        );
        assert_eq!(event.message, "2 of 10 fitness values are not finite");
        let first = MonitorEvent::new(
            EventLevel::Info,
            MonitorEventKind::NewBest {
                fitness: 1.0,
                previous: None,
            },
            "monitor",
            0,
            1,
        );
        assert!(first.message.starts_with("first finite"));
        assert_ne!(event.id, first.id);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = MonitorEvent::new(
            EventLevel::Info,
            MonitorEventKind::Stagnation { generations: 20 },
            "monitor",
            40,
            2,
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: MonitorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, event.kind);
        assert_eq!(back.level, event.level);
        assert_eq!(back.lane, 2);
    }
}
