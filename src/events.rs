//! Notifications emitted by the engine for the caller to drain.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use acdc_labels::CellId;

/// Something the presentation layer may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Frame state changed and should be redrawn / autosaved
    FrameDirty {
        /// Position index
        position: usize,
        /// Frame index
        frame: usize,
    },
    /// Human-readable status line
    Status(String),
    /// The tracker renumbered objects of a frame
    TrackingApplied {
        /// Frame index
        frame: usize,
        /// Old ID to new ID for every object whose ID changed
        mapping: BTreeMap<CellId, CellId>,
    },
    /// Sequential relabel mapping applied to a position
    RelabelMapping {
        /// Position index
        position: usize,
        /// Old ID to new ID
        mapping: BTreeMap<CellId, CellId>,
    },
    /// Save worker progress
    SaveProgress {
        /// Position index
        position: usize,
        /// Frames written so far
        done: usize,
        /// Frames to write
        total: usize,
    },
    /// A worker failed; the engine is in error state
    WorkerError {
        /// Error description
        message: String,
        /// Session log with the details
        session_log: Option<PathBuf>,
    },
}

/// FIFO of pending events.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<EngineEvent>,
}

impl EventQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn push(&mut self, event: EngineEvent) {
        log::trace!("Event: {:?}", event);
        self.events.push_back(event);
    }

    /// Convenience for [`EngineEvent::Status`].
    pub fn status(&mut self, message: impl Into<String>) {
        self.push(EngineEvent::Status(message.into()));
    }

    /// Take every pending event, oldest first.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        self.events.drain(..).collect()
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no event is pending.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_is_fifo() {
        let mut queue = EventQueue::new();
        queue.status("first");
        queue.push(EngineEvent::FrameDirty {
            position: 0,
            frame: 2,
        });
        assert_eq!(queue.len(), 2);
        let events = queue.drain();
        assert_eq!(events[0], EngineEvent::Status("first".to_string()));
        assert!(queue.is_empty());
    }
}
