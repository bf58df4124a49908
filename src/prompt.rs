//! Questions the engine and its workers ask the operator.
//!
//! Every interaction goes through [`OperatorPrompt`]. Background workers
//! cannot call it directly; they send a [`PromptRequest`] over a channel and
//! block until the main thread replies (see `workers::save`).

use std::collections::VecDeque;
use std::path::PathBuf;

use acdc_labels::CellId;

/// A question for the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptRequest {
    /// A cell in S loses its relative at `next_frame`; annotate division at `frame`?
    ConfirmDivision {
        /// Frame where the division would be annotated
        frame: usize,
        /// Mother and bud IDs
        pair: (CellId, CellId),
    },
    /// More new cells than G1 cells are available as mothers.
    UnassignedBuds {
        /// Frame being initialised
        frame: usize,
        /// New IDs without a mother
        new_ids: Vec<CellId>,
        /// Number of available G1 cells
        g1_available: usize,
    },
    /// A bud assignment requires discarding annotations of future frames.
    CcaOverride {
        /// Bud ID
        bud: CellId,
        /// Candidate mother ID
        mother: CellId,
        /// First frame whose annotations will be discarded
        from_frame: usize,
    },
    /// A z-slice is needed to measure a 3D channel against 2D labels.
    ZSlice {
        /// Position directory name
        position: String,
        /// Channel name
        channel: String,
        /// Frame index
        frame: usize,
        /// Number of z-slices
        size_z: usize,
    },
    /// The file is held open by another program.
    FileHeldOpen {
        /// Locked file
        path: PathBuf,
    },
    /// Unsaved recovery data is newer than the saved files.
    Recover {
        /// Position directory
        position: PathBuf,
    },
    /// Compute measurements while saving?
    SaveMeasurements,
    /// Save beyond the last visited frame, treating unvisited frames as empty?
    ExtendSaveRange {
        /// Last frame that would be saved
        last_visited: usize,
        /// Number of frames in the position
        size_t: usize,
    },
}

/// The operator's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptReply {
    /// Accept
    Yes,
    /// Decline
    No,
    /// Use this z-slice / stop at this frame
    Index(usize),
    /// File released, try again
    Retry,
    /// Give up the running operation
    Abort,
}

impl PromptReply {
    /// Whether the reply accepts the request.
    pub fn is_yes(&self) -> bool {
        matches!(self, PromptReply::Yes | PromptReply::Index(_) | PromptReply::Retry)
    }
}

/// Synchronous operator interface.
pub trait OperatorPrompt: Send {
    /// Answer a request.
    fn ask(&mut self, request: &PromptRequest) -> PromptReply;
}

/// Accepts every request (middle z-slice, retry on locked files).
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAccept;

impl OperatorPrompt for AutoAccept {
    fn ask(&mut self, request: &PromptRequest) -> PromptReply {
        log::debug!("Auto-accepting {:?}", request);
        match request {
            PromptRequest::ZSlice { size_z, .. } => PromptReply::Index(size_z / 2),
            PromptRequest::FileHeldOpen { .. } => PromptReply::Retry,
            PromptRequest::ExtendSaveRange { size_t, .. } => {
                PromptReply::Index(size_t.saturating_sub(1))
            }
            _ => PromptReply::Yes,
        }
    }
}

/// Declines every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoReject;

impl OperatorPrompt for AutoReject {
    fn ask(&mut self, request: &PromptRequest) -> PromptReply {
        log::debug!("Auto-rejecting {:?}", request);
        match request {
            PromptRequest::FileHeldOpen { .. } => PromptReply::Abort,
            _ => PromptReply::No,
        }
    }
}

/// Replays queued replies, then falls back to another prompt.
pub struct Scripted {
    replies: VecDeque<PromptReply>,
    asked: Vec<PromptRequest>,
    fallback: Box<dyn OperatorPrompt>,
}

impl Scripted {
    /// Answer with `replies` in order, then defer to `fallback`.
    pub fn new(replies: impl IntoIterator<Item = PromptReply>, fallback: Box<dyn OperatorPrompt>) -> Self {
        Self {
            replies: replies.into_iter().collect(),
            asked: Vec::new(),
            fallback,
        }
    }

    /// Every request seen so far.
    pub fn asked(&self) -> &[PromptRequest] {
        &self.asked
    }
}

impl OperatorPrompt for Scripted {
    fn ask(&mut self, request: &PromptRequest) -> PromptReply {
        self.asked.push(request.clone());
        match self.replies.pop_front() {
            Some(reply) => reply,
            None => self.fallback.ask(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_accept_picks_middle_slice() {
        let reply = AutoAccept.ask(&PromptRequest::ZSlice {
            position: "Position_1".to_string(),
            channel: "GFP".to_string(),
            frame: 0,
            size_z: 9,
        });
        assert_eq!(reply, PromptReply::Index(4));
    }

    #[test]
    fn test_scripted_then_fallback() {
        let mut prompt = Scripted::new([PromptReply::No], Box::new(AutoAccept));
        assert_eq!(prompt.ask(&PromptRequest::SaveMeasurements), PromptReply::No);
        assert_eq!(prompt.ask(&PromptRequest::SaveMeasurements), PromptReply::Yes);
        assert_eq!(prompt.asked().len(), 2);
    }
}
