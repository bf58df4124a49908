//! ACDC - frame-state engine for segmentation-mask editing
//!
//! Loads a Cell-ACDC position folder (time-lapse label images plus a
//! per-object annotation table), lets an operator edit labels, track
//! objects across frames and annotate the cell cycle, and persists the
//! result with autosave and crash recovery.
//!
//! [`Engine`] is the entry point; the modules below are its building
//! blocks and can be used on their own.

pub mod cca;
pub mod config;
pub mod constants;
pub mod edit;
pub mod engine;
pub mod error;
pub mod events;
pub mod frame_state;
pub mod io;
pub mod logging;
pub mod measure;
pub mod model;
pub mod position;
pub mod prompt;
pub mod propagate;
pub mod tracking;
pub mod undo;
pub mod workers;

pub use acdc_labels::{CellId, Labels, PhysicalSize};
pub use config::{AppConfig, ConfigStore};
pub use engine::{Engine, Mode, SaveStatus};
pub use error::{CrashReport, EngineError, Result};
pub use events::EngineEvent;
pub use position::Position;
pub use prompt::{OperatorPrompt, PromptReply, PromptRequest};
pub use propagate::{PropagatedOp, PropagationPolicy};
