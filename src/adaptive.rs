//! Stress-driven budget adaptation.
//!
//! - [`profile`]: named sensitivity profiles and stress-band selection.
//! - [`controller`]: the periodic ticks that shrink budgets under load and
//!   walk them back to baseline when the host recovers.

pub mod controller;
pub mod profile;

pub use controller::{AdaptationRecord, AdaptiveController, ControllerSettings, ControllerStatus};
pub use profile::{AdaptiveProfile, ProfileKind};
