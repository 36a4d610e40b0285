//! Volume cycling
//!
//! Back-to-back buy/sell round trips that turn over capital for traded
//! volume. Runs instead of the grid, never alongside it (see
//! [`crate::session`]).

pub mod config;
pub mod engine;

pub use config::VolumeConfig;
pub use engine::{HaltReason, LegFill, RoundTrip, SharedVolumeStats, Tier, VolumeCycler, VolumeStats};
