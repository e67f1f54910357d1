//! Live recording session management
//!
//! This module provides the `LiveSession` abstraction that manages:
//! - Receiving media chunks from a recorder over a channel
//! - Feeding them into a `VideoSegmentBuffer`
//! - Flushing and awaiting segment uploads on stop
//! - Session statistics

mod config;
mod session;
mod stats;

pub use config::SessionConfig;
pub use session::LiveSession;
pub use stats::{RecordingSummary, SegmentSummary, SessionStats};
