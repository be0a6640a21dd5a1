//! Integration test modules for fxgrid
//!
//! - streaming: chunk round trips through local sessions
//! - sessions: session lifecycle and chain edits
//! - sandboxes: sandbox handoff and supervision

pub mod sandboxes;
pub mod sessions;
pub mod streaming;
