//! Dubflow - Video Dubbing Workflow Client
//!
//! Drives a four-stage dubbing workflow (extract + transcribe, translate,
//! synthesize speech, merge onto the video) against remote stage services,
//! keeping stage ordering, single-flight execution and invalidation of
//! derived results on the client side.

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod language;
pub mod media;
pub mod shell;
pub mod workflow;
