//! Netsieve - offline driver for the interception engine.
//!
//! This crate provides the pieces the `netsieve` binary is built from:
//!
//! - Capture files: JSON lines of observed bytes, DNS resolutions and
//!   flow closures
//! - Replay of a capture through an [`netsieve_core::InterceptEngine`]
//! - A verdict writer that prints events and logs them to the database
//!
//! # Usage
//!
//! ```ignore
//! use netsieve_app::{capture, replay};
//!
//! let events = capture::read_capture_file("session.jsonl")?;
//! let (sink, rx) = replay::channel_sink();
//! // build an engine around `sink`, then:
//! let summary = replay::replay(&engine, events);
//! ```

pub mod capture;
pub mod replay;

pub use capture::{CaptureError, CaptureEvent, CaptureRecord};
pub use replay::{channel_sink, replay, write_verdicts, ChannelSink, ReplaySummary, WriterStats};
