//! telerec: a broadcast-television recording scheduler.
//!
//! The core of a home media server that records broadcast TV: an EPG
//! store with fuzzy merge, a channel-name reconciler for external feeds,
//! a tuner allocator aware of transponder sharing, a priority-based
//! recording plan builder, and a reference-counted capture session
//! manager driven by a once-a-minute control loop.
//!
//! The audio/video pipeline itself is an external collaborator behind
//! [`capture::CaptureGraph`]; storage is SQLite via [`database`].

pub mod capture;
pub mod config;
pub mod database;
pub mod epg;
pub mod logging;
pub mod scheduler;
pub mod text;
pub mod tuner;
