//! Zerogate - a scale-to-zero reverse proxy for containerized services
//!
//! Each declared service gets its own listener. Services run as containers
//! that are:
//! - Started on the first request and shared by every concurrent caller
//! - Given a free host port and a merged JSON configuration environment
//! - Stopped again by a periodic sweep once idle beyond a standby threshold
//!
//! Services with a static overwrite are forwarded to a fixed address and
//! never started.

pub mod admin;
pub mod catalog;
pub mod compose;
pub mod config;
pub mod discovery;
pub mod docker;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod merge;
pub mod pool;
pub mod ports;
pub mod reaper;
pub mod registry;
pub mod relay;
pub mod router;
pub mod runtime;
pub mod testing;
