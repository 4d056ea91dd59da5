//! Ratekeeper - Rate Limiting Engine
//!
//! This crate enforces "at most `rate` units per `window` seconds per key".
//! A [`Limiter`] runs one of three backends: an in-process GCRA, a GCRA
//! whose state lives in Redis, or a Redis sliding-window log whose
//! admissions can be refunded through a [`Release`] handle.

pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod store;

pub use config::RatekeeperConfig;
pub use error::{RatekeeperError, Result, ValidationError};
pub use ratelimit::{Decision, Limiter, Release};
