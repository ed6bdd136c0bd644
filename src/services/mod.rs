//! Business logic services.

pub mod admission;
pub mod circuit_breaker;
pub mod fingerprint;
pub mod health_monitor;
pub mod ingestion;
pub mod normalizer;
pub mod rate_limiter;
pub mod retry;
pub mod signals;
pub mod watchdog;
