//! Request extractors for worker-facing and internal endpoints.

pub mod worker_token;
