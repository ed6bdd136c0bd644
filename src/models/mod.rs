//! Data model types mapped to the PostgreSQL schema.

pub mod finding;
pub mod incident;
pub mod pagination;
pub mod scan_job;
pub mod worker;
