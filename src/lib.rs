pub mod access;
pub mod config;
pub mod error;
pub mod extractor;
pub mod routes;
pub mod telemetry;
