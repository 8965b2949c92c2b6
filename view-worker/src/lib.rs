pub mod config;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod scheduler;
pub mod sync;
pub mod worker;
