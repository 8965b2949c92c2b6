pub mod config;
pub mod counts;
pub mod event;
pub mod fingerprint;
pub mod keys;
pub mod metrics;
pub mod pgqueue;
pub mod producer;
pub mod retry;
pub mod store;
