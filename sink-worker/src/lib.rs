pub mod accumulator;
pub mod app_context;
pub mod committer;
pub mod config;
pub mod consumer;
pub mod controller;
pub mod delivery;
pub mod error;
pub mod health;
pub mod metrics_consts;
pub mod record;
pub mod retry;
pub mod router;
pub mod schema;
pub mod secrets;
pub mod server;
