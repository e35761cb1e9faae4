// Session Relay - library root

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod http_client;
pub mod metrics;
pub mod models;
pub mod session;
pub mod storage;
