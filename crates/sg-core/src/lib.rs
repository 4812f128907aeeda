pub mod config;
pub mod db;
pub mod elastic;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod migrations;
pub mod object_store;
pub mod server;
pub mod service_config;
pub mod time;
