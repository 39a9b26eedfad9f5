#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod decode;
pub mod download;
pub mod fetch;
pub mod logging;
pub mod services;
pub mod types;
pub mod utils;
