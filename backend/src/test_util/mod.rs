//! Helpers shared by unit and integration tests.

pub mod mock_upstream;

use std::collections::HashMap;

use crate::config::{Config, EndpointsConfig, LoggingConfig};
use crate::pool::AcquireMode;

/// Configuration with one non-blocking pool per `(kind, urls)` entry.
pub fn test_config(endpoints: &[(&str, Vec<String>)]) -> Config {
    let endpoints: HashMap<String, EndpointsConfig> = endpoints
        .iter()
        .map(|(kind, urls)| {
            (
                kind.to_string(),
                EndpointsConfig {
                    urls: urls.clone(),
                    acquire: AcquireMode::NonBlocking,
                    acquire_timeout_secs: None,
                },
            )
        })
        .collect();

    Config {
        logging: LoggingConfig {
            level: "debug".to_string(),
        },
        endpoints,
        ..Config::default()
    }
}
