// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Connection parameters for the broker and the tuning knobs of the dispatch
//! engine. Values come from an optional `config/default.toml` file and from
//! `DISPATCH_*` environment variables, e.g. `DISPATCH_RABBITMQ__HOST` or
//! `DISPATCH_DISPATCH__POOL_CAPACITY`. Every field has a default.

use crate::errors::AmqpError;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

/// Top level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Configs {
    pub rabbitmq: RabbitMQConfigs,
    pub dispatch: DispatchConfigs,
}

/// Broker connection parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "127.0.0.1".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: "rabbitmq-dispatch".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// Builds the AMQP URI for these parameters.
    ///
    /// The default vhost `/` is percent encoded.
    pub fn uri(&self) -> String {
        let vhost = if self.vhost == "/" {
            "%2f"
        } else {
            self.vhost.trim_start_matches('/')
        };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}

/// Tuning of the dispatch engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfigs {
    /// Channels per message type pool.
    pub pool_capacity: usize,
    /// Identity hashes kept in the in-memory recency window.
    pub recency_capacity: usize,
    /// Unacknowledged deliveries allowed per delayed consumer.
    pub prefetch_count: u16,
    /// Upper bound on a publisher confirmation wait; `0` waits forever.
    pub confirm_timeout_ms: u64,
}

impl Default for DispatchConfigs {
    fn default() -> Self {
        DispatchConfigs {
            pool_capacity: 10,
            recency_capacity: 1000,
            prefetch_count: 5,
            confirm_timeout_ms: 30_000,
        }
    }
}

impl DispatchConfigs {
    pub fn confirm_timeout(&self) -> Option<Duration> {
        match self.confirm_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Configs {
    /// Loads the configuration from `config/default.toml` (optional) and the
    /// `DISPATCH_` prefixed environment.
    pub fn load() -> Result<Configs, AmqpError> {
        Configs::load_from("config/default")
    }

    /// Same as [`Configs::load`] with an explicit file stem.
    pub fn load_from(file: &str) -> Result<Configs, AmqpError> {
        let built = Config::builder()
            .add_source(File::with_name(file).required(false))
            .add_source(
                Environment::with_prefix("DISPATCH")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|err| {
                error!(error = err.to_string(), "failure to read configs");
                AmqpError::ConfigsError(err.to_string())
            })?;

        built.try_deserialize().map_err(|err| {
            error!(error = err.to_string(), "failure to deserialize configs");
            AmqpError::ConfigsError(err.to_string())
        })
    }
}
