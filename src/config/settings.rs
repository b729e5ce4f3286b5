use serde::Deserialize;

use crate::transport::Limits;

/// Top-level configuration settings for the application.
///
/// Covers the listening server, the broker engine, the client session used by
/// the `publish`/`subscribe` commands, and logging.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub client: ClientSettings,
    pub logging: LogSettings,
}

/// Where the broker listens. An empty host means all interfaces.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Size of the buffer for each socket read; one read is one frame.
    pub read_buffer_size: usize,
    /// Frames queued per connection before a slow subscriber is dropped.
    pub outbound_queue_size: usize,
    pub shutdown_timeout_ms: u64,
}

/// Settings of a client session connecting to a broker.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    /// Seconds between PINGREQs; `0` disables keep-alive.
    pub keep_alive_secs: u64,
    pub ack_timeout_ms: u64,
    pub read_buffer_size: usize,
    pub outbound_queue_size: usize,
}

impl BrokerSettings {
    pub fn limits(&self) -> Limits {
        Limits {
            read_buffer_size: self.read_buffer_size,
            queue_capacity: self.outbound_queue_size,
        }
    }
}

impl ClientSettings {
    pub fn limits(&self) -> Limits {
        Limits {
            read_buffer_size: self.read_buffer_size,
            queue_capacity: self.outbound_queue_size,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from [`Settings::default`].
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub client: Option<PartialClientSettings>,
    pub logging: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub backlog: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub read_buffer_size: Option<usize>,
    pub outbound_queue_size: Option<usize>,
    pub shutdown_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClientSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub keep_alive_secs: Option<u64>,
    pub ack_timeout_ms: Option<u64>,
    pub read_buffer_size: Option<usize>,
    pub outbound_queue_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 1883,
                backlog: 5,
            },
            broker: BrokerSettings {
                read_buffer_size: 1024,
                outbound_queue_size: 256,
                shutdown_timeout_ms: 1000,
            },
            client: ClientSettings {
                host: "127.0.0.1".to_string(),
                port: 1883,
                keep_alive_secs: 30,
                ack_timeout_ms: 5000,
                read_buffer_size: 1024,
                outbound_queue_size: 256,
            },
            logging: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Fills every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let client = self.client.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
                backlog: server.backlog.unwrap_or(default.server.backlog),
            },
            broker: BrokerSettings {
                read_buffer_size: broker
                    .read_buffer_size
                    .unwrap_or(default.broker.read_buffer_size),
                outbound_queue_size: broker
                    .outbound_queue_size
                    .unwrap_or(default.broker.outbound_queue_size),
                shutdown_timeout_ms: broker
                    .shutdown_timeout_ms
                    .unwrap_or(default.broker.shutdown_timeout_ms),
            },
            client: ClientSettings {
                host: client.host.unwrap_or(default.client.host),
                port: client.port.unwrap_or(default.client.port),
                keep_alive_secs: client
                    .keep_alive_secs
                    .unwrap_or(default.client.keep_alive_secs),
                ack_timeout_ms: client
                    .ack_timeout_ms
                    .unwrap_or(default.client.ack_timeout_ms),
                read_buffer_size: client
                    .read_buffer_size
                    .unwrap_or(default.client.read_buffer_size),
                outbound_queue_size: client
                    .outbound_queue_size
                    .unwrap_or(default.client.outbound_queue_size),
            },
            logging: LogSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}
