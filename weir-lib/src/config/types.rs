use serde::Deserialize;

use crate::error::WeirError;

/// Aggregator daemon configuration, loaded from YAML.
#[derive(Debug, Deserialize, Clone)]
pub struct AggregatorConfig {
    /// UDP port the syslog workers listen on (shared via SO_REUSEPORT)
    pub port: u16,
    /// Number of worker pipelines; one stays on the main thread
    /// Default: 1
    #[serde(default = "default_num_workers")]
    pub num_of_syslog_servers: usize,
    /// Capacity of the producer/consumer queue, in messages
    /// Default: 1024
    #[serde(default = "default_msg_queue_size")]
    pub msg_queue_size: usize,
    /// Endpoint suffix appended to every store key (e.g. "dev.dc")
    pub endpoint: String,
    /// Store server as `host:port`
    pub redis_server: String,
    /// TTL in seconds for per-second counter hashes
    /// Default: 2
    #[serde(default = "default_qos_ttl")]
    pub redis_qos_ttl: u64,
    /// TTL in seconds for active-request gauges
    /// Default: 60
    #[serde(default = "default_conn_ttl")]
    pub redis_qos_conn_ttl: u64,
    /// How often the watcher re-resolves the store host, in seconds
    /// Default: 5
    #[serde(default = "default_check_conn_interval")]
    pub redis_check_conn_interval_sec: u64,
    /// Flush once this many events are pending
    /// Default: 250000
    #[serde(default = "default_batch_count")]
    pub metrics_batch_count: usize,
    /// Flush at least this often, in milliseconds
    /// Default: 31
    #[serde(default = "default_batch_period")]
    pub metrics_batch_period_msec: u64,
    /// General log file; stdout when unset
    #[serde(default)]
    pub log_file_name: Option<String>,
    /// Access log file for pass-through JSON lines; stdout when unset
    #[serde(default)]
    pub access_log_file_name: Option<String>,
    /// Log level: "trace", "debug", "info", "warn", "error"
    /// Default: "info"
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_num_workers() -> usize {
    1
}

fn default_msg_queue_size() -> usize {
    1024
}

fn default_qos_ttl() -> u64 {
    2
}

fn default_conn_ttl() -> u64 {
    60
}

fn default_check_conn_interval() -> u64 {
    5
}

fn default_batch_count() -> usize {
    250_000
}

fn default_batch_period() -> u64 {
    31
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AggregatorConfig {
    /// Split `redis_server` into host and port.
    pub fn redis_host_port(&self) -> crate::Result<(String, u16)> {
        let (host, port) = self
            .redis_server
            .rsplit_once(':')
            .ok_or_else(|| WeirError::Config("can't parse qos redis server address".to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| WeirError::Config("can't parse qos redis server address".to_string()))?;
        if host.is_empty() {
            return Err(WeirError::Config("can't parse qos redis server address".to_string()));
        }
        Ok((host.to_string(), port))
    }
}
