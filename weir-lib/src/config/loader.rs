use std::fs;
use std::path::Path;

use crate::config::AggregatorConfig;
use crate::error::{Result, WeirError};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<AggregatorConfig> {
    let txt = fs::read_to_string(p)
        .map_err(|e| WeirError::Config(format!("Failed to read config file: {e}")))?;
    let cfg: AggregatorConfig = serde_yaml::from_str(&txt)
        .map_err(|e| WeirError::Config(format!("Failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &AggregatorConfig) -> Result<()> {
    if cfg.endpoint.is_empty() {
        return Err(WeirError::Config("No endpoint configured".to_string()));
    }

    cfg.redis_host_port()?;

    if cfg.num_of_syslog_servers == 0 {
        return Err(WeirError::Config(
            "num_of_syslog_servers must be at least 1".to_string(),
        ));
    }

    if cfg.msg_queue_size == 0 {
        return Err(WeirError::Config("msg_queue_size must be positive".to_string()));
    }

    Ok(())
}
