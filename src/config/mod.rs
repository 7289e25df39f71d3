use bigdecimal::BigDecimal;
use log::warn;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub step_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub dispatch_interval_secs: u64,
    pub orphan_retry_secs: u64,
    pub orphan_retry_interval_secs: u64,
    pub creator_fee_percent: BigDecimal,
    pub tools_file: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            step_timeout_secs: 900,
            sweep_interval_secs: 30,
            dispatch_interval_secs: 5,
            orphan_retry_secs: 60,
            orphan_retry_interval_secs: 5,
            creator_fee_percent: BigDecimal::from(5),
            tools_file: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_or("GENSERVER_BIND", defaults.bind_addr),
            step_timeout_secs: env_parsed("GENSERVER_STEP_TIMEOUT_SECS", defaults.step_timeout_secs),
            sweep_interval_secs: env_parsed(
                "GENSERVER_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            ),
            dispatch_interval_secs: env_parsed(
                "GENSERVER_DISPATCH_INTERVAL_SECS",
                defaults.dispatch_interval_secs,
            ),
            orphan_retry_secs: env_parsed("GENSERVER_ORPHAN_RETRY_SECS", defaults.orphan_retry_secs),
            orphan_retry_interval_secs: env_parsed(
                "GENSERVER_ORPHAN_RETRY_INTERVAL_SECS",
                defaults.orphan_retry_interval_secs,
            ),
            creator_fee_percent: env_decimal(
                "GENSERVER_CREATOR_FEE_PERCENT",
                defaults.creator_fee_percent,
            ),
            tools_file: std::env::var("GENSERVER_TOOLS_FILE").ok(),
        }
    }

    pub fn step_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.step_timeout_secs as i64)
    }

    pub fn orphan_retry_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.orphan_retry_secs as i64)
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{key}={raw} is not a number, using {default}");
            default
        }),
        Err(_) => default,
    }
}

fn env_decimal(key: &str, default: BigDecimal) -> BigDecimal {
    match std::env::var(key) {
        Ok(raw) => BigDecimal::from_str(&raw).unwrap_or_else(|_| {
            warn!("{key}={raw} is not a decimal, using {default}");
            default
        }),
        Err(_) => default,
    }
}
