// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thl::config::{DEFAULT_FRAGMENT_WAIT, DEFAULT_PORT, DELETE_BATCH_SIZE};
use thl::error::{Result, ThlError};

/// Storage backend selected at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    Sqlite,
    Memory,
}

impl FromStr for StorageKind {
    type Err = ThlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StorageKind::Sqlite),
            "memory" => Ok(StorageKind::Memory),
            other => Err(ThlError::Config(format!("unknown storage kind: {}", other))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ThlConfig {
    pub listen_addr: SocketAddr,
    pub storage: StorageKind,
    pub db_path: PathBuf,
    pub fragment_wait: Duration,
    pub busy_timeout: Duration,
    /// Messages between serializer buffer resets; 0 never resets.
    pub reset_period: u32,
    /// Events per outgoing batch; 0 sends each event on its own.
    pub buffer_size: usize,
    pub cache_size: usize,
    pub heartbeat_millis: u64,
    pub prefetch_range: u64,
    pub retry_interval: Duration,
    pub retry_log_every: u32,
    pub handler_join_timeout: Duration,
    pub reader_join_timeout: Duration,
    pub delete_batch_size: usize,
    pub http_addr: Option<SocketAddr>,
}

impl Default for ThlConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            storage: StorageKind::Sqlite,
            db_path: PathBuf::from("thl.db"),
            fragment_wait: DEFAULT_FRAGMENT_WAIT,
            busy_timeout: Duration::from_secs(5),
            reset_period: 1,
            buffer_size: 0,
            cache_size: 100,
            heartbeat_millis: 3000,
            prefetch_range: u64::MAX,
            retry_interval: Duration::from_secs(1),
            retry_log_every: 10,
            handler_join_timeout: Duration::from_secs(10),
            reader_join_timeout: Duration::from_secs(2),
            delete_batch_size: DELETE_BATCH_SIZE,
            http_addr: None,
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ThlError::Config(format!("{}={}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

impl ThlConfig {
    /// Defaults overridden by `THL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = env_value("THL_LISTEN_ADDR")? {
            cfg.listen_addr = v;
        }
        if let Some(v) = env_value("THL_STORAGE")? {
            cfg.storage = v;
        }
        if let Some(v) = env_value::<String>("THL_DB_PATH")? {
            cfg.db_path = PathBuf::from(v);
        }
        if let Some(ms) = env_value("THL_FRAGMENT_WAIT_MS")? {
            cfg.fragment_wait = Duration::from_millis(ms);
        }
        if let Some(v) = env_value("THL_RESET_PERIOD")? {
            cfg.reset_period = v;
        }
        if let Some(v) = env_value("THL_BUFFER_SIZE")? {
            cfg.buffer_size = v;
        }
        if let Some(v) = env_value("THL_CACHE_SIZE")? {
            cfg.cache_size = v;
        }
        if let Some(v) = env_value("THL_HEARTBEAT_MS")? {
            cfg.heartbeat_millis = v;
        }
        if let Some(v) = env_value("THL_PREFETCH_RANGE")? {
            cfg.prefetch_range = v;
        }
        if let Some(ms) = env_value("THL_RETRY_INTERVAL_MS")? {
            cfg.retry_interval = Duration::from_millis(ms);
        }
        if let Some(v) = env_value("THL_DELETE_BATCH_SIZE")? {
            cfg.delete_batch_size = v;
        }
        if let Some(v) = env_value("THL_HTTP_ADDR")? {
            cfg.http_addr = Some(v);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_millis == 0 {
            return Err(ThlError::Config("heartbeat_millis must be positive".into()));
        }
        if self.prefetch_range == 0 {
            return Err(ThlError::Config("prefetch_range must be positive".into()));
        }
        if self.delete_batch_size == 0 {
            return Err(ThlError::Config("delete_batch_size must be positive".into()));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_millis)
    }
}

/// Sizing of the partitioned read layer.
#[derive(Clone, Debug)]
pub struct ParallelConfig {
    pub channels: u32,
    /// Capacity of each reader's output queue.
    pub max_size: usize,
    /// Control events a reader may hold back before `put_control_event` waits.
    pub max_control_events: usize,
    /// Discarded transactions between Sync control events; 0 disables them.
    pub sync_interval: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            max_size: 10,
            max_control_events: 1000,
            sync_interval: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ThlConfig::default();
        assert_eq!(cfg.listen_addr.port(), 2112);
        assert_eq!(cfg.heartbeat(), Duration::from_secs(3));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_storage_kind_parse() {
        assert_eq!("SQLite".parse::<StorageKind>().unwrap(), StorageKind::Sqlite);
        assert_eq!("memory".parse::<StorageKind>().unwrap(), StorageKind::Memory);
        assert!("oracle".parse::<StorageKind>().is_err());
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        let cfg = ThlConfig {
            heartbeat_millis: 0,
            ..ThlConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ThlError::Config(_))));
    }
}
