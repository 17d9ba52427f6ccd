use serde::Deserialize;

use crate::error::Result;
use crate::storage::StorageType;

#[derive(Debug, PartialEq, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct Config {
    pub log_level: LogLevel,
    pub storage_type: StorageType,
    /// Number of frames owned by each buffer pool instance.
    pub pool_size: usize,
    /// Number of buffer pool instances sharing the page id space.
    pub pool_instances: usize,
}

impl Config {
    #[allow(dead_code)]
    fn new(file: &str) -> Result<Config> {
        let mut cfg = config::Config::builder()
            .set_default("storage_type", "Memory")?
            .set_default("log_level", "Debug")?
            .set_default("pool_size", 64)?
            .set_default("pool_instances", 1)?;
        if !file.is_empty() {
            cfg = cfg.add_source(config::File::with_name(file))
        }
        cfg = cfg.add_source(config::Environment::with_prefix("HASHBOX"));
        Ok(cfg.build()?.try_deserialize()?)
    }
}
