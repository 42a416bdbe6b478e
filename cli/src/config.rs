//! Config loading: YAML file, then command-line / environment overrides,
//! then validation.

use std::path::Path;

use anyhow::{Context, Result};
use chaincrawl_core::config::CrawlerConfig;

/// Values that win over the file when given.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub rpc_url: Option<String>,
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<CrawlerConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read config file '{}'", path.display()))?;
            parse(&text).with_context(|| format!("parse config file '{}'", path.display()))?
        }
        None => CrawlerConfig::default(),
    };
    apply(&mut config, overrides);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

pub fn parse(text: &str) -> Result<CrawlerConfig> {
    if text.trim().is_empty() {
        return Ok(CrawlerConfig::default());
    }
    Ok(serde_yaml::from_str(text)?)
}

pub fn apply(config: &mut CrawlerConfig, overrides: &Overrides) {
    if let Some(url) = &overrides.rpc_url {
        config.rpc.url = url.clone();
    }
    if let Some(url) = &overrides.database_url {
        config.database.url = url.clone();
    }
    if let Some(level) = &overrides.log_level {
        config.log.level = level.clone();
    }
    if overrides.json_logs {
        config.log.json = true;
    }
}
