// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<BatchexConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static BatchexConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = BatchexConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static BatchexConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = BatchexConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static BatchexConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("BATCHEX_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("batchex.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $BATCHEX_CONFIG or create ./batchex.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct BatchexConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub exchange: ExchangeSection,
}

#[derive(Clone, Deserialize)]
pub struct ExchangeSection {
    #[serde(default = "ExchangeSection::default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "ExchangeSection::default_channel_buffer_pages")]
    pub channel_buffer_pages: usize,
    #[serde(default = "ExchangeSection::default_client_ready_timeout_ms")]
    pub client_ready_timeout_ms: u64,
}

impl ExchangeSection {
    fn default_max_workers() -> usize {
        4
    }

    fn default_channel_buffer_pages() -> usize {
        32
    }

    fn default_client_ready_timeout_ms() -> u64 {
        30_000
    }
}

impl Default for ExchangeSection {
    fn default() -> Self {
        Self {
            max_workers: Self::default_max_workers(),
            channel_buffer_pages: Self::default_channel_buffer_pages(),
            client_ready_timeout_ms: Self::default_client_ready_timeout_ms(),
        }
    }
}

impl BatchexConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: BatchexConfig =
            toml::from_str(&s).with_context(|| format!("parse config file: {}", path.display()))?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::BatchexConfig;

    #[test]
    fn parse_minimal_config() {
        let cfg: BatchexConfig = toml::from_str("").expect("empty config parses");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.exchange.max_workers, 4);
        assert_eq!(cfg.exchange.channel_buffer_pages, 32);
    }

    #[test]
    fn parse_exchange_overrides() {
        let cfg: BatchexConfig = toml::from_str(
            "[exchange]\nmax_workers = 2\nchannel_buffer_pages = 8\nclient_ready_timeout_ms = 500\n",
        )
        .expect("config parses");
        assert_eq!(cfg.exchange.max_workers, 2);
        assert_eq!(cfg.exchange.channel_buffer_pages, 8);
        assert_eq!(cfg.exchange.client_ready_timeout_ms, 500);
    }
}
