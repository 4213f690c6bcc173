//! Service configuration file model.
//!
//! TOML with one table per concern: `[service]`, `[traders]`,
//! `[report]`, `[brokers]`, and a `[trader.<id>]` table per
//! configured trader.

use crate::error::{BotError, Result};
use pmm_trader::TraderConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Instance file; the pid file, with the control socket beside
    /// it at `<inst_file>.sock`.
    pub inst_file: PathBuf,
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Optional user the daemon should run as; recorded for the
    /// init system, not applied by the process itself.
    #[serde(default)]
    pub user: String,
}

fn default_service_name() -> String {
    "pmmbot".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradersConfig {
    /// Space-separated trader ids.
    pub list: String,
    pub storage_path: PathBuf,
    #[serde(default = "default_true")]
    pub storage_binary: bool,
    #[serde(default = "default_spread_calc_interval")]
    pub spread_calc_interval: u64,
}

fn default_true() -> bool {
    true
}

fn default_spread_calc_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    pub path: PathBuf,
    #[serde(default = "default_report_interval")]
    pub interval: i64,
    #[serde(default)]
    pub a2np: bool,
    #[serde(default)]
    pub http_bind: Option<String>,
    /// Space-separated `base64(user:pass)` credentials; empty
    /// disables authentication.
    #[serde(default)]
    pub http_auth: String,
}

fn default_report_interval() -> i64 {
    864_000_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub service: ServiceConfig,
    pub traders: TradersConfig,
    pub report: ReportConfig,
    #[serde(default)]
    pub brokers: BTreeMap<String, String>,
    #[serde(default)]
    pub trader: BTreeMap<String, TraderConfig>,
}

impl BotConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BotError::Config(format!("{}: {e}", path.display())))?;
        let cfg: BotConfig = toml::from_str(&text)
            .map_err(|e| BotError::Config(format!("{}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        for id in self.trader_ids() {
            if id.starts_with('_') {
                return Err(BotError::Config(format!(
                    "{id}: the trader's name can't begin with underscore '_'"
                )));
            }
            let tcfg = self
                .trader
                .get(&id)
                .ok_or_else(|| BotError::Config(format!("missing [trader.{id}] section")))?;
            if !self.brokers.contains_key(&tcfg.broker) {
                return Err(BotError::Config(format!(
                    "{id}: unknown broker {}",
                    tcfg.broker
                )));
            }
        }
        Ok(())
    }

    /// Ids from the `[traders] list` key, in order.
    pub fn trader_ids(&self) -> Vec<String> {
        self.traders
            .list
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// The trader's config with service-wide defaults resolved in.
    pub fn trader_config(&self, id: &str) -> Result<TraderConfig> {
        let mut cfg = self
            .trader
            .get(id)
            .cloned()
            .ok_or_else(|| BotError::UnknownTrader(id.to_string()))?;
        if cfg.spread_calc_interval == 0 {
            cfg.spread_calc_interval = self.traders.spread_calc_interval;
        }
        if cfg.title.is_empty() {
            cfg.title = id.to_string();
        }
        Ok(cfg)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.service.inst_file.clone()
    }

    pub fn socket_path(&self) -> PathBuf {
        let mut name = self.service.inst_file.as_os_str().to_os_string();
        name.push(".sock");
        PathBuf::from(name)
    }
}
