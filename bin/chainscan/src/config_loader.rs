use crate::cli::Cli;
use anyhow::Result;
use chainscan_common::utils::config::load_config_or_default;
use chainscan_common::utils::logging::LoggingConfig;
use chainscan_core::{MempoolConfig, ScannerConfig};
use chainscan_rpc::NodeConfig;
use chainscan_storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub mempool: MempoolConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Command line flags win over file and environment values.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(dir) = &cli.data_dir {
            self.storage.path = dir.clone();
        }
        if let Some(url) = &cli.rpc_url {
            self.node.url = url.clone();
        }
        if let Some(height) = cli.start_height {
            self.scanner.start_height = Some(height);
        }
        if cli.no_mempool {
            self.mempool.enabled = false;
        }
        if let Some(level) = &cli.log_level {
            self.logging.level = level.clone();
        }
    }
}

pub fn load_app_config<P: AsRef<Path>>(path: P, cli: &Cli) -> Result<AppConfig> {
    let mut config: AppConfig = load_config_or_default(path)?;
    config.apply_cli(cli);
    Ok(config)
}
