use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "chainscan")]
#[command(about = "Fork-aware block scanner and mempool tracker", long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    pub config: PathBuf,

    /// Path to the ledger directory
    #[arg(short, long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Node JSON-RPC endpoint
    #[arg(long, value_name = "URL", env = "CHAINSCAN_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Height to start from when the ledger is empty
    #[arg(long, value_name = "HEIGHT")]
    pub start_height: Option<u64>,

    /// Do not track the node's mempool
    #[arg(long)]
    pub no_mempool: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}
