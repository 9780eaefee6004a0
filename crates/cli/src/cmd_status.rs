//! `genstream status`: show where things live and the resolved config.

use std::path::Path;

use genstream_client::ClientConfig;

use crate::paths;
use crate::VERSION;

pub fn run(data_dir: &Path, config_path: &Path, config: &ClientConfig) -> anyhow::Result<()> {
    println!();
    println!("  genstream v{}", VERSION);
    println!("  Data dir: {}", data_dir.display());
    println!("  Logs: {}", paths::log_dir(data_dir).display());
    if config_path.exists() {
        println!("  Config: {}", config_path.display());
    } else {
        println!("  Config: {} (not found, using defaults)", config_path.display());
    }
    println!();
    for line in toml::to_string_pretty(config)?.lines() {
        println!("    {line}");
    }
    println!();
    Ok(())
}
