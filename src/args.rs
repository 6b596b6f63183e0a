use clap::Parser;
use std::path::PathBuf;

use octrum_core::config;

#[derive(Parser, Debug)]
#[command(name = "octrum-monitor")]
#[command(author = "Octrum Team")]
#[command(version)]
#[command(about = "Headless Octrum client: WHEP live view plus alert channel", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/octrum-core.toml")]
    pub config: PathBuf,

    /// Stream base URL (overrides [whep] url)
    #[arg(long)]
    pub whep_url: Option<String>,

    /// Alert WebSocket URL (overrides [alerts] url)
    #[arg(long)]
    pub alerts_url: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Start in background phase so keepalive pings run
    #[arg(long, action)]
    pub background: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, config::ConfigError> {
        let mut config = config::Config::load(&self.config)?;
        if let Some(ref url) = self.whep_url {
            config.whep.url = Some(url.clone());
        }
        if let Some(ref url) = self.alerts_url {
            config.alerts.url = url.clone();
        }
        Ok(config)
    }
}
