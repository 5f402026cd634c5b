mod aggregator;
mod app;
mod camera;
mod config;
mod diagnostics;
mod error;
mod hooks;
mod messages;
mod sensors;
mod services;
mod storage;
mod trigger;

use app::App;
use config::Config;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Motion-triggered camera recorder writing fixed-length video segments
#[derive(Parser, Debug)]
#[command(name = "motioncam", version, about)]
struct Cli {
    /// Config file (default: ~/.config/motioncam/config.json)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, env = "MOTIONCAM_LOG", default_value = "info")]
    log_level: String,

    /// Print the default configuration as JSON and exit
    #[arg(long)]
    print_default_config: bool,

    /// Poll the motion sensors with the camera off and log every reading
    #[arg(long)]
    sensor_test: bool,

    /// Stop the sensor test after this many polls
    #[arg(long, value_name = "N", requires = "sensor_test")]
    samples: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        println!("{}", Config::default().to_json()?);
        return Ok(());
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting motioncam");

    let config = Config::load(cli.config.as_deref())?;
    config.validate()?;

    if cli.sensor_test {
        return diagnostics::run_sensor_test(&config, cli.samples).await;
    }

    App::new(config).await?.run().await?;

    tracing::info!("motioncam shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::try_parse_from(["motioncam", "--config", "/etc/motioncam.json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/motioncam.json")));
        assert!(!cli.print_default_config);

        let cli = Cli::try_parse_from(["motioncam", "--print-default-config"]).unwrap();
        assert!(cli.print_default_config);
    }

    #[test]
    fn test_cli_sensor_test_flags() {
        let cli =
            Cli::try_parse_from(["motioncam", "--sensor-test", "--samples", "40"]).unwrap();
        assert!(cli.sensor_test);
        assert_eq!(cli.samples, Some(40));

        // A sample limit only makes sense in sensor test mode
        assert!(Cli::try_parse_from(["motioncam", "--samples", "40"]).is_err());
    }
}
