use std::process;

use clap::Parser;

use blipmqtt::config::Config;
use blipmqtt::logging::init_logging_with;
use blipmqtt::run;

/// MQTT 3.1/3.1.1 broker.
#[derive(Debug, Parser)]
#[command(name = "blipmqtt", version, about)]
struct Cli {
    /// Path to a TOML config file (defaults to $BLIPMQTT_CONFIG, then built-in defaults).
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address, overriding the config file.
    #[arg(short, long)]
    bind: Option<String>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging_with(&cli.log);

    let mut config: Config = match Config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[FATAL] Failed to load config: {e}");
            process::exit(1);
        }
    };
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }

    if let Err(e) = run(config).await {
        eprintln!("[FATAL] Broker crashed: {e:#}");
        process::exit(1);
    }
}
