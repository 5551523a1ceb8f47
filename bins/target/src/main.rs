mod config;
mod error;

use clap::Parser;
use config::{Cli, LogFormat};
use tracing_subscriber::EnvFilter;

mod cmd;

fn init_tracing(format: LogFormat) {
    // stdout занят STATE-строками, логи только в stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Err(e) = cmd::run::run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
