mod config;
mod connection;
mod connid;
mod encoding;
mod event;
mod forward;
mod pipeline;
mod sink;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, load_settings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_cli();
    init_tracing(cli.log_level.as_deref());
    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(err) => usage_error(&format!("{err:#}")),
    };
    forward::run(settings).await
}

fn init_tracing(level: Option<&str>) {
    let filter = level
        .map(EnvFilter::new)
        .unwrap_or_else(EnvFilter::from_default_env);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Like `Cli::parse`, but argument errors exit with status 1.
fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.use_stderr() => {
            let _ = err.print();
            std::process::exit(1);
        }
        Err(err) => {
            let _ = err.print();
            std::process::exit(0);
        }
    }
}

fn usage_error(message: &str) -> ! {
    eprintln!("Error: {message}");
    eprintln!();
    eprintln!("{}", Cli::command().render_help());
    std::process::exit(1);
}
