use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(risk_alert_cli::log_filter())
        .with_writer(std::io::stderr)
        .init();

    let cli = risk_alert_cli::Cli::parse();
    risk_alert_cli::run_cli(cli)
}
