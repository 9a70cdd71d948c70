use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = relayctl::Cli::parse();
    if let Err(err) = relayctl::run(cli).await {
        eprintln!("error [{}]: {err}", err.kind());
        std::process::exit(1);
    }
}
