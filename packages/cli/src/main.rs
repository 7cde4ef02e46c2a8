use clap::Parser;
use tracing_subscriber::EnvFilter;
use wasmcc_cli::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let report = wasmcc_cli::run(args).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
