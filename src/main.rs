use clap::Parser;
use ota_serve::{run, Cli, Result, SystemRunner};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match start(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("[!] {}", e);
            std::process::exit(1);
        }
    }
}

fn start(cli: Cli) -> Result<i32> {
    // Validation happens before the runtime exists, so nothing has been touched yet.
    let config = cli.into_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config, &SystemRunner))
}
