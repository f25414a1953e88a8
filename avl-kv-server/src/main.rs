use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use avl_kv_server::{cli::Cli, logging, server::Server};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_handle = logging::init(cli.log_settings());

    let code = match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = ?err, "server could not be started");
            ExitCode::FAILURE
        }
    };

    log_handle.shutdown().await;
    code
}

async fn run(cli: &Cli) -> Result<()> {
    let server = Server::bind(&cli.server_config())?;
    let addr = server.local_addr()?;
    // The banner goes to stdout regardless of log settings so scripts can find the port.
    println!("listening on {addr}");
    info!(%addr, format = ?cli.format, "server started");

    let mut store = server.run_until_signal().await?;
    info!(entries = store.len(), "clearing store");
    store.clear();
    Ok(())
}
