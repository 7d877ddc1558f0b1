mod config;
mod error;
mod frame;
mod handlers;
mod hyperstart;
mod io_session;
mod listener;
mod protocol;
mod registry;
mod vm;

use std::process::ExitCode;

use anyhow::Context;
use log::{error, info};

use registry::Proxy;

async fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let socket_path = config::socket_path(&args);

    // Must happen inside the runtime: converting the std listener into a
    // tokio one registers it with the current reactor.
    let listener = listener::bind_or_activate(&socket_path)
        .with_context(|| format!("couldn't bring up listening socket at {socket_path}"))?;

    info!("listening on {socket_path}");

    Proxy::new().serve(listener).await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = config::log_filter();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    if let Err(err) = run().await {
        error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
