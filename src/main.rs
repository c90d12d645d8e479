// `main.rs` only delegates to `server::run()`; everything else lives in the
// library crate.
use device_gateway::server;

/// Any error returned here exits the process with a failure status.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    server::run().await
}
