//! Citadel node agent - entry point.
//!
//! Attaches this host to the control plane and executes inference
//! jobs from the work queue.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    citadel_agent::run().await
}
