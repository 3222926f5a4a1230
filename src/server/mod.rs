// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;

mod connection_loop;
mod initialization;
mod spawner;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Build the shared state, restore the snapshot, bind the listener.
    let mut server_context = initialization::setup(config).await?;

    // 2. Spawn the background tasks (replication cron, link supervisor,
    //    signal handling).
    spawner::spawn_all(&mut server_context);

    // 3. Accept connections until shutdown.
    connection_loop::run(server_context).await;

    Ok(())
}
