use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::core::commands::Registry;
use crate::logging;
use crate::remote::agent::Agent;

pub async fn run_agent(config: Config) -> Result<()> {
    logging::init(config.log_level()?);

    let commands = config.agent_commands()?;
    if commands.is_empty() {
        bail!("No shell commands configured; an agent needs at least one.");
    }
    info!("Starting cmdbot agent with {} command(s)", commands.len());

    let agent = Agent::new(&config.agent, Registry::new(commands));
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    agent.run(shutdown).await?;
    Ok(())
}
