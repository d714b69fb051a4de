use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::Config;
use crate::core::aliases::AliasLedger;
use crate::core::commands::{Registry, StaticGroups};
use crate::core::executor::Executor;
use crate::core::jobs::JobLedger;
use crate::core::lifecycle::{ExecutorComponent, LifecycleManager};
use crate::core::logs::LogLedger;
use crate::core::store::Store;
use crate::core::tokens::TokenLedger;
use crate::interfaces::console::{ConsoleInterface, ConsoleReplies};
use crate::logging;
use crate::remote::hub::AgentHub;
use crate::remote::server::HubServer;

pub async fn run_serve(config: Config) -> Result<()> {
    logging::init(config.log_level()?);
    info!("Starting cmdbot {}...", env!("CARGO_PKG_VERSION"));

    let store = Store::open(&config.database);
    let mut registry =
        Registry::new(config.server_commands()?).with_aliases(AliasLedger::new(store.clone()));

    let mut lifecycle = LifecycleManager::new(JobLedger::new(store.clone()));

    // attach order is start order; shutdown runs in reverse, so the hub
    // outlives the executor drain and remote jobs can still finish
    if let Some(listen) = &config.server.listen {
        let hub = Arc::new(AgentHub::new(
            TokenLedger::new(store.clone()),
            LogLedger::new(store.clone()),
            config.server.finish_grace(),
        ));
        registry = registry.with_hub(hub.clone());
        lifecycle.attach(Arc::new(Mutex::new(HubServer::new(listen.clone(), hub))));
    }

    let executor = Arc::new(Executor::new(
        store,
        registry,
        Arc::new(StaticGroups::new(config.groups.clone())),
        Arc::new(ConsoleReplies),
        &config.executor,
    ));
    lifecycle.attach(Arc::new(Mutex::new(ExecutorComponent::new(executor.clone()))));
    lifecycle.attach(Arc::new(Mutex::new(ConsoleInterface::new(executor))));

    lifecycle.start().await?;
    tokio::signal::ctrl_c().await?;
    lifecycle.shutdown().await
}
