use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::executor::Executor;
use crate::core::jobs::JobLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Recover,
    ConnectTransports,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Starts components in attach order and shuts them down in reverse, so
/// transports stop feeding the executor before it drains.
pub struct LifecycleManager {
    state: LifecycleState,
    jobs: JobLedger,
    components: Vec<Arc<Mutex<dyn LifecycleComponent + Send + Sync>>>,
}

impl LifecycleManager {
    pub fn new(jobs: JobLedger) -> Self {
        Self {
            state: LifecycleState::Init,
            jobs,
            components: Vec::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent + Send + Sync>>) {
        self.components.push(component);
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle Phase: Recover");
        self.state = LifecycleState::Recover;
        self.jobs.fail_running_jobs().await?;

        info!("Lifecycle Phase: Connect Transports");
        self.state = LifecycleState::ConnectTransports;
        for comp in &self.components {
            comp.lock().await.on_start().await?;
        }

        info!("Lifecycle Phase: Ready");
        self.state = LifecycleState::Ready;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        for comp in self.components.iter().rev() {
            if let Err(e) = comp.lock().await.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }

        Ok(())
    }
}

/// Drains the executor on shutdown.
pub struct ExecutorComponent {
    executor: Arc<Executor>,
}

impl ExecutorComponent {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for ExecutorComponent {
    async fn on_shutdown(&mut self) -> Result<()> {
        self.executor.shutdown().await;
        Ok(())
    }
}
