use std::sync::Arc;

use retry_core::RetryEngine;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct ModuleCtx {
    pub engine: Arc<RetryEngine>,
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}
