//! Caller callbacks fired on stage notices.

use std::future::Future;
use std::pin::Pin;

pub(crate) type HookFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub(crate) type Hook = Box<dyn FnMut() -> HookFuture + Send>;

/// Optional async callbacks for the `queued` and `processing` stages of one request.
///
/// Hooks are best-effort: an error or panic is logged and never fails the request, and a hook
/// still running when the active timeout expires is abandoned.
#[derive(Default)]
pub struct StageHooks {
    pub(crate) on_queued: Option<Hook>,
    pub(crate) on_processing: Option<Hook>,
}

impl StageHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_queued<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_queued = Some(boxed(hook));
        self
    }

    pub fn on_processing<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_processing = Some(boxed(hook));
        self
    }
}

fn boxed<F, Fut>(mut hook: F) -> Hook
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move || Box::pin(hook()) as HookFuture)
}
