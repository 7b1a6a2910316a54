//! One-shot completion signals for nodes and plans.

use std::future::IntoFuture;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;

use common_error::{RivuletError, RivuletResult};

type Slot = Option<RivuletResult<()>>;

/// Write side of a [`Completion`]; resolves at most once.
#[derive(Debug)]
pub struct CompletionSource {
    tx: watch::Sender<Slot>,
}

impl Default for CompletionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSource {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Resolve with `result`. Returns false if already resolved.
    pub fn resolve(&self, result: RivuletResult<()>) -> bool {
        let mut result = Some(result);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = result.take();
            true
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn completion(&self) -> Completion {
        Completion {
            rx: self.tx.subscribe(),
        }
    }
}

/// Resolves once with the outcome of a node or plan.
///
/// Cloning is cheap; every clone observes the same result. Awaiting a
/// `Completion` directly is the same as calling [`Completion::wait`].
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<Slot>,
}

impl Completion {
    /// An already-resolved completion.
    pub fn ready(result: RivuletResult<()>) -> Self {
        let source = CompletionSource::new();
        source.resolve(result);
        source.completion()
    }

    pub async fn wait(&self) -> RivuletResult<()> {
        let mut rx = self.rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone().unwrap_or(Ok(())),
            Err(_) => Err(RivuletError::internal(
                "completion source dropped before resolving",
            )),
        }
    }

    /// The result, if already resolved.
    pub fn try_result(&self) -> Option<RivuletResult<()>> {
        self.rx.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for every completion. Ok only if all succeed; otherwise the
    /// error that resolved first.
    pub async fn all(completions: Vec<Completion>) -> RivuletResult<()> {
        let mut pending: FuturesUnordered<_> = completions
            .into_iter()
            .map(|c| async move { c.wait().await })
            .collect();
        let mut first_error = None;
        while let Some(result) = pending.next().await {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl IntoFuture for Completion {
    type Output = RivuletResult<()>;
    type IntoFuture = BoxFuture<'static, RivuletResult<()>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}
