//! Paced emission of output a pipeline breaker has already computed.

use std::collections::VecDeque;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;

use crate::backpressure::PauseSet;
use crate::batch::ExecBatch;
use crate::node::{ExecNode, NodeId};

#[derive(Debug, Default)]
struct ChunkedState {
    pauses: PauseSet,
    chunks: VecDeque<RecordBatch>,
    loaded: bool,
    scheduled: bool,
    finished: bool,
}

/// Emits a finished result one `batch_size` chunk per task.
///
/// Downstream pauses are recorded here; while any holds, no further chunk
/// is scheduled and a resume picks up at the next chunk. The batch total
/// is announced right after the last chunk. At most one emit task runs at
/// a time.
#[derive(Debug, Default)]
pub(crate) struct ChunkedOutput {
    state: Mutex<ChunkedState>,
}

impl ChunkedOutput {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue `batches` split into chunks of at most `batch_size` rows and
    /// start emitting on behalf of `node`.
    pub(crate) fn load(
        self: &Arc<Self>,
        node: Arc<dyn ExecNode>,
        batches: Vec<RecordBatch>,
        batch_size: usize,
    ) {
        let batch_size = batch_size.max(1);
        {
            let mut state = self.state.lock();
            for batch in batches {
                let mut offset = 0;
                while offset < batch.num_rows() {
                    let len = batch_size.min(batch.num_rows() - offset);
                    state.chunks.push_back(batch.slice(offset, len));
                    offset += len;
                }
            }
            log::trace!(
                "{} holding {} output chunks",
                node.core().label(),
                state.chunks.len()
            );
            state.loaded = true;
        }
        self.schedule(node);
    }

    /// Apply a downstream pause. Returns whether any pause now holds.
    pub(crate) fn pause(&self, requester: NodeId, counter: u64) -> bool {
        let mut state = self.state.lock();
        state.pauses.pause(requester, counter);
        state.pauses.is_paused()
    }

    /// Apply a downstream resume and continue emitting if nothing else
    /// holds a pause. Returns whether any pause still holds.
    pub(crate) fn resume(
        self: &Arc<Self>,
        node: Arc<dyn ExecNode>,
        requester: NodeId,
        counter: u64,
    ) -> bool {
        let paused = {
            let mut state = self.state.lock();
            state.pauses.resume(requester, counter);
            state.pauses.is_paused()
        };
        if !paused {
            self.schedule(node);
        }
        paused
    }

    /// Drop whatever is left; used on stop.
    pub(crate) fn clear(&self) {
        self.state.lock().chunks.clear();
    }

    fn schedule(self: &Arc<Self>, node: Arc<dyn ExecNode>) {
        {
            let mut state = self.state.lock();
            if !state.loaded || state.scheduled || state.finished || state.pauses.is_paused() {
                return;
            }
            state.scheduled = true;
        }
        let output = Arc::clone(self);
        let owner = Arc::clone(&node);
        owner.core().spawn(Arc::clone(&node), "emit-output", async move {
            output.emit_next(node);
            Ok(())
        });
    }

    fn emit_next(self: &Arc<Self>, node: Arc<dyn ExecNode>) {
        let core = node.core();
        let chunk = {
            let mut state = self.state.lock();
            if core.is_halted() {
                state.chunks.clear();
                state.scheduled = false;
                return;
            }
            state.chunks.pop_front()
        };
        if let Some(chunk) = chunk {
            core.emit(ExecBatch::from_record_batch(&chunk));
        }
        let done = {
            let mut state = self.state.lock();
            state.scheduled = false;
            state.finished = state.chunks.is_empty();
            state.finished
        };
        if done {
            core.finish_output(core.emitted_batches());
        } else {
            self.schedule(node);
        }
    }
}
