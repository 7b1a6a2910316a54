//! Pull sink.
//!
//! A sink hands batches to a [`SinkReader`] through an unbounded channel
//! and meters what sits in the channel with a backpressure controller, so
//! a slow reader pauses the producers instead of growing the queue.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use common_error::{RivuletError, RivuletResult};

use crate::backpressure::{BackpressureController, BackpressureOptions, NodeEdge};
use crate::batch::ExecBatch;
use crate::node::{BatchCounter, ExecNode, NodeCaps, NodeCore, NodeId, NodeSpec, validate_input_count};
use crate::plan::{ExecNodeOptions, ExecPlan, downcast_options};

#[derive(Debug)]
enum SinkMessage {
    /// A batch and the amount it was metered at.
    Batch(ExecBatch, u64),
    Error(RivuletError),
}

/// State shared by a sink node and its reader.
#[derive(Debug, Default)]
pub(crate) struct SinkShared {
    schema: OnceLock<SchemaRef>,
    controller: OnceLock<Arc<BackpressureController>>,
}

/// Sending half owned by a sink node.
#[derive(Debug)]
pub(crate) struct SinkOutput {
    shared: Arc<SinkShared>,
    tx: Mutex<Option<mpsc::UnboundedSender<SinkMessage>>>,
}

/// Create a connected sink output and reader.
pub(crate) fn sink_channel() -> (SinkOutput, SinkReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(SinkShared::default());
    let output = SinkOutput {
        shared: Arc::clone(&shared),
        tx: Mutex::new(Some(tx)),
    };
    let reader = SinkReader {
        shared,
        rx,
        done: false,
    };
    (output, reader)
}

impl SinkOutput {
    pub(crate) fn set_schema(&self, schema: SchemaRef) {
        let _ = self.shared.schema.set(schema);
    }

    pub(crate) fn set_controller(&self, controller: Arc<BackpressureController>) {
        let _ = self.shared.controller.set(controller);
    }

    /// Record `batch` as buffered and return the amount it was metered at.
    fn meter(&self, batch: &ExecBatch) -> u64 {
        match self.shared.controller.get() {
            Some(controller) => {
                let amount = controller.options().measure(batch);
                controller.record_added(amount);
                amount
            }
            None => 0,
        }
    }

    /// Send a batch already metered at `amount`.
    fn send_metered(&self, batch: ExecBatch, amount: u64) -> bool {
        let tx = self.tx.lock();
        let Some(sender) = tx.as_ref() else {
            return false;
        };
        sender.send(SinkMessage::Batch(batch, amount)).is_ok()
    }

    /// Meter and send. False once the reader is gone or the output closed.
    pub(crate) fn send(&self, batch: ExecBatch) -> bool {
        let amount = self.meter(&batch);
        self.send_metered(batch, amount)
    }

    /// Meter `batch` on arrival, then send whatever the sequencer releases.
    ///
    /// Batches held back waiting for a missing index stay metered, so a
    /// slow early batch still pauses the producer.
    fn sequence_and_send(&self, sequencer: Option<&mut Sequencer>, batch: ExecBatch) -> bool {
        let amount = self.meter(&batch);
        let ready = match sequencer {
            Some(sequencer) => sequencer.push(batch, amount),
            None => vec![(batch, amount)],
        };
        self.deliver(ready)
    }

    fn deliver(&self, batches: Vec<(ExecBatch, u64)>) -> bool {
        batches
            .into_iter()
            .all(|(batch, amount)| self.send_metered(batch, amount))
    }

    pub(crate) fn send_error(&self, error: RivuletError) {
        if let Some(sender) = self.tx.lock().take() {
            let _ = sender.send(SinkMessage::Error(error));
        }
    }

    /// End the stream; the reader sees the end after draining.
    pub(crate) fn close(&self) {
        self.tx.lock().take();
    }
}

/// Receiving end of a sink.
///
/// Dropping the reader stops the sink, which stops the plan feeding it.
#[derive(Debug)]
pub struct SinkReader {
    shared: Arc<SinkShared>,
    rx: mpsc::UnboundedReceiver<SinkMessage>,
    done: bool,
}

impl SinkReader {
    /// Next batch, or `None` once the sink finished or was stopped.
    ///
    /// An upstream error is returned once; later calls return `None`.
    pub async fn next(&mut self) -> RivuletResult<Option<ExecBatch>> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(SinkMessage::Batch(batch, amount)) => {
                if let Some(controller) = self.shared.controller.get() {
                    controller.record_removed(amount);
                }
                Ok(Some(batch))
            }
            Some(SinkMessage::Error(error)) => {
                self.done = true;
                Err(error)
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    /// Schema of the delivered batches, known once the sink is in a plan.
    pub fn schema(&self) -> Option<SchemaRef> {
        self.shared.schema.get().cloned()
    }

    pub fn into_stream(self) -> BoxStream<'static, RivuletResult<ExecBatch>> {
        futures::stream::unfold(self, |mut reader| async move {
            match reader.next().await {
                Ok(Some(batch)) => Some((Ok(batch), reader)),
                Ok(None) => None,
                Err(e) => Some((Err(e), reader)),
            }
        })
        .boxed()
    }

    /// Drain every batch.
    pub async fn collect(mut self) -> RivuletResult<Vec<ExecBatch>> {
        let mut batches = Vec::new();
        while let Some(batch) = self.next().await? {
            batches.push(batch);
        }
        Ok(batches)
    }

    /// Drain every batch as Arrow record batches.
    pub async fn collect_record_batches(self) -> RivuletResult<Vec<RecordBatch>> {
        let schema = self
            .schema()
            .ok_or_else(|| RivuletError::invalid_state("sink reader is not attached to a plan"))?;
        self.collect()
            .await?
            .iter()
            .map(|batch| batch.to_record_batch(schema.clone()))
            .collect()
    }
}

/// Options for the `sink` factory.
pub struct SinkNodeOptions {
    output: SinkOutput,
    pub backpressure: Option<BackpressureOptions>,
    /// Restore batch index order; defaults to the execution config.
    pub sequence_output: Option<bool>,
}

impl fmt::Debug for SinkNodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkNodeOptions")
            .field("backpressure", &self.backpressure)
            .field("sequence_output", &self.sequence_output)
            .finish_non_exhaustive()
    }
}

impl SinkNodeOptions {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Self, SinkReader) {
        let (output, reader) = sink_channel();
        let options = Self {
            output,
            backpressure: None,
            sequence_output: None,
        };
        (options, reader)
    }

    pub fn with_backpressure(mut self, backpressure: BackpressureOptions) -> Self {
        self.backpressure = Some(backpressure);
        self
    }

    pub fn with_sequence_output(mut self, enabled: bool) -> Self {
        self.sequence_output = Some(enabled);
        self
    }
}

/// Reorders indexed batches; unindexed batches pass straight through.
/// Each batch carries the amount it was metered at.
#[derive(Debug, Default)]
struct Sequencer {
    next: u64,
    pending: BTreeMap<u64, (ExecBatch, u64)>,
}

impl Sequencer {
    fn push(&mut self, batch: ExecBatch, amount: u64) -> Vec<(ExecBatch, u64)> {
        let Some(index) = batch.index else {
            return vec![(batch, amount)];
        };
        self.pending.insert(index, (batch, amount));
        let mut ready = Vec::new();
        while let Some(entry) = self.pending.remove(&self.next) {
            ready.push(entry);
            self.next += 1;
        }
        ready
    }

    /// Whatever is left, in index order.
    fn flush(&mut self) -> Vec<(ExecBatch, u64)> {
        std::mem::take(&mut self.pending).into_values().collect()
    }
}

#[derive(Debug)]
pub struct SinkNode {
    core: NodeCore,
    output: SinkOutput,
    /// Held while sequencing and sending, so delivery order is send order.
    sequencer: Mutex<Option<Sequencer>>,
    counter: BatchCounter,
}

impl SinkNode {
    fn finish(&self) {
        let delivered = {
            let mut sequencer = self.sequencer.lock();
            let rest = sequencer.as_mut().map(Sequencer::flush).unwrap_or_default();
            self.output.deliver(rest)
        };
        if !delivered {
            log::debug!("{} reader dropped before the end of input", self.core.label());
        }
        self.output.close();
        self.core.mark_output_done();
    }
}

impl ExecNode for SinkNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn caps(&self) -> NodeCaps {
        NodeCaps::streaming()
    }

    fn input_received(self: Arc<Self>, _input: NodeId, batch: ExecBatch) {
        if self.core.is_halted() {
            return;
        }
        self.core.record_input(batch.num_rows());
        let delivered = {
            let mut sequencer = self.sequencer.lock();
            self.output.sequence_and_send(sequencer.as_mut(), batch)
        };
        if !delivered {
            log::debug!("{} reader dropped; stopping", self.core.label());
            self.stop_producing();
            return;
        }
        if self.counter.increment() {
            self.finish();
        }
    }

    fn input_finished(self: Arc<Self>, _input: NodeId, total: u64) {
        if self.counter.set_total(total) {
            self.finish();
        }
    }

    fn error_received(&self, _input: NodeId, error: RivuletError) {
        self.output.send_error(error.clone());
        self.core.fail(error);
    }

    fn task_failed(&self, error: RivuletError) {
        self.output.send_error(error.clone());
        self.core.fail(error);
    }

    fn stop_producing(&self) {
        self.core.stop();
        self.output.close();
    }
}

/// Factory for `sink`.
pub fn make(
    plan: &ExecPlan,
    inputs: Vec<NodeId>,
    options: Box<dyn ExecNodeOptions>,
) -> RivuletResult<NodeId> {
    validate_input_count("sink", &inputs, 1)?;
    let options = downcast_options::<SinkNodeOptions>(options, "sink")?;
    let input = inputs[0];
    let schema = plan.output_schema(input)?;
    let ctx = plan.context();
    let backpressure = match options.backpressure {
        Some(backpressure) => backpressure,
        None => BackpressureOptions::from_config(&ctx.config().backpressure)?,
    };
    let sequence = options
        .sequence_output
        .unwrap_or(ctx.config().execution.sequence_output);

    let output = options.output;
    output.set_schema(schema.clone());
    let spec = NodeSpec::sink("sink", inputs, schema);
    plan.add_node(spec, |core| {
        let edge = NodeEdge::new(core.plan().clone(), input, core.id());
        output.set_controller(Arc::new(BackpressureController::new(
            backpressure,
            Arc::new(edge),
        )));
        Ok(SinkNode {
            core,
            output,
            sequencer: Mutex::new(sequence.then(Sequencer::default)),
            counter: BatchCounter::new(),
        })
    })
}
