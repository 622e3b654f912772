//! Streaming input pipeline
//!
//! ```text
//! ShardStream ─┬─ reader (blocking) ─┐
//!              ├─ reader (blocking) ─┼─ round-robin interleave ─ cache ─ assembler ─ prefetch ─▶ consumer
//!              └─ reader (blocking) ─┘
//! ```
//!
//! Each reader decodes and filters its own shard and queues at most
//! `read_ahead` examples. The interleaver pulls one example per shard in a
//! fixed rotation, so output order depends only on shard order. The prefetch
//! channel holds at most `prefetch_batches` batches; producers wait when it
//! is full.

use crate::config::{Concurrency, DataConfig, RecordLayout};
use crate::data::batch::{Batch, BatchAssembler};
use crate::data::cache::ShuffleBuffer;
use crate::data::decode::{DecodedExample, OutputMode, RecordDecoder};
use crate::data::error::DataError;
use crate::data::filter::ValidityFilter;
use crate::data::record::ShardReader;
use crate::data::shards::{ShardLocator, ShardStream, Split};
use crate::training::phase::PhaseConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub mode: OutputMode,
    pub layout: RecordLayout,
    pub batch_size: usize,
    /// Shuffle cache size, training only; 0 or 1 disables the cache
    pub cache_size: usize,
    pub replacement_rate: usize,
    pub cycle_length: Concurrency,
    pub prefetch_batches: Concurrency,
    pub read_ahead: usize,
    pub read_buffer_bytes: usize,
    pub use_bf16: bool,
    pub seed: u64,
}

impl FeedOptions {
    /// Training feed for one phase.
    pub fn for_phase(data: &DataConfig, phase: &PhaseConfig, seed: u64) -> Self {
        Self {
            mode: OutputMode::Train,
            layout: data.layout(),
            batch_size: phase.batch_size,
            cache_size: phase.cache_size,
            replacement_rate: phase.replacement_rate,
            cycle_length: data.cycle_length,
            prefetch_batches: data.prefetch_batches,
            read_ahead: data.read_ahead,
            read_buffer_bytes: data.read_buffer_bytes,
            use_bf16: data.use_bf16,
            seed,
        }
    }

    /// Deterministic single pass over the evaluation split.
    pub fn for_eval(data: &DataConfig, batch_size: usize) -> Self {
        Self {
            mode: OutputMode::Eval,
            layout: data.layout(),
            batch_size,
            cache_size: 0,
            replacement_rate: 0,
            cycle_length: Concurrency::Fixed(1),
            prefetch_batches: data.prefetch_batches,
            read_ahead: data.read_ahead,
            read_buffer_bytes: data.read_buffer_bytes,
            use_bf16: data.use_bf16,
            seed: 0,
        }
    }

    pub fn with_mode(mut self, mode: OutputMode) -> Self {
        self.mode = mode;
        self
    }

    fn split(&self) -> Split {
        if self.mode.is_training() {
            Split::Train
        } else {
            Split::Eval
        }
    }

    fn cycle_length(&self) -> usize {
        if self.mode.is_training() {
            self.cycle_length.resolve()
        } else {
            1
        }
    }

    fn prefetch_depth(&self) -> usize {
        match self.prefetch_batches {
            Concurrency::Auto => self.prefetch_batches.resolve().clamp(2, 8),
            fixed => fixed.resolve(),
        }
    }
}

/// Counters for one pipeline lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub shards_opened: usize,
    pub shards_failed: usize,
    pub records_read: usize,
    pub malformed: usize,
    pub rejected: usize,
    /// Valid examples handed to batching
    pub examples: usize,
    pub batches: usize,
    /// Trailing examples that did not fill a batch
    pub dropped_remainder: usize,
}

impl PipelineStats {
    fn absorb(&mut self, report: &ShardReport) {
        self.records_read += report.records;
        self.malformed += report.malformed;
        self.rejected += report.rejected;
        if report.failed {
            self.shards_failed += 1;
        }
    }
}

pub struct FeedPipeline {
    batches: mpsc::Receiver<Batch>,
    stop: Arc<AtomicBool>,
    driver: Option<JoinHandle<Result<PipelineStats, DataError>>>,
    batch_size: usize,
    mode: OutputMode,
}

impl FeedPipeline {
    /// Locate shards and start reading. Must be called inside a tokio runtime.
    pub fn start(locator: &ShardLocator, options: FeedOptions) -> Result<Self, DataError> {
        let shards = locator.stream(options.split())?;
        let cycle_length = options.cycle_length();
        let depth = options.prefetch_depth();
        let stop = Arc::new(AtomicBool::new(false));

        tracing::info!(
            mode = ?options.mode,
            shards = shards.shard_count(),
            batch_size = options.batch_size,
            cycle_length,
            prefetch = depth,
            "starting input pipeline"
        );

        let context = Arc::new(ReaderContext {
            decoder: RecordDecoder::new(options.layout, options.use_bf16),
            filter: ValidityFilter::new(),
            read_ahead: options.read_ahead.max(1),
            buffer_bytes: options.read_buffer_bytes,
            stop: stop.clone(),
        });
        let cache = (options.mode.is_training() && options.cache_size > 1).then(|| {
            ShuffleBuffer::new(options.cache_size, options.replacement_rate, options.seed)
        });

        let (tx, rx) = mpsc::channel(depth);
        let driver = Driver {
            shards,
            cycle_length,
            context,
            cache,
            assembler: Some(BatchAssembler::new(options.batch_size, options.mode)),
            tx,
            slots: Vec::with_capacity(cycle_length),
            stats: PipelineStats::default(),
        };

        Ok(Self {
            batches: rx,
            stop,
            driver: Some(tokio::spawn(driver.run())),
            batch_size: options.batch_size,
            mode: options.mode,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Next batch; `None` once the stream has ended or failed.
    pub async fn next_batch(&mut self) -> Option<Batch> {
        self.batches.recv().await
    }

    /// Stop producing, discard queued batches and join every worker.
    pub async fn shutdown(mut self) -> Result<PipelineStats, DataError> {
        self.stop.store(true, Ordering::Relaxed);
        self.batches.close();
        while self.batches.try_recv().is_ok() {}

        match self.driver.take() {
            Some(handle) => handle
                .await
                .map_err(|e| DataError::Pipeline(format!("pipeline driver panicked: {}", e)))?,
            None => Ok(PipelineStats::default()),
        }
    }
}

impl Drop for FeedPipeline {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

struct ReaderContext {
    decoder: RecordDecoder,
    filter: ValidityFilter,
    read_ahead: usize,
    buffer_bytes: usize,
    stop: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct ShardReport {
    records: usize,
    malformed: usize,
    rejected: usize,
    failed: bool,
}

struct ShardSlot {
    path: PathBuf,
    examples: mpsc::Receiver<DecodedExample>,
    reader: JoinHandle<ShardReport>,
    delivered: usize,
}

impl ShardSlot {
    fn open(path: PathBuf, context: &Arc<ReaderContext>) -> Self {
        let (tx, rx) = mpsc::channel(context.read_ahead);
        let ctx = context.clone();
        let reader_path = path.clone();
        let reader = tokio::task::spawn_blocking(move || read_shard(&reader_path, &ctx, tx));
        Self {
            path,
            examples: rx,
            reader,
            delivered: 0,
        }
    }

    async fn join(self) -> ShardReport {
        let ShardSlot {
            path,
            examples,
            reader,
            ..
        } = self;
        // Closing the queue unblocks a reader waiting to send.
        drop(examples);
        match reader.await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(shard = %path.display(), error = %e, "shard reader panicked");
                ShardReport {
                    failed: true,
                    ..Default::default()
                }
            }
        }
    }
}

/// Decode and filter one shard on a blocking thread.
fn read_shard(path: &Path, ctx: &ReaderContext, tx: mpsc::Sender<DecodedExample>) -> ShardReport {
    let mut report = ShardReport::default();
    let mut reader = match ShardReader::open(path, ctx.buffer_bytes) {
        Ok(reader) => reader,
        Err(e) => {
            tracing::warn!(error = %e, "skipping shard");
            report.failed = true;
            return report;
        }
    };

    while !ctx.stop.load(Ordering::Relaxed) {
        let payload = match reader.next_payload() {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, records = report.records, "abandoning rest of shard");
                report.failed = true;
                break;
            }
        };
        report.records += 1;

        let example = match ctx.decoder.decode_payload_f32(&payload) {
            Ok(example) => example,
            Err(e) => {
                report.malformed += 1;
                tracing::warn!(
                    shard = %path.display(),
                    record = report.records - 1,
                    error = %e,
                    "dropping malformed record"
                );
                continue;
            }
        };

        let verdict = ctx.filter.check(&example);
        if !verdict.keep {
            report.rejected += 1;
            if let Some(diag) = verdict.diagnostic {
                tracing::debug!(
                    shard = %path.display(),
                    tensor = diag.tensor,
                    first_index = diag.first_index,
                    nan = diag.nan_count,
                    inf = diag.inf_count,
                    filename_id = diag.filename_id,
                    sample_id = diag.sample_id,
                    "rejecting non-finite example"
                );
            }
            continue;
        }

        // Checked at full precision; large finite values may round to
        // infinity once narrowed.
        if tx.blocking_send(ctx.decoder.narrow(example)).is_err() {
            break;
        }
    }
    report
}

struct Driver {
    shards: ShardStream,
    cycle_length: usize,
    context: Arc<ReaderContext>,
    cache: Option<ShuffleBuffer>,
    assembler: Option<BatchAssembler>,
    tx: mpsc::Sender<Batch>,
    slots: Vec<ShardSlot>,
    stats: PipelineStats,
}

enum Flow {
    Continue,
    ConsumerGone,
}

impl Driver {
    async fn run(mut self) -> Result<PipelineStats, DataError> {
        let result = self.pump().await;
        for slot in std::mem::take(&mut self.slots) {
            let report = slot.join().await;
            self.stats.absorb(&report);
        }
        result?;

        tracing::info!(
            records = self.stats.records_read,
            malformed = self.stats.malformed,
            rejected = self.stats.rejected,
            batches = self.stats.batches,
            dropped = self.stats.dropped_remainder,
            "input pipeline finished"
        );
        Ok(self.stats)
    }

    fn open_next(&mut self, at: usize) -> bool {
        match self.shards.next() {
            Some(path) => {
                tracing::debug!(shard = %path.display(), "opening shard");
                self.slots.insert(at, ShardSlot::open(path, &self.context));
                self.stats.shards_opened += 1;
                true
            }
            None => false,
        }
    }

    async fn pump(&mut self) -> Result<(), DataError> {
        for i in 0..self.cycle_length {
            if !self.open_next(i) {
                break;
            }
        }

        let mut cursor = 0;
        let mut empty_streak = 0;
        while !self.slots.is_empty() {
            if self.context.stop.load(Ordering::Relaxed) {
                return Ok(());
            }
            if cursor >= self.slots.len() {
                cursor = 0;
            }

            match self.slots[cursor].examples.recv().await {
                Some(example) => {
                    self.slots[cursor].delivered += 1;
                    cursor += 1;
                    empty_streak = 0;
                    self.stats.examples += 1;
                    if let Flow::ConsumerGone = self.accept(example).await? {
                        return Ok(());
                    }
                }
                None => {
                    let finished = self.slots.remove(cursor);
                    if finished.delivered == 0 {
                        empty_streak += 1;
                    }
                    let report = finished.join().await;
                    self.stats.absorb(&report);

                    // The training stream repeats forever; a full rotation of
                    // shards without one valid example would spin.
                    if empty_streak > self.shards.shard_count() {
                        return Err(DataError::Pipeline(
                            "no shard produced a valid example".to_string(),
                        ));
                    }
                    self.open_next(cursor);
                }
            }
        }

        if let Some(cache) = self.cache.as_mut() {
            for example in cache.drain() {
                if let Flow::ConsumerGone = self.assemble(example).await? {
                    return Ok(());
                }
            }
        }
        if let Some(assembler) = self.assembler.take() {
            self.stats.dropped_remainder = assembler.finish();
        }
        Ok(())
    }

    async fn accept(&mut self, example: DecodedExample) -> Result<Flow, DataError> {
        let ready = match self.cache.as_mut() {
            Some(cache) => cache.push(example),
            None => vec![example],
        };
        for example in ready {
            if let Flow::ConsumerGone = self.assemble(example).await? {
                return Ok(Flow::ConsumerGone);
            }
        }
        Ok(Flow::Continue)
    }

    async fn assemble(&mut self, example: DecodedExample) -> Result<Flow, DataError> {
        let Some(assembler) = self.assembler.as_mut() else {
            return Ok(Flow::Continue);
        };
        if let Some(batch) = assembler.push(example)? {
            if self.tx.send(batch).await.is_err() {
                return Ok(Flow::ConsumerGone);
            }
            self.stats.batches += 1;
        }
        Ok(Flow::Continue)
    }
}
