// batching/adaptive.rs
//! Pull-based batchers whose batch size tracks a target measurement
//!
//! The size of every batch after the first is derived from the previous one:
//!
//! ```text
//! beta     = clamp(target / measured, 1 / max_beta, max_beta)
//! new_size = clamp(round(last_size * beta), min_size, max_size)
//! ```

use std::iter::Peekable;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::error::{Result, SampleDbError};

/// Proportional batch-size controller
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSizer {
    target: f64,
    init_size: usize,
    min_size: usize,
    max_size: usize,
    max_beta: f64,
    last_size: Option<usize>,
}

impl BatchSizer {
    /// Controller for `target` using the adaptive bounds of `config`
    pub fn new(target: f64, config: &EngineConfig) -> Self {
        BatchSizer::with_bounds(
            target,
            config.adaptive_init_size,
            config.adaptive_min_size,
            config.adaptive_max_size,
            config.adaptive_max_beta,
        )
    }

    pub fn with_bounds(target: f64, init_size: usize, min_size: usize, max_size: usize, max_beta: f64) -> Self {
        let min_size = min_size.max(1);
        let max_size = max_size.max(min_size);
        BatchSizer {
            target,
            init_size: init_size.clamp(min_size, max_size),
            min_size,
            max_size,
            max_beta: if max_beta.is_finite() && max_beta > 1.0 { max_beta } else { 1.0 },
            last_size: None,
        }
    }

    pub fn last_size(&self) -> Option<usize> {
        self.last_size
    }

    /// Size of the next batch given the measurement of the previous one
    ///
    /// The first call returns the initial size. A missing measurement keeps
    /// the previous size.
    pub fn next_size(&mut self, measured: Option<f64>) -> usize {
        let size = match (self.last_size, measured) {
            (None, _) => self.init_size,
            (Some(last), None) => last,
            (Some(last), Some(measured)) => {
                let beta = if measured > 0.0 && measured.is_finite() {
                    self.target / measured
                } else {
                    self.max_beta
                };
                let beta = beta.clamp(1.0 / self.max_beta, self.max_beta);
                let scaled = (last as f64 * beta).round();
                (scaled as usize).clamp(self.min_size, self.max_size)
            }
        };
        self.last_size = Some(size);
        size
    }
}

fn take_batch<I: Iterator>(items: &mut Peekable<I>, size: usize) -> Option<Vec<I::Item>> {
    items.peek()?;
    Some(items.by_ref().take(size).collect())
}

/// Fixed-size batches
pub struct StaticBatcher<I: Iterator> {
    items: Peekable<I>,
    batch_size: usize,
}

impl<I: Iterator> StaticBatcher<I> {
    pub fn new(items: I, batch_size: usize) -> Self {
        StaticBatcher {
            items: items.peekable(),
            batch_size: batch_size.max(1),
        }
    }
}

impl<I: Iterator> Iterator for StaticBatcher<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        take_batch(&mut self.items, self.batch_size)
    }
}

/// Batches sized so the caller spends about `target` seconds on each
///
/// The measurement is the wall-clock time between consecutive `next()`
/// calls, i.e. the time the caller took to process the previous batch.
pub struct LatencyBatcher<I: Iterator> {
    items: Peekable<I>,
    sizer: BatchSizer,
    last_call: Option<Instant>,
}

impl<I: Iterator> LatencyBatcher<I> {
    pub fn new(items: I, sizer: BatchSizer) -> Self {
        LatencyBatcher {
            items: items.peekable(),
            sizer,
            last_call: None,
        }
    }

    pub fn sizer(&self) -> &BatchSizer {
        &self.sizer
    }
}

impl<I: Iterator> Iterator for LatencyBatcher<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let now = Instant::now();
        let measured = self.last_call.map(|t| now.duration_since(t).as_secs_f64());
        self.last_call = Some(now);
        self.items.peek()?;
        let size = self.sizer.next_size(measured);
        take_batch(&mut self.items, size)
    }
}

/// Batches sized so each holds about `target` bytes of content
///
/// After consuming a batch the caller must report its size through
/// [`register_backpressure`](Self::register_backpressure) before asking for
/// the next one; otherwise `next()` yields
/// [`SampleDbError::BackpressureContractViolation`].
pub struct ContentSizeBatcher<I: Iterator> {
    items: Peekable<I>,
    sizer: BatchSizer,
    awaiting_feedback: bool,
    measured: Option<f64>,
}

impl<I: Iterator> ContentSizeBatcher<I> {
    pub fn new(items: I, sizer: BatchSizer) -> Self {
        ContentSizeBatcher {
            items: items.peekable(),
            sizer,
            awaiting_feedback: false,
            measured: None,
        }
    }

    /// Report the content size of the batch just consumed
    pub fn register_backpressure(&mut self, bytes: usize) {
        self.measured = Some(bytes as f64);
        self.awaiting_feedback = false;
    }

    pub fn sizer(&self) -> &BatchSizer {
        &self.sizer
    }
}

impl<I: Iterator> Iterator for ContentSizeBatcher<I> {
    type Item = Result<Vec<I::Item>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.awaiting_feedback {
            return Some(Err(SampleDbError::BackpressureContractViolation));
        }
        self.items.peek()?;
        let size = self.sizer.next_size(self.measured.take());
        let batch = take_batch(&mut self.items, size)?;
        self.awaiting_feedback = true;
        Some(Ok(batch))
    }
}

/// Which measurement drives [`adaptive_batches`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// Fixed batches of the given size; the target is ignored
    Static(usize),
    /// Target is seconds of caller processing per batch
    Latency,
    /// Target is bytes per batch, reported via `register_backpressure`
    ContentSize,
}

/// Batcher chosen at runtime by [`adaptive_batches`]
pub enum Batches<I: Iterator> {
    Static(StaticBatcher<I>),
    Latency(LatencyBatcher<I>),
    ContentSize(ContentSizeBatcher<I>),
}

impl<I: Iterator> Batches<I> {
    /// Report the content size of the last batch (content-size batchers only)
    pub fn register_backpressure(&mut self, bytes: usize) {
        if let Batches::ContentSize(batcher) = self {
            batcher.register_backpressure(bytes);
        }
    }
}

impl<I: Iterator> Iterator for Batches<I> {
    type Item = Result<Vec<I::Item>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Batches::Static(b) => b.next().map(Ok),
            Batches::Latency(b) => b.next().map(Ok),
            Batches::ContentSize(b) => b.next(),
        }
    }
}

/// Slice `items` into batches following `target` for the given `kind`
///
/// # Examples
///
/// ```rust
/// use sampledb_core::batching::{adaptive_batches, BatchKind};
/// use sampledb_core::EngineConfig;
///
/// let config = EngineConfig::default().with_adaptive_bounds(2, 1, 100);
/// let mut batches = adaptive_batches(0..10, 64.0, BatchKind::ContentSize, &config);
///
/// let first = batches.next().unwrap().unwrap();
/// assert_eq!(first, vec![0, 1]);
///
/// // 16 bytes for 2 items: the next batch doubles
/// batches.register_backpressure(16);
/// let second = batches.next().unwrap().unwrap();
/// assert_eq!(second.len(), 4);
/// ```
pub fn adaptive_batches<T>(items: T, target: f64, kind: BatchKind, config: &EngineConfig) -> Batches<T::IntoIter>
where
    T: IntoIterator,
{
    let items = items.into_iter();
    match kind {
        BatchKind::Static(size) => Batches::Static(StaticBatcher::new(items, size)),
        BatchKind::Latency => Batches::Latency(LatencyBatcher::new(items, BatchSizer::new(target, config))),
        BatchKind::ContentSize => {
            Batches::ContentSize(ContentSizeBatcher::new(items, BatchSizer::new(target, config)))
        }
    }
}
