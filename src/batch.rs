//! Batch Buffer (C2): per-table in-memory accumulators with size+time flush
//! triggers. Flush is synchronous with respect to the caller — the bus
//! consumer does not read the next message until a triggered flush returns.

use std::time::Instant;

use crate::config::BatchConfig;
use crate::rows::{LogRow, MetricRow, SpanEventRow, SpanLinkRow, SpanRow};
use crate::store::Store;

/// One table's accumulator: a `Vec` plus the clock needed to evaluate the
/// time-based flush trigger independently of the size trigger.
pub struct Buffer<T> {
    rows: Vec<T>,
    last_flush: Instant,
}

impl<T> Buffer<T> {
    fn new() -> Self {
        Self { rows: Vec::new(), last_flush: Instant::now() }
    }

    pub fn push(&mut self, row: T) {
        self.rows.push(row);
    }

    pub fn should_flush(&self, cfg: &BatchConfig) -> bool {
        self.rows.len() >= cfg.batch_size || self.last_flush.elapsed() >= cfg.batch_timeout
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn take(&mut self) -> Vec<T> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.rows)
    }
}

impl<T> Default for Buffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The five analytic-table buffers the ingest loop fills from decoded OTLP
/// batches. Grouped so C4 can flush all touched buffers in one commit
/// window before advancing bus offsets.
#[derive(Default)]
pub struct IngestBuffers {
    pub logs: Buffer<LogRow>,
    pub metrics: Buffer<MetricRow>,
    pub spans: Buffer<SpanRow>,
    pub span_events: Buffer<SpanEventRow>,
    pub span_links: Buffer<SpanLinkRow>,
}

impl IngestBuffers {
    pub fn any_should_flush(&self, cfg: &BatchConfig) -> bool {
        self.logs.should_flush(cfg)
            || self.metrics.should_flush(cfg)
            || self.spans.should_flush(cfg)
            || self.span_events.should_flush(cfg)
            || self.span_links.should_flush(cfg)
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
            && self.metrics.is_empty()
            && self.spans.is_empty()
            && self.span_events.is_empty()
            && self.span_links.is_empty()
    }

    /// Appends every non-empty buffer to the store. Returns `Ok(())` only if
    /// every touched table's append succeeded — the caller must not advance
    /// bus offsets otherwise, per the at-least-once contract.
    pub async fn flush(&mut self, store: &Store) -> anyhow::Result<()> {
        let logs = self.logs.take();
        let metrics = self.metrics.take();
        let spans = self.spans.take();
        let span_events = self.span_events.take();
        let span_links = self.span_links.take();

        store.append("logs", &logs).await?;
        store.append("metrics", &metrics).await?;
        store.append("spans", &spans).await?;
        store.append("span_events", &span_events).await?;
        store.append("span_links", &span_links).await?;

        tracing::debug!(
            "flushed batch: {} logs, {} metrics, {} spans, {} events, {} links",
            logs.len(),
            metrics.len(),
            spans.len(),
            span_events.len(),
            span_links.len(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cfg(batch_size: usize, timeout_secs: f64) -> BatchConfig {
        BatchConfig { batch_size, batch_timeout: Duration::from_secs_f64(timeout_secs) }
    }

    #[test]
    fn flushes_on_size_trigger() {
        let mut buf: Buffer<i32> = Buffer::new();
        let c = cfg(3, 9999.0);
        buf.push(1);
        buf.push(2);
        assert!(!buf.should_flush(&c));
        buf.push(3);
        assert!(buf.should_flush(&c));
    }

    #[test]
    fn flushes_on_time_trigger() {
        let mut buf: Buffer<i32> = Buffer::new();
        let c = cfg(1000, 0.0);
        buf.push(1);
        assert!(buf.should_flush(&c));
    }

    #[test]
    fn take_resets_buffer_and_clock() {
        let mut buf: Buffer<i32> = Buffer::new();
        buf.push(1);
        buf.push(2);
        let taken = buf.take();
        assert_eq!(taken, vec![1, 2]);
        assert!(buf.is_empty());
    }
}
