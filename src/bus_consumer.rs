//! Bus Consumer (C4): subscribes to the three OTLP topics, dispatches each
//! message to the decoder, fills the batch buffers, and drives flush
//! cadence. The `kafka` crate's consumer is blocking, so the whole ingest
//! loop runs on a dedicated blocking thread; store flushes bridge back into
//! the async `Store` via the caller's tokio handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kafka::consumer::{Consumer, FetchOffset};

use crate::batch::IngestBuffers;
use crate::config::Config;
use crate::otlp;
use crate::store::Store;

/// Shared shutdown flag; `Ctrl-C` in `main` flips this, the blocking poll
/// loop notices it at its next iteration (bounded by `fetch_max_wait_time`).
pub type Shutdown = Arc<AtomicBool>;

/// Runs the ingest loop to completion (or until `shutdown` is set). Intended
/// to be driven via `tokio::task::spawn_blocking`.
pub fn run(cfg: Config, store: Arc<Store>, shutdown: Shutdown, rt: tokio::runtime::Handle) -> anyhow::Result<()> {
    let mut consumer = Consumer::from_hosts(cfg.bus.bootstrap_servers.clone())
        .with_group(cfg.bus.group_id.clone())
        .with_fallback_offset(FetchOffset::Latest)
        .with_fetch_max_wait_time(Duration::from_millis(500))
        .with_topic(cfg.bus.logs_topic.clone())
        .with_topic(cfg.bus.traces_topic.clone())
        .with_topic(cfg.bus.metrics_topic.clone())
        .create()?;

    let mut buffers = IngestBuffers::default();

    while !shutdown.load(Ordering::Relaxed) {
        let message_sets = match consumer.poll() {
            Ok(ms) => ms,
            Err(e) => {
                tracing::warn!("bus poll error, skipping this tick: {e}");
                continue;
            }
        };

        if message_sets.is_empty() {
            if buffers.any_should_flush(&cfg.batch) && !buffers.is_empty()
                && let Err(e) = rt.block_on(buffers.flush(&store)) {
                    tracing::error!("flush failed on idle tick, will retry next cycle: {e}");
                    continue;
                }
            continue;
        }

        for ms in message_sets.iter() {
            let topic = ms.topic().to_string();
            for message in ms.messages() {
                dispatch(&cfg, &mut buffers, &topic, message.value);
            }
            if let Err(e) = consumer.consume_messageset(ms) {
                tracing::warn!("failed to mark messageset consumed: {e}");
            }
        }

        if buffers.any_should_flush(&cfg.batch) {
            match rt.block_on(buffers.flush(&store)) {
                Ok(()) => {
                    if let Err(e) = consumer.commit_consumed() {
                        tracing::warn!("commit_consumed failed after successful flush: {e}");
                    }
                }
                Err(e) => {
                    tracing::error!("store flush failed, offsets not committed, will retry: {e}");
                }
            }
        }
    }

    if !buffers.is_empty() {
        tracing::info!("shutdown: draining remaining buffers");
        if rt.block_on(buffers.flush(&store)).is_ok() {
            let _ = consumer.commit_consumed();
        }
    }

    Ok(())
}

fn dispatch(cfg: &Config, buffers: &mut IngestBuffers, topic: &str, raw: &[u8]) {
    let value: serde_json::Value = match serde_json::from_slice(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("skipping malformed message on {topic}: {e}");
            return;
        }
    };

    if topic == cfg.bus.logs_topic {
        for log in otlp::decode_logs(&value) {
            buffers.logs.push(log);
        }
    } else if topic == cfg.bus.traces_topic {
        for decoded in otlp::decode_traces(&value) {
            buffers.spans.push(decoded.span);
            for event in decoded.events {
                buffers.span_events.push(event);
            }
            for link in decoded.links {
                buffers.span_links.push(link);
            }
        }
    } else if topic == cfg.bus.metrics_topic {
        for metric in otlp::decode_metrics(&value) {
            buffers.metrics.push(metric);
        }
    } else {
        tracing::warn!("message on unrecognized topic {topic}, dropping");
    }
}
