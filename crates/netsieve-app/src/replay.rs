//! Replaying captures through the engine and writing verdicts.

use std::io::Write;

use netsieve_core::{Channel, InterceptEngine, VerdictEvent, VerdictSink};
use netsieve_storage::Database;
use tokio::sync::mpsc;

use crate::capture::CaptureEvent;

/// Verdict sink that forwards events to the writer thread.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<VerdictEvent>,
}

impl VerdictSink for ChannelSink {
    fn publish(&self, event: VerdictEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Verdict receiver closed, event dropped");
        }
    }
}

/// Creates a sink and the receiver its events arrive on.
///
/// The receiver yields `None` once every clone of the sink is dropped.
pub fn channel_sink() -> (ChannelSink, mpsc::UnboundedReceiver<VerdictEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink { tx }, rx)
}

/// Totals from one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Byte frames fed to the engine.
    pub frames: usize,
    /// Frames and resolutions the engine asked to abort.
    pub aborted: usize,
    /// DNS resolutions fed to the engine.
    pub resolutions: usize,
    /// Flows closed by the capture.
    pub closed: usize,
    /// Requests still awaiting a response when the capture ended.
    pub unanswered: usize,
}

/// Feeds every capture event to the engine in order.
pub fn replay(
    engine: &InterceptEngine,
    events: impl IntoIterator<Item = CaptureEvent>,
) -> ReplaySummary {
    let mut summary = ReplaySummary::default();

    for event in events {
        match event {
            CaptureEvent::Bytes { flow, side, data } => {
                summary.frames += 1;
                if engine.on_bytes(flow, side, &data).is_abort() {
                    summary.aborted += 1;
                    tracing::info!(flow = %flow, "Engine aborted transfer");
                }
            }
            CaptureEvent::Dns { host, addresses } => {
                summary.resolutions += 1;
                if engine.on_dns_resolution(&host, &addresses, None).is_abort() {
                    summary.aborted += 1;
                    tracing::info!(host = %host, "Engine blocked resolution");
                }
            }
            CaptureEvent::Closed(flow) => {
                summary.closed += 1;
                engine.on_flow_closed(flow);
            }
        }
    }

    summary.unanswered = engine.pending_requests();
    summary
}

/// Totals from the verdict writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Events printed.
    pub written: usize,
    /// Events stored in the verdict log.
    pub logged: usize,
}

/// Drains verdict events, printing each one as a JSON line.
///
/// Only copies published on the `all` channel are written, so every verdict
/// appears once. When a database is given, each written event is also
/// stored in its verdict log; logging failures are reported and skipped.
///
/// Blocks the calling thread until every sink is dropped. Inside a runtime,
/// run it on `tokio::task::spawn_blocking`.
pub fn write_verdicts<W: Write>(
    mut rx: mpsc::UnboundedReceiver<VerdictEvent>,
    db: Option<Database>,
    out: &mut W,
) -> anyhow::Result<WriterStats> {
    let mut stats = WriterStats::default();

    while let Some(event) = rx.blocking_recv() {
        if event.channel != Channel::All {
            continue;
        }

        serde_json::to_writer(&mut *out, &event)?;
        out.write_all(b"\n")?;
        stats.written += 1;

        if let Some(db) = &db {
            match db.log_verdict(&event) {
                Ok(Some(_)) => stats.logged += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to log verdict for {}: {}", event.url, e),
            }
        }
    }

    out.flush()?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use netsieve_core::{
        Classification, EngineConfig, FlowId, MemoryBlobStore, MemoryRuleStore, RuleType, Side,
    };
    use netsieve_storage::NewRule;

    fn bytes(flow: FlowId, side: Side, data: &[u8]) -> CaptureEvent {
        CaptureEvent::Bytes {
            flow,
            side,
            data: data.to_vec(),
        }
    }

    fn session() -> Vec<CaptureEvent> {
        let flow = FlowId::tls(1);
        vec![
            // Fragmented request, then its response.
            bytes(flow, Side::Request, b"GET /index.html HTTP/1.1\r\nHo"),
            bytes(flow, Side::Request, b"st: news.test\r\n\r\n"),
            bytes(
                flow,
                Side::Response,
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi",
            ),
            // Blocked before any response arrives.
            bytes(
                FlowId::tls(2),
                Side::Request,
                b"GET /pixel.gif HTTP/1.1\r\nHost: ads.test\r\n\r\n",
            ),
            CaptureEvent::Dns {
                host: "cdn.ads.test".into(),
                addresses: vec!["10.0.0.1".into()],
            },
            // Never answered.
            bytes(
                FlowId::plain(3),
                Side::Request,
                b"GET / HTTP/1.1\r\nHost: slow.test\r\n\r\n",
            ),
            CaptureEvent::Closed(flow),
        ]
    }

    #[test]
    fn replay_counts_outcomes() {
        let (sink, _rx) = channel_sink();
        let engine = InterceptEngine::new(
            EngineConfig::default(),
            Arc::new(MemoryRuleStore::new().with_rule(RuleType::Domain, "ads.test")),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(sink),
        )
        .unwrap();

        let summary = replay(&engine, session());
        assert_eq!(
            summary,
            ReplaySummary {
                frames: 5,
                aborted: 2,
                resolutions: 1,
                closed: 1,
                unanswered: 1,
            }
        );
    }

    #[test]
    fn writer_prints_and_logs_each_verdict_once() {
        let db = Database::in_memory().unwrap();
        db.add_rule(NewRule::new(RuleType::Domain, "ads.test")).unwrap();

        let (sink, rx) = channel_sink();
        let engine = InterceptEngine::new(
            EngineConfig::default(),
            Arc::new(db.clone()),
            Arc::new(db.clone()),
            Arc::new(sink),
        )
        .unwrap();
        replay(&engine, session());
        drop(engine);

        let mut out = Vec::new();
        let stats = write_verdicts(rx, Some(db.clone()), &mut out).unwrap();
        assert_eq!(stats, WriterStats { written: 3, logged: 3 });

        let lines: Vec<VerdictEvent> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].url, "https://news.test/index.html");
        assert_eq!(lines[0].classification, Classification::Passed);
        assert_eq!(lines[1].classification, Classification::Blocked);
        assert_eq!(lines[2].dns_host.as_deref(), Some("cdn.ads.test"));

        let counts = db.verdict_counts().unwrap();
        assert_eq!(counts.blocked, 2);
        assert_eq!(counts.passed, 1);
    }

    #[test]
    fn writer_without_database_only_prints() {
        let (sink, rx) = channel_sink();
        let engine = InterceptEngine::new(
            EngineConfig::default(),
            Arc::new(MemoryRuleStore::new()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(sink),
        )
        .unwrap();
        engine.on_dns_resolution("example.test", &["10.0.0.2".to_string()], None);
        drop(engine);

        let mut out = Vec::new();
        let stats = write_verdicts(rx, None, &mut out).unwrap();
        assert_eq!(stats, WriterStats { written: 1, logged: 0 });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writer_runs_beside_replay_on_blocking_threads() {
        let db = Database::in_memory().unwrap();
        db.add_rule(NewRule::new(RuleType::Domain, "ads.test")).unwrap();

        let (sink, rx) = channel_sink();
        let engine = InterceptEngine::new(
            EngineConfig::default(),
            Arc::new(db.clone()),
            Arc::new(db.clone()),
            Arc::new(sink),
        )
        .unwrap();

        let replay_task = tokio::task::spawn_blocking(move || replay(&engine, session()));
        let writer_db = db.clone();
        let writer_task = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            write_verdicts(rx, Some(writer_db), &mut out).map(|stats| (stats, out))
        });

        let summary = replay_task.await.unwrap();
        let (stats, out) = writer_task.await.unwrap().unwrap();
        assert_eq!(summary.aborted, 2);
        assert_eq!(stats, WriterStats { written: 3, logged: 3 });
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 3);
    }
}
