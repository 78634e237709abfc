//! Periodic autosave of quiz and code editing state.
//!
//! An [`Autosaver`] pushes a `sessionData` snapshot of the watched value
//! every interval for as long as its handle is alive. Delivery is
//! fire-and-forget: nothing is acknowledged, retried or de-duplicated.

use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(5);

/// Wire event name for autosave snapshots.
pub const SESSION_DATA_EVENT: &str = "sessionData";

/// The editing state being watched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum AutosaveData {
    #[serde(rename_all = "camelCase")]
    Code {
        selected_file: String,
        file_content: String,
    },
    #[serde(rename_all = "camelCase")]
    Quiz { current_index: u32, answers: Value },
}

impl AutosaveData {
    /// Nothing worth saving yet.
    pub fn is_empty(&self) -> bool {
        match self {
            AutosaveData::Code { selected_file, .. } => selected_file.is_empty(),
            AutosaveData::Quiz { answers, .. } => answers.is_null(),
        }
    }

    /// Changing identity restarts the interval; content edits do not.
    pub fn identity(&self) -> String {
        match self {
            AutosaveData::Code { selected_file, .. } => format!("code:{}", selected_file),
            AutosaveData::Quiz { .. } => "quiz".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutosaveContext {
    pub user_id: String,
    pub sub_topic_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutosavePayload {
    #[serde(flatten)]
    pub data: AutosaveData,
    /// ISO-8601, millisecond precision, assigned at send time.
    pub timestamp: String,
    pub user_id: String,
    pub sub_topic_id: String,
}

impl AutosavePayload {
    pub fn new(context: &AutosaveContext, data: AutosaveData, at: DateTime<Utc>) -> Self {
        Self {
            data,
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            user_id: context.user_id.clone(),
            sub_topic_id: context.sub_topic_id.clone(),
        }
    }
}

/// Outbound half of a persistent event connection.
pub trait EventSink: Send + Sync {
    /// Hand off an event without waiting for delivery.
    fn emit(&self, event: &str, payload: Value) -> Result<()>;
}

/// Running autosave loop. Dropping the handle stops it.
pub struct Autosaver {
    task: JoinHandle<()>,
}

impl Autosaver {
    pub fn spawn(
        sink: Arc<dyn EventSink>,
        context: AutosaveContext,
        watched: watch::Receiver<Option<AutosaveData>>,
        period: Duration,
    ) -> Self {
        let task = tokio::spawn(run_autosave(sink, context, watched, period));
        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Autosaver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_autosave(
    sink: Arc<dyn EventSink>,
    context: AutosaveContext,
    mut watched: watch::Receiver<Option<AutosaveData>>,
    period: Duration,
) {
    // Wall clock anchored once, advanced by the monotonic clock.
    let wall_start = Utc::now();
    let mono_start = Instant::now();

    let mut identity = watched.borrow_and_update().as_ref().map(AutosaveData::identity);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = watched.borrow().clone();
                let Some(data) = current.filter(|d| !d.is_empty()) else {
                    continue;
                };
                let elapsed = chrono::Duration::from_std(mono_start.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero());
                let payload = AutosavePayload::new(&context, data, wall_start + elapsed);
                let value = match serde_json::to_value(&payload) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode autosave payload");
                        continue;
                    }
                };
                if let Err(e) = sink.emit(SESSION_DATA_EVENT, value) {
                    debug!(error = %e, "Autosave tick dropped");
                }
            }
            changed = watched.changed() => {
                if changed.is_err() {
                    debug!(user_id = %context.user_id, "Autosave source closed");
                    break;
                }
                let next = watched.borrow_and_update().as_ref().map(AutosaveData::identity);
                if next != identity {
                    identity = next;
                    ticker.reset();
                }
            }
        }
    }
}

/// [`EventSink`] over a WebSocket, reconnecting after a fixed delay.
///
/// Frames are `{"event": <name>, "data": <payload>}` text messages. Emits
/// while disconnected or while a previous frame is still in flight fail with
/// [`Error::ChannelUnreachable`].
pub struct WsEventSink {
    tx: mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
}

impl WsEventSink {
    pub fn connect(url: impl Into<String>, reconnect_delay: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1);
        let connected = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_connection(
            url.into(),
            reconnect_delay,
            rx,
            connected.clone(),
        ));
        (Self { tx, connected }, task)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl EventSink for WsEventSink {
    fn emit(&self, event: &str, payload: Value) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ChannelUnreachable("not connected".to_string()));
        }
        let frame = json!({ "event": event, "data": payload }).to_string();
        self.tx
            .try_send(frame)
            .map_err(|e| Error::ChannelUnreachable(e.to_string()))
    }
}

async fn run_connection(
    url: String,
    reconnect_delay: Duration,
    mut rx: mpsc::Receiver<String>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!(url = %url, "Autosave channel connected");
                connected.store(true, Ordering::SeqCst);
                let (mut write, mut read) = ws.split();
                loop {
                    tokio::select! {
                        frame = rx.recv() => match frame {
                            Some(frame) => {
                                if let Err(e) = write.send(Message::Text(frame)).await {
                                    warn!(error = %e, "Autosave send failed");
                                    break;
                                }
                            }
                            None => {
                                let _ = write.close().await;
                                return;
                            }
                        },
                        incoming = read.next() => match incoming {
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                warn!(error = %e, "Autosave channel error");
                                break;
                            }
                            Some(Ok(_)) => {}
                        },
                    }
                }
                connected.store(false, Ordering::SeqCst);
                warn!(url = %url, "Autosave channel disconnected");
            }
            Err(e) => warn!(url = %url, error = %e, "Autosave channel connect failed"),
        }

        let sleep = tokio::time::sleep(reconnect_delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                frame = rx.recv() => {
                    if frame.is_none() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(String, Value)>>,
    }

    impl RecordingSink {
        fn payloads(&self) -> Vec<Value> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(_, v)| v.clone())
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: &str, payload: Value) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push((event.to_string(), payload));
            Ok(())
        }
    }

    fn ctx() -> AutosaveContext {
        AutosaveContext {
            user_id: "u-1".into(),
            sub_topic_id: "st-9".into(),
        }
    }

    fn code(file: &str, content: &str) -> Option<AutosaveData> {
        Some(AutosaveData::Code {
            selected_file: file.into(),
            file_content: content.into(),
        })
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn emits_once_per_interval_with_increasing_timestamps() {
        let sink = Arc::new(RecordingSink::default());
        let (_tx, rx) = watch::channel(code("src/App.jsx", "let a = 1;"));
        let _saver = Autosaver::spawn(sink.clone(), ctx(), rx, AUTOSAVE_INTERVAL);

        advance(26).await;

        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 5);
        let stamps: Vec<DateTime<Utc>> = payloads
            .iter()
            .map(|p| p["timestamp"].as_str().unwrap().parse().unwrap())
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));

        let events = sink.events.lock().unwrap();
        assert!(events.iter().all(|(name, _)| name == SESSION_DATA_EVENT));
    }

    #[tokio::test(start_paused = true)]
    async fn payload_wire_shape() {
        let sink = Arc::new(RecordingSink::default());
        let (_tx, rx) = watch::channel(Some(AutosaveData::Quiz {
            current_index: 2,
            answers: serde_json::json!({"q1": "b"}),
        }));
        let _saver = Autosaver::spawn(sink.clone(), ctx(), rx, AUTOSAVE_INTERVAL);

        advance(6).await;

        let p = &sink.payloads()[0];
        assert_eq!(p["type"], "quiz");
        assert_eq!(p["userId"], "u-1");
        assert_eq!(p["subTopicId"], "st-9");
        assert_eq!(p["data"]["currentIndex"], 2);
        assert_eq!(p["data"]["answers"]["q1"], "b");
        assert!(p["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test(start_paused = true)]
    async fn content_edits_are_read_live_without_resetting() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = watch::channel(code("a.js", "1"));
        let _saver = Autosaver::spawn(sink.clone(), ctx(), rx, AUTOSAVE_INTERVAL);

        advance(7).await;
        tx.send(code("a.js", "2")).unwrap();
        advance(4).await; // t = 11

        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1]["data"]["fileContent"], "2");
    }

    #[tokio::test(start_paused = true)]
    async fn identity_change_restarts_interval() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = watch::channel(code("a.js", "1"));
        let _saver = Autosaver::spawn(sink.clone(), ctx(), rx, AUTOSAVE_INTERVAL);

        advance(7).await;
        assert_eq!(sink.payloads().len(), 1);

        tx.send(code("b.js", "x")).unwrap();
        advance(4).await; // t = 11, old schedule would have fired at 10
        assert_eq!(sink.payloads().len(), 1);

        advance(2).await; // t = 13, fresh interval fired at 12
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1]["data"]["selectedFile"], "b.js");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_state_sends_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = watch::channel(None);
        let _saver = Autosaver::spawn(sink.clone(), ctx(), rx, AUTOSAVE_INTERVAL);

        advance(11).await;
        tx.send(code("", "orphan")).unwrap();
        advance(11).await;
        assert!(sink.payloads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_dropped_or_source_closes() {
        let sink = Arc::new(RecordingSink::default());
        let (_tx, rx) = watch::channel(code("a.js", "1"));
        let saver = Autosaver::spawn(sink.clone(), ctx(), rx, AUTOSAVE_INTERVAL);
        advance(6).await;
        drop(saver);
        advance(30).await;
        assert_eq!(sink.payloads().len(), 1);

        let (tx, rx) = watch::channel(code("a.js", "1"));
        let saver = Autosaver::spawn(sink.clone(), ctx(), rx, AUTOSAVE_INTERVAL);
        drop(tx);
        advance(1).await;
        assert!(saver.is_finished());
    }

    #[tokio::test]
    async fn ws_sink_frames_events() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return text,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected: {:?}", other),
                }
            }
        });

        let (sink, task) = WsEventSink::connect(format!("ws://{}", addr), Duration::from_millis(50));
        while !sink.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sink.emit(SESSION_DATA_EVENT, json!({"type": "code"})).unwrap();

        let frame: Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(frame["event"], "sessionData");
        assert_eq!(frame["data"]["type"], "code");
        task.abort();
    }

    #[tokio::test]
    async fn ws_sink_unreachable_when_nothing_listens() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (sink, task) = WsEventSink::connect(format!("ws://{}", addr), Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sink.is_connected());
        assert!(matches!(
            sink.emit(SESSION_DATA_EVENT, Value::Null),
            Err(Error::ChannelUnreachable(_))
        ));
        task.abort();
    }
}
