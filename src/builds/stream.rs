//! Log stream relay: forwards a build's growing log over a WebSocket.
//!
//! The relay polls the store on a fixed interval and pushes only the bytes it
//! has not sent yet, so the concatenation of everything a subscriber receives
//! is exactly the log growth during the session.

use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::future;
use futures_util::{Sink, SinkExt, Stream, StreamExt};

use super::api::SharedState;
use super::db::DbHandle;
use crate::errors::BuildError;

/// When the relay closes on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayPolicy {
    /// Close after delivering the final increment of a terminal build.
    #[default]
    CloseOnTerminal,
    /// Keep polling until the subscriber disconnects.
    UntilDisconnect,
}

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub interval: Duration,
    pub policy: RelayPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            policy: RelayPolicy::CloseOnTerminal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connected,
    Polling,
    Delivering,
    Closed,
}

pub struct LogRelay {
    db: DbHandle,
    app: String,
    id: String,
    config: RelayConfig,
    sent: usize,
    state: RelayState,
}

impl LogRelay {
    pub fn new(db: DbHandle, app: String, id: String, config: RelayConfig) -> Self {
        Self {
            db,
            app,
            id,
            config,
            sent: 0,
            state: RelayState::Connected,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Bytes of the log already delivered.
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Drive the relay until it closes. A fetch failure is reported in-band as
    /// `error: <detail>` before closing; a failed send closes silently.
    pub async fn run<S>(&mut self, sink: &mut S) -> Result<(), BuildError>
    where
        S: Sink<String> + Unpin,
        S::Error: std::fmt::Display,
    {
        let result = self.relay(sink).await;
        self.state = RelayState::Closed;
        result
    }

    async fn relay<S>(&mut self, sink: &mut S) -> Result<(), BuildError>
    where
        S: Sink<String> + Unpin,
        S::Error: std::fmt::Display,
    {
        loop {
            self.state = RelayState::Polling;
            let build = match self.fetch().await {
                Ok(build) => build,
                Err(e) => {
                    tracing::debug!(app = %self.app, build = %self.id, error = %e, "relay fetch failed");
                    let _ = sink.send(format!("error: {}", e)).await;
                    return Err(e);
                }
            };

            let increment = build.logs.get(self.sent..).unwrap_or_default();
            if !increment.is_empty() {
                self.state = RelayState::Delivering;
                sink.send(increment.to_string())
                    .await
                    .map_err(|e| BuildError::Transport(e.to_string()))?;
                self.sent = build.logs.len();
            }

            if build.status.is_terminal() && self.config.policy == RelayPolicy::CloseOnTerminal {
                tracing::debug!(app = %self.app, build = %self.id, status = %build.status, "relay finished");
                return Ok(());
            }

            tokio::time::sleep(self.config.interval).await;
        }
    }

    async fn fetch(&self) -> Result<super::models::Build, BuildError> {
        let (app, id) = (self.app.clone(), self.id.clone());
        self.db
            .call(move |db| db.get_build(&app, &id))
            .await
            .map_err(BuildError::Store)?
            .ok_or_else(|| BuildError::not_found(&self.app, &self.id))
    }

    /// Serve one upgraded socket until the relay closes or the peer leaves.
    pub async fn serve(self, socket: WebSocket) {
        let (sender, receiver) = socket.split();
        self.serve_split(sender, receiver).await;
    }

    /// Relay over any message sink/stream pair: log increments go out as
    /// text frames, and a close frame follows once the relay ends.
    pub async fn serve_split<Tx, Rx, E>(mut self, sender: Tx, mut receiver: Rx)
    where
        Tx: Sink<Message> + Unpin,
        Tx::Error: std::fmt::Display,
        Rx: Stream<Item = Result<Message, E>> + Unpin,
    {
        let mut sink = sender.with(|text: String| {
            future::ready(Ok::<_, Tx::Error>(Message::Text(text.into())))
        });

        let (app, id) = (self.app.clone(), self.id.clone());
        let outcome = tokio::select! {
            result = self.run(&mut sink) => Some(result),
            _ = wait_for_close(&mut receiver) => None,
        };
        match outcome {
            Some(Err(e)) => {
                tracing::debug!(app = %app, build = %id, error = %e, "relay closed with error")
            }
            None => tracing::debug!(app = %app, build = %id, "subscriber disconnected"),
            Some(Ok(())) => {}
        }

        // Best-effort close frame
        let _ = sink.get_mut().send(Message::Close(None)).await;
    }
}

/// Resolves once the peer sends a close frame, errors out or goes away.
async fn wait_for_close<Rx, E>(receiver: &mut Rx)
where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
{
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// `GET /apps/{app}/builds/{build}/stream`
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path((app, id)): Path<(String, String)>,
) -> impl IntoResponse {
    let relay = LogRelay::new(state.db.clone(), app, id, state.relay);
    ws.on_upgrade(move |socket| relay.serve(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builds::db::BuildDb;
    use crate::builds::models::{Build, BuildStatus};
    use futures::channel::mpsc;

    const TICK: Duration = Duration::from_millis(50);

    fn handle() -> DbHandle {
        DbHandle::new(BuildDb::new_in_memory().unwrap())
    }

    async fn create(db: &DbHandle) -> Build {
        db.call(|db| db.create_build("demo")).await.unwrap()
    }

    async fn append(db: &DbHandle, id: &str, text: &str) {
        let (id, text) = (id.to_string(), text.to_string());
        assert!(db.call(move |db| db.append_logs("demo", &id, &text)).await.unwrap());
    }

    async fn set_status(db: &DbHandle, id: &str, status: BuildStatus) {
        let id = id.to_string();
        assert!(db.call(move |db| db.update_status("demo", &id, status)).await.unwrap());
    }

    async fn logs(db: &DbHandle, id: &str) -> String {
        let id = id.to_string();
        db.call(move |db| db.get_build("demo", &id)).await.unwrap().unwrap().logs
    }

    fn relay(db: &DbHandle, id: &str, policy: RelayPolicy) -> LogRelay {
        LogRelay::new(
            db.clone(),
            "demo".into(),
            id.into(),
            RelayConfig {
                interval: TICK,
                policy,
            },
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Some(msg)) = rx.try_next() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_terminal_build_delivers_once_and_closes() {
        let db = handle();
        let build = create(&db).await;
        set_status(&db, &build.id, BuildStatus::Running).await;
        append(&db, &build.id, "step 1\nstep 2\n").await;
        set_status(&db, &build.id, BuildStatus::Complete).await;

        let (mut tx, mut rx) = mpsc::unbounded();
        let mut relay = relay(&db, &build.id, RelayPolicy::CloseOnTerminal);
        assert_eq!(relay.state(), RelayState::Connected);

        relay.run(&mut tx).await.unwrap();

        assert_eq!(relay.state(), RelayState::Closed);
        assert_eq!(drain(&mut rx), vec!["step 1\nstep 2\n".to_string()]);
        assert_eq!(relay.sent(), "step 1\nstep 2\n".len());
    }

    #[tokio::test]
    async fn test_closes_within_one_interval_of_terminal_status() {
        let db = handle();
        let build = create(&db).await;
        set_status(&db, &build.id, BuildStatus::Running).await;

        let (mut tx, _rx) = mpsc::unbounded();
        let mut relay = relay(&db, &build.id, RelayPolicy::CloseOnTerminal);
        let task = tokio::spawn(async move { relay.run(&mut tx).await });

        tokio::time::sleep(TICK * 3).await;
        assert!(!task.is_finished());

        set_status(&db, &build.id, BuildStatus::Failed).await;
        let result = tokio::time::timeout(TICK * 6, task)
            .await
            .expect("relay should close after the build finished");
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_literal_policy_keeps_polling_after_terminal_status() {
        let db = handle();
        let build = create(&db).await;
        set_status(&db, &build.id, BuildStatus::Running).await;
        append(&db, &build.id, "done\n").await;
        set_status(&db, &build.id, BuildStatus::Complete).await;

        let (mut tx, mut rx) = mpsc::unbounded();
        let mut relay = relay(&db, &build.id, RelayPolicy::UntilDisconnect);
        let outcome = tokio::time::timeout(TICK * 5, relay.run(&mut tx)).await;

        assert!(outcome.is_err(), "literal relay must not close on its own");
        // Repeated polls never re-send what was already delivered.
        assert_eq!(drain(&mut rx), vec!["done\n".to_string()]);
    }

    #[tokio::test]
    async fn test_increments_concatenate_to_full_log() {
        let db = handle();
        let build = create(&db).await;
        set_status(&db, &build.id, BuildStatus::Running).await;
        append(&db, &build.id, "before relay\n").await;

        let (mut tx, mut rx) = mpsc::unbounded();
        let mut relay = relay(&db, &build.id, RelayPolicy::CloseOnTerminal);
        let task = tokio::spawn(async move { relay.run(&mut tx).await });

        for i in 0..12 {
            append(&db, &build.id, &format!("line {}\n", i)).await;
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        set_status(&db, &build.id, BuildStatus::Complete).await;
        task.await.unwrap().unwrap();

        let received = drain(&mut rx);
        assert!(received.len() > 1, "expected several increments");
        assert!(received.iter().all(|m| !m.is_empty()));
        assert_eq!(received.concat(), logs(&db, &build.id).await);
    }

    #[tokio::test]
    async fn test_unknown_build_reports_error_in_band() {
        let db = handle();
        let (mut tx, mut rx) = mpsc::unbounded();
        let mut relay = relay(&db, "BNOPE", RelayPolicy::UntilDisconnect);

        let err = relay.run(&mut tx).await.unwrap_err();

        assert!(matches!(err, BuildError::NotFound { .. }));
        assert_eq!(relay.state(), RelayState::Closed);
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("error: "));
        assert!(messages[0].contains("BNOPE"));
    }

    #[tokio::test]
    async fn test_failed_send_closes_relay() {
        let db = handle();
        let build = create(&db).await;
        set_status(&db, &build.id, BuildStatus::Running).await;
        append(&db, &build.id, "output\n").await;

        let (mut tx, rx) = mpsc::unbounded::<String>();
        drop(rx);
        let mut relay = relay(&db, &build.id, RelayPolicy::UntilDisconnect);

        let err = relay.run(&mut tx).await.unwrap_err();
        assert!(matches!(err, BuildError::Transport(_)));
        assert_eq!(relay.state(), RelayState::Closed);
        assert_eq!(relay.sent(), 0);
    }

    type PeerFrames = mpsc::UnboundedSender<Result<Message, axum::Error>>;

    /// Socket stand-in: returns what the relay wrote and the peer's sending half.
    fn socket() -> (
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<Message>,
        PeerFrames,
        mpsc::UnboundedReceiver<Result<Message, axum::Error>>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded();
        let (peer_tx, peer_rx) = mpsc::unbounded();
        (out_tx, out_rx, peer_tx, peer_rx)
    }

    #[tokio::test]
    async fn test_socket_gets_text_increment_then_close_frame() {
        let db = handle();
        let build = create(&db).await;
        set_status(&db, &build.id, BuildStatus::Running).await;
        append(&db, &build.id, "Step 1/1 : FROM scratch\n").await;
        set_status(&db, &build.id, BuildStatus::Complete).await;

        let (out_tx, out_rx, _peer_tx, peer_rx) = socket();
        relay(&db, &build.id, RelayPolicy::CloseOnTerminal)
            .serve_split(out_tx, peer_rx)
            .await;

        let frames: Vec<Message> = out_rx.collect().await;
        assert_eq!(
            frames,
            vec![
                Message::Text("Step 1/1 : FROM scratch\n".into()),
                Message::Close(None)
            ]
        );
    }

    #[tokio::test]
    async fn test_peer_close_frame_ends_literal_relay() {
        let db = handle();
        let build = create(&db).await;
        set_status(&db, &build.id, BuildStatus::Running).await;
        append(&db, &build.id, "partial\n").await;

        let (out_tx, out_rx, peer_tx, peer_rx) = socket();
        let task = tokio::spawn(
            relay(&db, &build.id, RelayPolicy::UntilDisconnect).serve_split(out_tx, peer_rx),
        );

        tokio::time::sleep(TICK * 3).await;
        assert!(!task.is_finished());
        peer_tx
            .unbounded_send(Ok(Message::Ping(Default::default())))
            .unwrap();
        peer_tx.unbounded_send(Ok(Message::Close(None))).unwrap();

        tokio::time::timeout(TICK * 6, task)
            .await
            .expect("relay should stop once the peer closes")
            .unwrap();
        let frames: Vec<Message> = out_rx.collect().await;
        assert_eq!(frames.first(), Some(&Message::Text("partial\n".into())));
        assert_eq!(frames.last(), Some(&Message::Close(None)));
    }

    #[tokio::test]
    async fn test_peer_going_away_ends_literal_relay() {
        let db = handle();
        let build = create(&db).await;
        set_status(&db, &build.id, BuildStatus::Running).await;

        let (out_tx, _out_rx, peer_tx, peer_rx) = socket();
        let task = tokio::spawn(
            relay(&db, &build.id, RelayPolicy::UntilDisconnect).serve_split(out_tx, peer_rx),
        );

        tokio::time::sleep(TICK * 2).await;
        drop(peer_tx);

        tokio::time::timeout(TICK * 6, task)
            .await
            .expect("relay should stop once the peer disconnects")
            .unwrap();
    }

    #[tokio::test]
    async fn test_socket_gets_error_frame_for_unknown_build() {
        let db = handle();
        let (out_tx, out_rx, _peer_tx, peer_rx) = socket();

        relay(&db, "BNOPE", RelayPolicy::CloseOnTerminal)
            .serve_split(out_tx, peer_rx)
            .await;

        let frames: Vec<Message> = out_rx.collect().await;
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Message::Text(text) => assert!(text.as_str().starts_with("error: ")),
            other => panic!("expected text frame, got {:?}", other),
        }
        assert_eq!(frames[1], Message::Close(None));
    }
}
