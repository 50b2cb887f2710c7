//! Scripted in-process REPL server for integration tests.
//!
//! The server decodes each request, records it, and writes whatever replies
//! the script returns. Dropping the server closes the connection.

#![allow(dead_code)]

use repl_link::codec::{encode, StreamDecoder, Value};
use repl_link::{ClientEvent, ConnectTarget, ConnectionStatus, EvalEventKind, SessionPhase, Settings};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};

pub const PRIMARY_SESSION: &str = "primary-session";
pub const MIDDLEWARE_SOURCE: &str = "(ns repl-link.middleware)";
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub type Script = Box<dyn FnMut(&Value) -> Vec<Value> + Send>;

pub struct FakeServer {
    pub target: ConnectTarget,
    received: Arc<Mutex<Vec<Value>>>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl FakeServer {
    /// Listen on an OS-assigned local port and serve exactly one connection.
    pub async fn tcp(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (received, close_tx, close_rx) = Self::channels();

        let log = received.clone();
        tokio::spawn(async move {
            let accepted = listener.accept().await;
            drop(listener);
            if let Ok((stream, _)) = accepted {
                serve(stream, script, log, close_rx).await;
            }
        });

        Self {
            target: ConnectTarget::tcp("127.0.0.1", port),
            received,
            close_tx: Some(close_tx),
        }
    }

    #[cfg(unix)]
    pub async fn unix(path: &Path, script: Script) -> Self {
        let listener = tokio::net::UnixListener::bind(path).unwrap();
        let (received, close_tx, close_rx) = Self::channels();

        let log = received.clone();
        tokio::spawn(async move {
            let accepted = listener.accept().await;
            drop(listener);
            if let Ok((stream, _)) = accepted {
                serve(stream, script, log, close_rx).await;
            }
        });

        Self {
            target: ConnectTarget::Unix(path.to_path_buf()),
            received,
            close_tx: Some(close_tx),
        }
    }

    /// In-memory server. Returns the client end of the stream.
    pub fn duplex(script: Script) -> (Self, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (received, close_tx, close_rx) = Self::channels();
        tokio::spawn(serve(server, script, received.clone(), close_rx));

        let server = Self {
            target: ConnectTarget::tcp("in-memory", 1),
            received,
            close_tx: Some(close_tx),
        };
        (server, client)
    }

    fn channels() -> (
        Arc<Mutex<Vec<Value>>>,
        oneshot::Sender<()>,
        oneshot::Receiver<()>,
    ) {
        let (close_tx, close_rx) = oneshot::channel();
        (Arc::new(Mutex::new(Vec::new())), close_tx, close_rx)
    }

    /// Every request received so far, in order.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn ops(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|req| req.get_str("op").map(str::to_string))
            .collect()
    }

    /// Wait until a received request matches `pred`.
    pub async fn wait_for(&self, pred: impl Fn(&Value) -> bool) -> Value {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            if let Some(req) = self.received().into_iter().find(|req| pred(req)) {
                return req;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for request; got {:?}",
                self.ops()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Drop the connection from the server side.
    pub fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Client end of a stream that accepts `writes` writes and then fails every
/// later one with `BrokenPipe`. Reads keep working.
pub struct FailingWrites {
    inner: DuplexStream,
    writes_left: Arc<AtomicUsize>,
}

impl FailingWrites {
    pub fn new(inner: DuplexStream, writes: usize) -> Self {
        Self {
            inner,
            writes_left: Arc::new(AtomicUsize::new(writes)),
        }
    }
}

impl AsyncRead for FailingWrites {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FailingWrites {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let allowed = self
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

async fn serve<S>(
    stream: S,
    mut script: Script,
    received: Arc<Mutex<Vec<Value>>>,
    mut close_rx: oneshot::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut decoder = StreamDecoder::new();
    let mut buf = vec![0u8; 1024];

    loop {
        while let Ok(Some(request)) = decoder.next_value() {
            received.lock().unwrap().push(request.clone());
            for reply in script(&request) {
                if writer.write_all(&encode(&reply)).await.is_err() {
                    return;
                }
            }
        }

        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            },
            _ = &mut close_rx => return,
        };
        decoder.feed(&buf[..n]);
    }
}

fn done(id: i64) -> Value {
    Value::dict().with("id", id).with("status", vec!["done"])
}

fn value(id: i64, text: &str) -> Value {
    Value::dict().with("id", id).with("value", text)
}

/// Behaves like an nREPL server with the editor middleware loaded.
pub fn nrepl_script() -> Script {
    Box::new(|req: &Value| {
        let id = req.get_int("id").unwrap_or(0);
        match req.get_str("op").unwrap_or_default() {
            "clone" => vec![Value::dict()
                .with("id", id)
                .with("new-session", PRIMARY_SESSION)
                .with("status", vec!["done"])],
            "load-file" if id < 10 => vec![value(id, "nil"), done(id)],
            "load-file" => vec![value(id, "#'user/loaded"), done(id)],
            "add-middleware" => vec![done(id)],
            "eval" | "clone-eval-close" => eval_replies(id, req),
            "lookup" => lookup_replies(id, req),
            "interrupt" => {
                let target = req.get_int("interrupt-id").unwrap_or(0);
                vec![Value::dict()
                    .with("id", target)
                    .with("status", vec!["interrupted", "done"])]
            }
            _ => vec![Value::dict()
                .with("id", id)
                .with("status", vec!["unknown-op", "done"])],
        }
    })
}

fn eval_replies(id: i64, req: &Value) -> Vec<Value> {
    let mut replies = Vec::new();
    if req.get_str("op") == Some("clone-eval-close") {
        replies.push(
            Value::dict()
                .with("id", id)
                .with("new-session", format!("child-{}", id)),
        );
    }

    match req.get_str("code").unwrap_or_default() {
        "(+ 1 2)" => {
            replies.push(value(id, "3"));
            replies.push(done(id));
        }
        "(/ 1 0)" => {
            replies.push(
                Value::dict()
                    .with("id", id)
                    .with("root-ex-class", "ArithmeticException")
                    .with("root-ex-msg", "Divide by zero"),
            );
            replies.push(done(id));
        }
        "(range)" => {
            replies.push(
                value(id, "(0 1 2").with("nrepl.middleware.print/truncated-keys", vec!["value"]),
            );
            replies.push(done(id));
        }
        "(Thread/sleep 100000)" => {}
        // Value without the closing done: the record stays registered.
        "(future 1)" => replies.push(value(id, "#future[1]")),
        _ => {
            replies.push(value(id, "nil"));
            replies.push(done(id));
        }
    }
    replies
}

fn lookup_replies(id: i64, req: &Value) -> Vec<Value> {
    let info = match req.get_str("sym").unwrap_or_default() {
        "map" => Value::dict()
            .with("ns", "clojure.core")
            .with("name", "map")
            .with("arglists-str", "([f] [f coll])")
            .with("doc", "Returns a lazy sequence"),
        _ => Value::dict(),
    };
    vec![Value::dict()
        .with("id", id)
        .with("info", info)
        .with("status", vec!["done"])]
}

/// Settings for the clojure profile, with the middleware source written
/// into `dir`.
pub fn clojure_settings(dir: &Path) -> Settings {
    let source = dir.join("middleware.clj");
    std::fs::write(&source, MIDDLEWARE_SOURCE).unwrap();

    let mut settings = Settings::default();
    settings.middleware.source_path = Some(source);
    settings
}

pub async fn next_event(rx: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a client event")
        .expect("event channel closed")
}

/// Skip events until the session is ready.
pub async fn wait_ready(rx: &mut broadcast::Receiver<ClientEvent>) -> ConnectionStatus {
    loop {
        if let ClientEvent::Connection(status) = next_event(rx).await {
            if status.phase == SessionPhase::Ready {
                return status;
            }
        }
    }
}

/// Collect the events for eval `id` up to and including its terminal one.
/// Progress ticks are skipped.
pub async fn eval_events(rx: &mut broadcast::Receiver<ClientEvent>, id: u64) -> Vec<EvalEventKind> {
    let mut kinds = Vec::new();
    loop {
        if let ClientEvent::Eval(event) = next_event(rx).await {
            if event.id != id || matches!(event.kind, EvalEventKind::Progress { .. }) {
                continue;
            }
            let terminal = event.is_terminal();
            kinds.push(event.kind);
            if terminal {
                return kinds;
            }
        }
    }
}

/// Wait for the disconnect status and count the notices around it.
pub async fn wait_disconnected(rx: &mut broadcast::Receiver<ClientEvent>) -> usize {
    let mut notices = 0;
    loop {
        match next_event(rx).await {
            ClientEvent::Notice(_) => notices += 1,
            ClientEvent::Connection(status) if status.phase == SessionPhase::Disconnected => break,
            _ => {}
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, ClientEvent::Notice(_)) {
            notices += 1;
        }
    }
    notices
}

/// Poll until `check` holds.
pub async fn eventually(check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
