//! The client facade.
//!
//! [`ReplClient`] owns at most one connection. Connecting spawns a reader task
//! that drives the handshake and routes eval responses; every outcome is
//! published on the event bus returned by [`ReplClient::subscribe`].
//!
//! # Thread Safety
//!
//! The client is cheap to clone and every clone talks to the same connection.
//! Connection state sits behind short-lived std mutexes that are never held
//! across an await; writes go through the transport's own async lock.
//! Each connection gets a generation number so a reader task that outlives
//! its connection cannot tear down a newer one.

use crate::config::{ConnectionConfig, Settings};
use crate::error::{ReplError, Result};
use crate::eval::{EvalKind, EvalRecord, EvalRegistry, InterruptState, SourceContext};
use crate::events::{ClientEvent, EvalEventKind, EventBus};
use crate::progress::ProgressTicker;
use crate::protocol::{keys, ops, Request, Response};
use crate::session::{Handshake, HandshakeOutcome, HandshakePlan, Profile, SessionPhase};
use crate::transport::{
    read_loop, BoxedReader, ConnectTarget, ReaderExit, ResponseHandler, Transport,
};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// One live connection.
struct Link {
    transport: Arc<Transport>,
    handshake: Handshake,
    shutdown_tx: watch::Sender<bool>,
    generation: u64,
}

/// What a request needs from a ready connection.
struct ReadyLink {
    transport: Arc<Transport>,
    session: String,
    profile: Profile,
    generation: u64,
}

struct Shared {
    settings: RwLock<Settings>,
    events: EventBus,
    registry: Arc<EvalRegistry>,
    ticker: Mutex<Option<ProgressTicker>>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    last_connect: Mutex<Option<(ConnectTarget, Profile)>>,
}

impl Shared {
    fn middleware_namespace(&self) -> String {
        self.settings
            .read()
            .expect("settings lock poisoned")
            .middleware
            .namespace
            .clone()
    }

    /// Drop the connection if it is still generation `generation`. Pending
    /// evals are discarded without interrupts.
    fn teardown(&self, generation: u64, notice: Option<String>) -> bool {
        let link = {
            let mut slot = self.link.lock().expect("link lock poisoned");
            match slot.as_ref() {
                Some(link) if link.generation == generation => slot.take(),
                _ => None,
            }
        };
        let Some(link) = link else {
            return false;
        };
        let _ = link.shutdown_tx.send(true);

        let dropped = self.registry.clear();
        if dropped > 0 {
            debug!("Discarded {} pending evals", dropped);
        }
        self.events.connection(SessionPhase::Disconnected, None);
        if let Some(notice) = notice {
            self.events.notice(notice);
        }
        true
    }

    /// Tear the connection down after a write failure that leaves the
    /// socket unusable. Returns whether `err` was such a failure.
    fn on_send_error(&self, generation: u64, target: &ConnectTarget, err: &ReplError) -> bool {
        if !err.is_fatal_to_connection() {
            return false;
        }
        warn!("Write to {} failed: {}", target, err);
        if self.teardown(generation, Some(format!("Connection to {} lost: {}", target, err))) {
            info!("Connection to {} ended", target);
        }
        true
    }
}

/// Routes responses for one connection.
struct ConnectionHandler {
    shared: Arc<Shared>,
    transport: Arc<Transport>,
    target: ConnectTarget,
    generation: u64,
}

#[async_trait::async_trait]
impl ResponseHandler for ConnectionHandler {
    async fn on_response(&self, response: Response) {
        let step = {
            let mut slot = self.shared.link.lock().expect("link lock poisoned");
            match slot.as_mut() {
                Some(link) if link.generation == self.generation => {
                    link.handshake.on_response(&response)
                }
                _ => return,
            }
        };

        match step {
            HandshakeOutcome::Send { request, phase } => {
                self.shared
                    .events
                    .connection(phase, phase.status_label().map(str::to_string));
                if let Err(e) = self.transport.send(&request).await {
                    if !self.shared.on_send_error(self.generation, &self.target, &e) {
                        warn!("Failed to send {} during handshake: {}", request.op(), e);
                    }
                }
            }
            HandshakeOutcome::Ready => {
                info!("Session ready on {}", self.target);
                self.shared
                    .events
                    .connection(SessionPhase::Ready, Some(self.target.connected_label()));
            }
            HandshakeOutcome::Unhandled => {
                let namespace = self.shared.middleware_namespace();
                for event in self.shared.registry.route(&response, &namespace) {
                    self.shared.events.publish(ClientEvent::Eval(event));
                }
            }
        }
    }
}

/// Client for one REPL server connection at a time.
#[derive(Clone)]
pub struct ReplClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ReplClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplClient")
            .field("phase", &self.phase())
            .field("pending", &self.shared.registry.len())
            .finish()
    }
}

impl ReplClient {
    pub fn new(settings: Settings) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings: RwLock::new(settings),
                events: EventBus::new(ConnectionConfig::EVENT_CHANNEL_CAPACITY),
                registry: Arc::new(EvalRegistry::new()),
                ticker: Mutex::new(None),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                last_connect: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub fn settings(&self) -> Settings {
        self.shared
            .settings
            .read()
            .expect("settings lock poisoned")
            .clone()
    }

    /// Open `target` and start the handshake. Returns once the first
    /// handshake request is sent; readiness arrives as a connection event.
    pub async fn connect(&self, target: ConnectTarget, profile: Profile) -> Result<()> {
        if self.is_connected() {
            return Err(ReplError::AlreadyConnected);
        }
        let plan = HandshakePlan::from_settings(&self.settings(), &profile)?;

        info!("Connecting to {} ({})", target, profile);
        let (transport, reader) = match Transport::open(&target).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!("{}", e);
                self.shared.events.notice(e.to_string());
                return Err(e);
            }
        };
        *self.shared.last_connect.lock().expect("connect lock poisoned") =
            Some((target, profile.clone()));
        self.start(transport, reader, profile, plan).await
    }

    /// Run the handshake over an already established stream.
    pub async fn attach<S>(&self, stream: S, target: ConnectTarget, profile: Profile) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.is_connected() {
            return Err(ReplError::AlreadyConnected);
        }
        let plan = HandshakePlan::from_settings(&self.settings(), &profile)?;
        let (transport, reader) = Transport::from_stream(stream, target);
        self.start(transport, reader, profile, plan).await
    }

    /// Connect again to the last target [`ReplClient::connect`] reached.
    pub async fn reconnect(&self) -> Result<()> {
        let (target, profile) = self
            .shared
            .last_connect
            .lock()
            .expect("connect lock poisoned")
            .clone()
            .ok_or(ReplError::NoPreviousConnection)?;
        if self.is_connected() {
            self.disconnect().await?;
        }
        self.connect(target, profile).await
    }

    async fn start(
        &self,
        transport: Transport,
        reader: BoxedReader,
        profile: Profile,
        plan: HandshakePlan,
    ) -> Result<()> {
        self.ensure_ticker();

        let transport = Arc::new(transport);
        let target = transport.target().clone();
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handshake = Handshake::new(profile, plan);
        let clone_request = handshake.start();
        {
            let mut slot = self.shared.link.lock().expect("link lock poisoned");
            if slot.is_some() {
                return Err(ReplError::AlreadyConnected);
            }
            *slot = Some(Link {
                transport: transport.clone(),
                handshake,
                shutdown_tx,
                generation,
            });
        }

        let handler = ConnectionHandler {
            shared: self.shared.clone(),
            transport: transport.clone(),
            target: target.clone(),
            generation,
        };
        tokio::spawn(async move {
            let exit = read_loop(reader, &handler, shutdown_rx).await;
            debug!("Reader for {} exited: {:?}", handler.target, exit);
            let notice = match exit {
                ReaderExit::Eof => format!("Connection to {} closed", handler.target),
                ReaderExit::Failed(e) => {
                    if e.is_fatal_to_connection() {
                        warn!("Reader for {} failed: {}", handler.target, e);
                    }
                    format!("Connection to {} lost: {}", handler.target, e)
                }
                ReaderExit::Shutdown => format!("Disconnected from {}", handler.target),
            };
            if handler.shared.teardown(generation, Some(notice)) {
                info!("Connection to {} ended", handler.target);
            }
        });

        self.shared.events.connection(
            SessionPhase::Cloning,
            SessionPhase::Cloning.status_label().map(str::to_string),
        );
        if let Err(e) = transport.send(&clone_request).await {
            self.shared
                .teardown(generation, Some(format!("Failed to start session on {}: {}", target, e)));
            return Err(e);
        }
        Ok(())
    }

    /// Close the connection. Pending evals are dropped without interrupts.
    pub async fn disconnect(&self) -> Result<()> {
        let (transport, generation) = {
            let slot = self.shared.link.lock().expect("link lock poisoned");
            let link = slot.as_ref().ok_or(ReplError::NotConnected)?;
            (link.transport.clone(), link.generation)
        };
        if self.shared.teardown(generation, None) {
            transport.close().await;
            info!("Disconnected from {}", transport.target());
        }
        Ok(())
    }

    /// Stop the progress ticker and drop the connection.
    pub async fn shutdown(&self) {
        if let Some(mut ticker) = self.shared.ticker.lock().expect("ticker lock poisoned").take() {
            ticker.stop();
        }
        let _ = self.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.link.lock().expect("link lock poisoned").is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == SessionPhase::Ready
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared
            .link
            .lock()
            .expect("link lock poisoned")
            .as_ref()
            .map(|link| link.handshake.phase())
            .unwrap_or_default()
    }

    /// The primary session token.
    pub fn session(&self) -> Option<String> {
        self.shared
            .link
            .lock()
            .expect("link lock poisoned")
            .as_ref()
            .and_then(|link| link.handshake.session().map(str::to_string))
    }

    pub fn target(&self) -> Option<ConnectTarget> {
        self.shared
            .link
            .lock()
            .expect("link lock poisoned")
            .as_ref()
            .map(|link| link.transport.target().clone())
    }

    fn live_link(&self) -> Result<(Arc<Transport>, Option<String>, u64)> {
        let slot = self.shared.link.lock().expect("link lock poisoned");
        let link = slot.as_ref().ok_or(ReplError::NotConnected)?;
        Ok((
            link.transport.clone(),
            link.handshake.session().map(str::to_string),
            link.generation,
        ))
    }

    fn ready_link(&self) -> Result<ReadyLink> {
        let slot = self.shared.link.lock().expect("link lock poisoned");
        let link = slot.as_ref().ok_or(ReplError::NotConnected)?;
        if !link.handshake.is_ready() {
            return Err(ReplError::NotReady);
        }
        let session = link.handshake.session().ok_or(ReplError::NotReady)?;
        Ok(ReadyLink {
            transport: link.transport.clone(),
            session: session.to_string(),
            profile: link.handshake.profile().clone(),
            generation: link.generation,
        })
    }

    /// Evaluate `code`. Returns the eval id; the outcome arrives as events.
    pub async fn send_eval(&self, code: &str, context: SourceContext) -> Result<u64> {
        let link = self.ready_link()?;
        let settings = self.settings();
        let id = self.shared.registry.next_id();

        let in_session = !link.profile.uses_middleware() || settings.eval_in_session;
        let op = if in_session {
            ops::EVAL
        } else {
            ops::CLONE_EVAL_CLOSE
        };
        let mut request = Request::new(op)
            .with(keys::ID, id)
            .with(keys::SESSION, link.session.as_str())
            .with(keys::CODE, code)
            .with(keys::NS, context.namespace())
            .with_opt(keys::LINE, context.line)
            .with_opt(keys::COLUMN, context.column)
            .with_opt(keys::FILE, context.file.as_deref());
        stamp_print_options(&mut request, &link.profile, &settings);

        // Child-session evals learn their session from `new-session`.
        let record = EvalRecord::new(id, EvalKind::Eval, code, context)
            .with_session(in_session.then(|| link.session.clone()));
        self.dispatch(&link, record, request).await
    }

    /// Ask the server about `symbol` in `ns` (default `user`).
    pub async fn send_lookup(&self, symbol: &str, ns: Option<&str>) -> Result<u64> {
        let link = self.ready_link()?;
        let id = self.shared.registry.next_id();
        let context = SourceContext {
            ns: ns.map(str::to_string),
            ..SourceContext::default()
        };

        let request = Request::new(ops::LOOKUP)
            .with(keys::ID, id)
            .with(keys::SESSION, link.session.as_str())
            .with(keys::SYM, symbol)
            .with(keys::NS, context.namespace());

        let record = EvalRecord::new(id, EvalKind::Lookup, symbol, context)
            .with_session(Some(link.session.clone()));
        self.dispatch(&link, record, request).await
    }

    /// Load a whole file's `content`. `path` names it in stack traces.
    pub async fn send_load_file(&self, content: &str, path: Option<&Path>) -> Result<u64> {
        let link = self.ready_link()?;
        let settings = self.settings();
        let id = self.shared.registry.next_id();

        let file_path = path.map(|p| p.display().to_string());
        let file_name = path
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| ConnectionConfig::NO_SOURCE_FILE.to_string());

        let mut request = Request::new(ops::LOAD_FILE)
            .with(keys::ID, id)
            .with(keys::SESSION, link.session.as_str())
            .with(keys::FILE, content)
            .with_opt(keys::FILE_PATH, file_path.as_deref())
            .with(keys::FILE_NAME, file_name);
        stamp_print_options(&mut request, &link.profile, &settings);

        let context = SourceContext {
            file: file_path,
            ..SourceContext::default()
        };
        let record = EvalRecord::new(id, EvalKind::LoadFile, content, context)
            .with_session(Some(link.session.clone()));
        self.dispatch(&link, record, request).await
    }

    async fn dispatch(&self, link: &ReadyLink, record: EvalRecord, request: Request) -> Result<u64> {
        let id = record.id;
        self.shared.registry.register(record)?;
        self.shared.events.eval(
            id,
            EvalEventKind::Pending {
                phase: self.progress_phase(),
            },
        );
        self.wake_progress();

        if let Err(e) = link.transport.send(&request).await {
            self.shared.registry.discard(id);
            self.shared.events.eval(id, EvalEventKind::Canceled);
            if self
                .shared
                .on_send_error(link.generation, link.transport.target(), &e)
            {
                return Err(e);
            }
            if e.is_user_facing() {
                self.shared.events.notice(format!("Eval {} not sent: {}", id, e));
            } else {
                warn!("Eval {} not sent: {}", id, e);
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Interrupt a running eval, under its own session or the primary one.
    pub async fn interrupt(&self, id: u64) -> Result<()> {
        let (transport, primary, generation) = self.live_link()?;
        let session = match self.shared.registry.mark_interrupted(id)? {
            InterruptState::Running { session } => session.or(primary),
            InterruptState::Finished => {
                debug!("Eval {} already finished, not interrupting", id);
                return Ok(());
            }
        };
        self.shared.events.eval(id, EvalEventKind::Interrupting);

        let Some(session) = session else {
            warn!("Eval {} has no session to interrupt", id);
            return Ok(());
        };
        let result = transport.send(&Request::interrupt(id, &session)).await;
        if let Err(e) = &result {
            self.shared.on_send_error(generation, transport.target(), e);
        }
        result
    }

    /// Interrupt every pending eval. Returns how many were interrupted.
    pub async fn interrupt_all(&self) -> Result<usize> {
        let pending = self.shared.registry.pending_ids();
        for id in &pending {
            self.interrupt(*id).await?;
        }
        Ok(pending.len())
    }

    /// Forget an eval. A still-pending eval is interrupted first.
    pub async fn discard(&self, id: u64) -> Option<EvalRecord> {
        let discarded = self.shared.registry.discard(id)?;
        if let Some(request) = discarded.interrupt {
            match self.live_link() {
                Ok((transport, _, generation)) => {
                    if let Err(e) = transport.send(&request).await {
                        warn!("Failed to interrupt discarded eval {}: {}", id, e);
                        self.shared.on_send_error(generation, transport.target(), &e);
                    }
                }
                Err(_) => debug!("Discarded eval {} after the connection closed", id),
            }
        }
        Some(discarded.record)
    }

    /// Drop records that already have an outcome.
    pub fn clear_finished(&self) -> Vec<u64> {
        self.shared.registry.clear_finished()
    }

    /// Ids of evals still waiting on the server.
    pub fn pending(&self) -> Vec<u64> {
        self.shared.registry.pending_ids()
    }

    pub fn record(&self, id: u64) -> Option<EvalRecord> {
        self.shared.registry.lookup(id)
    }

    /// Replace the settings. Progress changes apply immediately; handshake
    /// changes apply on the next connect.
    pub fn update_settings(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        if let Some(ticker) = self
            .shared
            .ticker
            .lock()
            .expect("ticker lock poisoned")
            .as_mut()
        {
            ticker.reconfigure(settings.progress_phases.clone(), settings.progress_interval());
        }
        *self.shared.settings.write().expect("settings lock poisoned") = settings;
        Ok(())
    }

    /// Show the next progress phase without waiting for the interval.
    pub fn wake_progress(&self) {
        if let Some(ticker) = self.shared.ticker.lock().expect("ticker lock poisoned").as_ref() {
            ticker.wake();
        }
    }

    fn progress_phase(&self) -> String {
        if let Some(ticker) = self.shared.ticker.lock().expect("ticker lock poisoned").as_ref() {
            return ticker.phase();
        }
        self.settings()
            .progress_phases
            .first()
            .cloned()
            .unwrap_or_default()
    }

    fn ensure_ticker(&self) {
        let mut ticker = self.shared.ticker.lock().expect("ticker lock poisoned");
        if ticker.is_none() {
            let settings = self.settings();
            *ticker = Some(ProgressTicker::start(
                self.shared.registry.clone(),
                self.shared.events.clone(),
                settings.progress_phases.clone(),
                settings.progress_interval(),
            ));
        }
    }
}

/// Print and error-capture options for the uploaded middleware.
fn stamp_print_options(request: &mut Request, profile: &Profile, settings: &Settings) {
    if !profile.uses_middleware() {
        return;
    }
    let middleware = &settings.middleware;
    request.set(keys::CAUGHT, middleware.qualify("print-root-trace"));
    request.set(keys::PRINT, middleware.qualify("pprint"));
    request.set(keys::PRINT_QUOTA, middleware.print_quota);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_options_only_for_clojure() {
        let settings = Settings::default();

        let mut request = Request::eval(10, "s", "1");
        stamp_print_options(&mut request, &Profile::Clojure, &settings);
        assert_eq!(
            request.get(keys::PRINT).and_then(|v| v.as_str()),
            Some("repl-link.middleware/pprint")
        );
        assert_eq!(
            request.get(keys::CAUGHT).and_then(|v| v.as_str()),
            Some("repl-link.middleware/print-root-trace")
        );
        assert_eq!(request.get(keys::PRINT_QUOTA).and_then(|v| v.as_int()), Some(4096));

        let mut request = Request::eval(10, "s", "1");
        stamp_print_options(
            &mut request,
            &Profile::ShadowCljs {
                build: "app".into(),
            },
            &settings,
        );
        assert!(!request.has(keys::PRINT));
    }

    #[tokio::test]
    async fn test_requests_before_connect_fail() {
        let client = ReplClient::new(Settings::default());
        assert!(matches!(
            client.send_eval("1", SourceContext::new()).await,
            Err(ReplError::NotConnected)
        ));
        assert!(matches!(client.interrupt(10).await, Err(ReplError::NotConnected)));
        assert!(matches!(client.disconnect().await, Err(ReplError::NotConnected)));
        assert!(matches!(
            client.reconnect().await,
            Err(ReplError::NoPreviousConnection)
        ));
        assert_eq!(client.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_clojure_profile_needs_middleware_source() {
        let client = ReplClient::new(Settings::default());
        let (stream, _server) = tokio::io::duplex(64);
        let result = client
            .attach(stream, ConnectTarget::tcp("mem", 1), Profile::Clojure)
            .await;
        assert!(matches!(result, Err(ReplError::Config { .. })));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_update_settings_validates() {
        let client = ReplClient::new(Settings::default());
        let mut settings = Settings::default();
        settings.middleware.namespace = " ".into();
        assert!(client.update_settings(settings).is_err());

        let mut settings = Settings::default();
        settings.eval_in_session = true;
        client.update_settings(settings).unwrap();
        assert!(client.settings().eval_in_session);
    }
}
