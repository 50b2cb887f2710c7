//! Session handshake state machine.
//!
//! Before any evaluation the client walks a fixed exchange with the server:
//!
//! ```text
//! clojure:      clone(1) -> load-file(2) -> add-middleware(3|4) [-> eval init(4)] -> ready
//! shadow-cljs:  clone(1) -> eval host REPL init(2) -> ready
//! ```
//!
//! [`Handshake`] owns no IO. It turns responses into the next request to send
//! (or readiness) and leaves sending to the caller.

use crate::config::{ConnectionConfig, Settings};
use crate::error::Result;
use crate::protocol::{keys, Request, Response};
use std::fmt;

/// Which kind of server we are talking to. Chosen at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Profile {
    /// JVM Clojure with uploaded middleware.
    Clojure,
    /// shadow-cljs hosted ClojureScript; `build` selects the REPL to start.
    ShadowCljs { build: String },
}

impl Profile {
    pub fn name(&self) -> &'static str {
        match self {
            Profile::Clojure => "clojure",
            Profile::ShadowCljs { .. } => "shadow-cljs",
        }
    }

    /// Expression that turns the server's REPL into the hosted target's REPL.
    pub fn host_init_code(&self) -> Option<String> {
        match self {
            Profile::Clojure => None,
            Profile::ShadowCljs { build } => Some(match build.as_str() {
                "node-repl" => "(shadow.cljs.devtools.api/node-repl)".to_string(),
                "browser-repl" => "(shadow.cljs.devtools.api/browser-repl)".to_string(),
                build => format!("(shadow.cljs.devtools.api/repl {})", build),
            }),
        }
    }

    pub fn uses_middleware(&self) -> bool {
        matches!(self, Profile::Clojure)
    }
}

impl Default for Profile {
    fn default() -> Self {
        Profile::Clojure
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Clojure => write!(f, "clojure"),
            Profile::ShadowCljs { build } => write!(f, "shadow-cljs {}", build),
        }
    }
}

/// Where the connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionPhase {
    #[default]
    Disconnected,
    Cloning,
    UploadingMiddleware,
    ActivatingMiddleware,
    RunningInit,
    Ready,
}

impl SessionPhase {
    /// Status text while the phase is in flight. `Ready` and `Disconnected`
    /// have connection-specific text supplied by the client.
    pub fn status_label(&self) -> Option<&'static str> {
        match self {
            SessionPhase::Cloning => Some("🌒 Cloning session"),
            SessionPhase::UploadingMiddleware => Some("🌓 Uploading middlewares"),
            SessionPhase::ActivatingMiddleware => Some("🌔 Adding middlewares"),
            SessionPhase::RunningInit => Some("🌔 Evaluating session code"),
            SessionPhase::Ready | SessionPhase::Disconnected => None,
        }
    }

    pub fn is_handshaking(&self) -> bool {
        !matches!(self, SessionPhase::Disconnected | SessionPhase::Ready)
    }
}

/// Everything the handshake needs to send, resolved before connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePlan {
    pub middleware_source: String,
    pub middleware: Vec<String>,
    pub extra_namespaces: Vec<String>,
    pub shared_init: Option<String>,
    pub host_init: Option<String>,
}

impl HandshakePlan {
    /// Resolve the plan for `profile`. Reads the middleware source file for
    /// the clojure profile.
    pub fn from_settings(settings: &Settings, profile: &Profile) -> Result<Self> {
        let middleware_source = if profile.uses_middleware() {
            settings.middleware_source()?
        } else {
            String::new()
        };
        Ok(Self {
            middleware_source,
            middleware: settings.middleware.qualified_names(),
            extra_namespaces: settings.middleware.extra_namespaces(),
            shared_init: settings.shared_init_code().map(str::to_string),
            host_init: profile.host_init_code(),
        })
    }
}

/// What the caller should do after feeding a response to the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Send `request`; the handshake is now in `phase`.
    Send { request: Request, phase: SessionPhase },
    /// The handshake finished; evaluation traffic may flow.
    Ready,
    /// Not a handshake message for the current step.
    Unhandled,
}

/// The handshake state machine for one connection.
#[derive(Debug, Clone)]
pub struct Handshake {
    profile: Profile,
    plan: HandshakePlan,
    phase: SessionPhase,
    session: Option<String>,
}

impl Handshake {
    pub fn new(profile: Profile, plan: HandshakePlan) -> Self {
        Self {
            profile,
            plan,
            phase: SessionPhase::Disconnected,
            session: None,
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// The primary session token, once cloned.
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.phase == SessionPhase::Ready
    }

    /// Begin the handshake. Returns the clone request to send first.
    pub fn start(&mut self) -> Request {
        self.phase = SessionPhase::Cloning;
        self.session = None;
        Request::clone_session(ConnectionConfig::CLONE_ID)
    }

    /// Forget the session and return to `Disconnected`.
    pub fn reset(&mut self) {
        self.phase = SessionPhase::Disconnected;
        self.session = None;
    }

    fn add_middleware_id(&self) -> u64 {
        if self.plan.shared_init.is_some() {
            ConnectionConfig::ADD_MIDDLEWARE_WITH_INIT_ID
        } else {
            ConnectionConfig::ADD_MIDDLEWARE_ID
        }
    }

    fn init_id(&self) -> u64 {
        match self.profile {
            Profile::Clojure => ConnectionConfig::SHARED_INIT_ID,
            Profile::ShadowCljs { .. } => ConnectionConfig::HOST_INIT_ID,
        }
    }

    fn advance(&mut self, phase: SessionPhase, request: Request) -> HandshakeOutcome {
        self.phase = phase;
        HandshakeOutcome::Send { request, phase }
    }

    /// Feed one response. Messages that do not advance the current step are
    /// returned as `Unhandled` so normal routing can look at them.
    pub fn on_response(&mut self, resp: &Response) -> HandshakeOutcome {
        let Some(id) = resp.id() else {
            return HandshakeOutcome::Unhandled;
        };

        match self.phase {
            SessionPhase::Cloning if id == ConnectionConfig::CLONE_ID => {
                let Some(token) = resp.get_str(keys::NEW_SESSION) else {
                    return HandshakeOutcome::Unhandled;
                };
                self.session = Some(token.to_string());
                let host_init = self
                    .plan
                    .host_init
                    .clone()
                    .filter(|_| !self.profile.uses_middleware());
                match host_init {
                    Some(code) => {
                        let request = Request::eval(ConnectionConfig::HOST_INIT_ID, token, &code);
                        self.advance(SessionPhase::RunningInit, request)
                    }
                    None => {
                        let request = Request::load_file(
                            ConnectionConfig::LOAD_MIDDLEWARE_ID,
                            token,
                            &self.plan.middleware_source,
                        );
                        self.advance(SessionPhase::UploadingMiddleware, request)
                    }
                }
            }

            SessionPhase::UploadingMiddleware
                if id == ConnectionConfig::LOAD_MIDDLEWARE_ID && resp.is_done() =>
            {
                let request = Request::add_middleware(
                    self.add_middleware_id(),
                    self.session.as_deref().unwrap_or_default(),
                    self.plan.middleware.clone(),
                    self.plan.extra_namespaces.clone(),
                );
                self.advance(SessionPhase::ActivatingMiddleware, request)
            }

            SessionPhase::ActivatingMiddleware
                if id == self.add_middleware_id() && resp.is_done() =>
            {
                match self.plan.shared_init.clone() {
                    Some(code) => {
                        let request = Request::eval(
                            ConnectionConfig::SHARED_INIT_ID,
                            self.session.as_deref().unwrap_or_default(),
                            &code,
                        );
                        self.advance(SessionPhase::RunningInit, request)
                    }
                    None => {
                        self.phase = SessionPhase::Ready;
                        HandshakeOutcome::Ready
                    }
                }
            }

            SessionPhase::RunningInit if id == self.init_id() && resp.is_done() => {
                self.phase = SessionPhase::Ready;
                HandshakeOutcome::Ready
            }

            _ => HandshakeOutcome::Unhandled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::protocol::ops;

    fn plan(shared_init: Option<&str>) -> HandshakePlan {
        HandshakePlan {
            middleware_source: "(ns mw)".to_string(),
            middleware: vec!["mw/time-eval".to_string()],
            extra_namespaces: vec!["mw".to_string()],
            shared_init: shared_init.map(str::to_string),
            host_init: None,
        }
    }

    fn resp(value: Value) -> Response {
        Response::from_value(value).unwrap()
    }

    fn new_session(id: i64, token: &str) -> Response {
        resp(Value::dict().with("id", id).with("new-session", token))
    }

    fn done(id: i64) -> Response {
        resp(Value::dict().with("id", id).with("status", vec!["done"]))
    }

    fn sent(outcome: HandshakeOutcome) -> Request {
        match outcome {
            HandshakeOutcome::Send { request, .. } => request,
            other => panic!("Expected a request, got: {:?}", other),
        }
    }

    #[test]
    fn test_clojure_handshake_without_init() {
        let mut hs = Handshake::new(Profile::Clojure, plan(None));
        let clone = hs.start();
        assert_eq!(clone.op(), ops::CLONE);
        assert_eq!(clone.id(), Some(1));
        assert_eq!(hs.phase(), SessionPhase::Cloning);

        let load = sent(hs.on_response(&new_session(1, "s-1")));
        assert_eq!(load.op(), ops::LOAD_FILE);
        assert_eq!(load.id(), Some(2));
        assert_eq!(load.session(), Some("s-1"));
        assert_eq!(load.get("file").and_then(Value::as_str), Some("(ns mw)"));

        let add = sent(hs.on_response(&done(2)));
        assert_eq!(add.op(), ops::ADD_MIDDLEWARE);
        assert_eq!(add.id(), Some(4));
        assert_eq!(
            add.get("middleware"),
            Some(&Value::from(vec!["mw/time-eval"]))
        );

        assert_eq!(hs.on_response(&done(4)), HandshakeOutcome::Ready);
        assert!(hs.is_ready());
        assert_eq!(hs.session(), Some("s-1"));
    }

    #[test]
    fn test_clojure_handshake_with_shared_init() {
        let mut hs = Handshake::new(Profile::Clojure, plan(Some("(def x 1)")));
        hs.start();
        sent(hs.on_response(&new_session(1, "s-1")));

        let add = sent(hs.on_response(&done(2)));
        assert_eq!(add.id(), Some(3));

        let init = sent(hs.on_response(&done(3)));
        assert_eq!(init.op(), ops::EVAL);
        assert_eq!(init.id(), Some(4));
        assert_eq!(init.get("code").and_then(Value::as_str), Some("(def x 1)"));
        assert_eq!(hs.phase(), SessionPhase::RunningInit);

        assert_eq!(hs.on_response(&done(4)), HandshakeOutcome::Ready);
    }

    #[test]
    fn test_shadow_handshake_skips_middleware() {
        let profile = Profile::ShadowCljs {
            build: ":app".to_string(),
        };
        let mut plan = plan(None);
        plan.host_init = profile.host_init_code();
        let mut hs = Handshake::new(profile, plan);
        hs.start();

        let init = sent(hs.on_response(&new_session(1, "s-9")));
        assert_eq!(init.op(), ops::EVAL);
        assert_eq!(init.id(), Some(2));
        assert_eq!(
            init.get("code").and_then(Value::as_str),
            Some("(shadow.cljs.devtools.api/repl :app)")
        );

        assert_eq!(hs.on_response(&done(2)), HandshakeOutcome::Ready);
    }

    #[test]
    fn test_out_of_step_messages_fall_through() {
        let mut hs = Handshake::new(Profile::Clojure, plan(None));
        hs.start();

        // done for step 2 before the session exists
        assert_eq!(hs.on_response(&done(2)), HandshakeOutcome::Unhandled);
        // clone reply without a session token
        assert_eq!(hs.on_response(&done(1)), HandshakeOutcome::Unhandled);
        // eval traffic
        assert_eq!(hs.on_response(&done(10)), HandshakeOutcome::Unhandled);
        assert_eq!(hs.phase(), SessionPhase::Cloning);

        sent(hs.on_response(&new_session(1, "s-1")));
        // a repeated clone reply is no longer a handshake message
        assert_eq!(
            hs.on_response(&new_session(1, "s-2")),
            HandshakeOutcome::Unhandled
        );
        assert_eq!(hs.session(), Some("s-1"));
    }

    #[test]
    fn test_host_init_code_per_build() {
        let code = |build: &str| {
            Profile::ShadowCljs {
                build: build.to_string(),
            }
            .host_init_code()
            .unwrap()
        };
        assert_eq!(code("node-repl"), "(shadow.cljs.devtools.api/node-repl)");
        assert_eq!(code("browser-repl"), "(shadow.cljs.devtools.api/browser-repl)");
        assert_eq!(code(":frontend"), "(shadow.cljs.devtools.api/repl :frontend)");
        assert_eq!(Profile::Clojure.host_init_code(), None);
    }

    #[test]
    fn test_reset_returns_to_disconnected() {
        let mut hs = Handshake::new(Profile::Clojure, plan(None));
        hs.start();
        hs.on_response(&new_session(1, "s-1"));
        hs.reset();
        assert_eq!(hs.phase(), SessionPhase::Disconnected);
        assert_eq!(hs.session(), None);
    }

    #[test]
    fn test_plan_requires_middleware_only_for_clojure() {
        let settings = Settings::default();
        assert!(HandshakePlan::from_settings(&settings, &Profile::Clojure).is_err());

        let shadow = Profile::ShadowCljs {
            build: "node-repl".to_string(),
        };
        let plan = HandshakePlan::from_settings(&settings, &shadow).unwrap();
        assert_eq!(plan.host_init.as_deref(), Some("(shadow.cljs.devtools.api/node-repl)"));
    }
}
