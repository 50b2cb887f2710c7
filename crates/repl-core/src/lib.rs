//! repl-link - Headless client for bencode REPL servers.
//!
//! This crate speaks the nREPL wire protocol: a bencode codec, a session
//! handshake that uploads editor middleware, and bookkeeping that turns
//! responses into per-evaluation events. It renders nothing; a UI subscribes
//! to [`ClientEvent`]s and shows them however it likes.
//!
//! # Example
//!
//! ```rust,ignore
//! use repl_link::{ClientEvent, ConnectTarget, Profile, ReplClient, Settings, SourceContext};
//!
//! #[tokio::main]
//! async fn main() -> repl_link::Result<()> {
//!     let client = ReplClient::new(Settings::load("settings.json")?);
//!     let mut events = client.subscribe();
//!
//!     client
//!         .connect(ConnectTarget::parse("localhost:7888")?, Profile::Clojure)
//!         .await?;
//!
//!     // Wait for the handshake, then evaluate.
//!     while !client.is_ready() {
//!         events.recv().await.ok();
//!     }
//!     let id = client
//!         .send_eval("(+ 1 2)", SourceContext::new().in_ns("user"))
//!         .await?;
//!     println!("sent eval {}", id);
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod eval;
pub mod events;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use client::ReplClient;
pub use codec::{decode, decode_stream, encode, ByteSource, StreamDecoder, Value};
pub use config::{ConnectionConfig, MiddlewareSettings, ProgressConfig, ProtocolConfig, Settings};
pub use error::{ReplError, Result};
pub use eval::{
    EvalFailure, EvalKind, EvalRecord, EvalRegistry, EvalStatus, InterruptState, LookupInfo,
    SourceContext, SourceLocation,
};
pub use events::{ClientEvent, ConnectionStatus, EvalEvent, EvalEventKind, EventBus};
pub use progress::ProgressTicker;
pub use protocol::{Request, Response};
pub use session::{Handshake, HandshakeOutcome, HandshakePlan, Profile, SessionPhase};
pub use transport::{ConnectTarget, Transport};
