//! Request and response shapes.
//!
//! Every message is a bencode dictionary. Requests always carry `op`; once a
//! session exists they also carry `session` and `id`. Responses may carry
//! `id`, `status`, `value`, `new-session` and error fields.

use crate::codec::{encode, Dict, Value};
use crate::config::ProtocolConfig;

/// Operation names used by the client.
pub mod ops {
    pub const CLONE: &str = "clone";
    pub const LOAD_FILE: &str = "load-file";
    pub const ADD_MIDDLEWARE: &str = "add-middleware";
    pub const EVAL: &str = "eval";
    pub const CLONE_EVAL_CLOSE: &str = "clone-eval-close";
    pub const INTERRUPT: &str = "interrupt";
    pub const LOOKUP: &str = "lookup";
}

/// Field names shared with the server.
pub mod keys {
    pub const OP: &str = "op";
    pub const ID: &str = "id";
    pub const SESSION: &str = "session";
    pub const NEW_SESSION: &str = "new-session";
    pub const STATUS: &str = "status";
    pub const VALUE: &str = "value";
    pub const CODE: &str = "code";
    pub const FILE: &str = "file";
    pub const FILE_PATH: &str = "file-path";
    pub const FILE_NAME: &str = "file-name";
    pub const NS: &str = "ns";
    pub const LINE: &str = "line";
    pub const COLUMN: &str = "column";
    pub const SYM: &str = "sym";
    pub const INFO: &str = "info";
    pub const MIDDLEWARE: &str = "middleware";
    pub const EXTRA_NAMESPACES: &str = "extra-namespaces";
    pub const INTERRUPT_ID: &str = "interrupt-id";
    pub const EX: &str = "ex";
    pub const ROOT_EX: &str = "root-ex";
    pub const CAUGHT: &str = "nrepl.middleware.caught/caught";
    pub const PRINT: &str = "nrepl.middleware.print/print";
    pub const PRINT_QUOTA: &str = "nrepl.middleware.print/quota";
}

/// Status markers.
pub mod status {
    pub const DONE: &str = "done";
    pub const NAMESPACE_NOT_FOUND: &str = "namespace-not-found";
}

/// An outgoing message. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    fields: Dict,
}

impl Request {
    pub fn new(op: &str) -> Self {
        Self {
            fields: Dict::new(),
        }
        .with(keys::OP, op)
    }

    /// Add a field. Empty strings are dropped so optional context such as
    /// `file` simply goes missing instead of being sent blank.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Add a field only when a value is present.
    pub fn with_opt<V: Into<Value>>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        if value.as_bytes().is_some_and(<[u8]>::is_empty) {
            self.fields.remove(key.as_bytes());
        } else {
            self.fields.insert(key.as_bytes().to_vec(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key.as_bytes())
    }

    pub fn has(&self, key: &str) -> bool {
        self.fields.contains_key(key.as_bytes())
    }

    pub fn op(&self) -> &str {
        self.get(keys::OP).and_then(Value::as_str).unwrap_or_default()
    }

    pub fn id(&self) -> Option<u64> {
        self.get(keys::ID)
            .and_then(Value::as_int)
            .and_then(|id| u64::try_from(id).ok())
    }

    pub fn session(&self) -> Option<&str> {
        self.get(keys::SESSION).and_then(Value::as_str)
    }

    pub fn to_value(&self) -> Value {
        Value::Dict(self.fields.clone())
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(&Value::Dict(self.fields.clone()))
    }

    /// `{op: clone, id}`
    pub fn clone_session(id: u64) -> Self {
        Self::new(ops::CLONE).with(keys::ID, id)
    }

    /// `{op: load-file, id, session, file}`
    pub fn load_file(id: u64, session: &str, file: &str) -> Self {
        Self::new(ops::LOAD_FILE)
            .with(keys::ID, id)
            .with(keys::SESSION, session)
            .with(keys::FILE, file)
    }

    /// `{op: add-middleware, id, session, middleware, extra-namespaces}`
    pub fn add_middleware(
        id: u64,
        session: &str,
        middleware: Vec<String>,
        extra_namespaces: Vec<String>,
    ) -> Self {
        Self::new(ops::ADD_MIDDLEWARE)
            .with(keys::ID, id)
            .with(keys::SESSION, session)
            .with(keys::MIDDLEWARE, middleware)
            .with(keys::EXTRA_NAMESPACES, extra_namespaces)
    }

    /// `{op: eval, id, session, code}`
    pub fn eval(id: u64, session: &str, code: &str) -> Self {
        Self::new(ops::EVAL)
            .with(keys::ID, id)
            .with(keys::SESSION, session)
            .with(keys::CODE, code)
    }

    /// `{op: interrupt, interrupt-id, session}`
    pub fn interrupt(interrupt_id: u64, session: &str) -> Self {
        Self::new(ops::INTERRUPT)
            .with(keys::INTERRUPT_ID, interrupt_id)
            .with(keys::SESSION, session)
    }
}

/// A decoded incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    value: Value,
}

impl Response {
    /// Wrap a decoded value. Only dictionaries are protocol messages.
    pub fn from_value(value: Value) -> Option<Self> {
        value.as_dict()?;
        Some(Self { value })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.value.get_str(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.value.get_int(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.value.contains_key(key)
    }

    pub fn id(&self) -> Option<u64> {
        self.get_int(keys::ID).and_then(|id| u64::try_from(id).ok())
    }

    /// Status markers, in the order sent.
    pub fn statuses(&self) -> Vec<&str> {
        self.value
            .get_list(keys::STATUS)
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_str)
            .collect()
    }

    pub fn has_status(&self, marker: &str) -> bool {
        self.statuses().contains(&marker)
    }

    pub fn is_done(&self) -> bool {
        self.has_status(status::DONE)
    }

    /// A field added by server middleware: `<namespace>/<key>` first, then
    /// the bare key.
    pub fn middleware_field(&self, namespace: &str, key: &str) -> Option<&Value> {
        self.get(&format!("{}/{}", namespace, key))
            .or_else(|| self.get(key))
    }

    /// Append the truncation marker to every string value named in the
    /// message's truncated-keys list. Call once, before routing.
    pub fn apply_truncation(&mut self) {
        let truncated: Vec<Vec<u8>> = self
            .value
            .get_list(ProtocolConfig::TRUNCATED_KEYS)
            .unwrap_or_default()
            .iter()
            .filter_map(|key| key.as_bytes().map(<[u8]>::to_vec))
            .collect();
        let Some(dict) = self.value.as_dict_mut() else {
            return;
        };
        for key in truncated {
            if let Some(Value::Bytes(bytes)) = dict.get_mut(&key) {
                bytes.extend_from_slice(ProtocolConfig::TRUNCATION_MARKER.as_bytes());
            }
        }
    }
}
