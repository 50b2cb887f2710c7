use super::lookup::LookupInfo;
use crate::config::ConnectionConfig;
use std::time::Duration;

/// Lifecycle of one in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvalStatus {
    Pending,
    Interrupted,
    Succeeded,
    Failed,
    LookupComplete,
}

impl EvalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalStatus::Pending => "pending",
            EvalStatus::Interrupted => "interrupted",
            EvalStatus::Succeeded => "succeeded",
            EvalStatus::Failed => "failed",
            EvalStatus::LookupComplete => "lookup-complete",
        }
    }

    /// Whether an outcome has been recorded.
    pub fn has_outcome(&self) -> bool {
        matches!(
            self,
            EvalStatus::Succeeded | EvalStatus::Failed | EvalStatus::LookupComplete
        )
    }

    /// Still waiting on the server (possibly after an interrupt).
    pub fn is_running(&self) -> bool {
        matches!(self, EvalStatus::Pending | EvalStatus::Interrupted)
    }
}

/// What kind of request produced the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvalKind {
    Eval,
    LoadFile,
    Lookup,
}

/// Where the code came from, as supplied by the editor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceContext {
    pub ns: Option<String>,
    /// 1-based line of the first character.
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub file: Option<String>,
}

impl SourceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_ns(mut self, ns: impl Into<String>) -> Self {
        self.ns = Some(ns.into());
        self
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn in_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Enclosing namespace, `user` when unknown.
    pub fn namespace(&self) -> &str {
        self.ns
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(ConnectionConfig::DEFAULT_NAMESPACE)
    }
}

/// Position reported by the server for a failure. `line` is 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
    pub source: Option<String>,
}

/// A classified remote exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalFailure {
    /// One-line human readable summary.
    pub message: String,
    /// Full stack trace for on-demand display.
    pub trace: Option<String>,
    pub location: Option<SourceLocation>,
}

impl EvalFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
            location: None,
        }
    }
}

/// Bookkeeping for one request between send and terminal outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalRecord {
    pub id: u64,
    pub kind: EvalKind,
    pub code: String,
    pub context: SourceContext,
    pub status: EvalStatus,
    /// Session the request runs under. Child sessions arrive as `new-session`.
    pub session: Option<String>,
    pub value: Option<String>,
    pub elapsed: Option<Duration>,
    pub failure: Option<EvalFailure>,
    pub lookup: Option<LookupInfo>,
}

impl EvalRecord {
    pub fn new(id: u64, kind: EvalKind, code: impl Into<String>, context: SourceContext) -> Self {
        Self {
            id,
            kind,
            code: code.into(),
            context,
            status: EvalStatus::Pending,
            session: None,
            value: None,
            elapsed: None,
            failure: None,
            lookup: None,
        }
    }

    pub fn with_session(mut self, session: Option<String>) -> Self {
        self.session = session.filter(|s| !s.is_empty());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_context_defaults_namespace() {
        assert_eq!(SourceContext::new().namespace(), "user");
        assert_eq!(SourceContext::new().in_ns("").namespace(), "user");
        assert_eq!(SourceContext::new().in_ns("app.core").namespace(), "app.core");
    }

    #[test]
    fn test_status_predicates() {
        assert!(EvalStatus::Pending.is_running());
        assert!(EvalStatus::Interrupted.is_running());
        assert!(!EvalStatus::Interrupted.has_outcome());
        assert!(EvalStatus::LookupComplete.has_outcome());
        assert_eq!(EvalStatus::LookupComplete.as_str(), "lookup-complete");
    }

    #[test]
    fn test_blank_session_is_absent() {
        let record = EvalRecord::new(10, EvalKind::Eval, "1", SourceContext::new())
            .with_session(Some(String::new()));
        assert_eq!(record.session, None);
    }
}
