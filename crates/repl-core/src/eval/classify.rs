//! Deciding what a response means for the eval it belongs to.

use super::lookup::LookupInfo;
use super::record::{EvalFailure, EvalRecord, SourceLocation};
use crate::codec::Value;
use crate::protocol::{keys, status, Response};
use std::time::Duration;

/// Fields added by the server-side middleware.
mod fields {
    pub const TIME_TAKEN: &str = "time-taken";
    pub const ROOT_EX_CLASS: &str = "root-ex-class";
    pub const ROOT_EX_MSG: &str = "root-ex-msg";
    pub const ROOT_EX_DATA: &str = "root-ex-data";
    pub const LINE: &str = "line";
    pub const COLUMN: &str = "column";
    pub const SOURCE: &str = "source";
    pub const TRACE: &str = "trace";
}

/// The first handler that claims a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    NewSession(String),
    Value {
        value: String,
        elapsed: Option<Duration>,
    },
    Exception(EvalFailure),
    Lookup(Option<LookupInfo>),
    /// `done` arrived before any outcome.
    DoneWithoutOutcome,
    Ignored,
}

/// Classify `resp` against its record. Priority: new-session, value,
/// exception, lookup info, bare `done`.
pub fn classify(resp: &Response, record: &EvalRecord, namespace: &str) -> Routed {
    if let Some(session) = resp.get_str(keys::NEW_SESSION) {
        return Routed::NewSession(session.to_string());
    }

    if let Some(value) = resp.get(keys::VALUE) {
        return Routed::Value {
            value: text_of(value),
            elapsed: elapsed(resp, namespace),
        };
    }

    if let Some(failure) = classify_exception(resp, namespace, record.context.namespace()) {
        return Routed::Exception(failure);
    }

    if let Some(info) = resp.get(keys::INFO) {
        return Routed::Lookup(LookupInfo::from_value(info));
    }

    if resp.is_done() && !record.status.has_outcome() {
        return Routed::DoneWithoutOutcome;
    }

    Routed::Ignored
}

/// Exception text, first match wins: structured root cause, `root-ex`, `ex`,
/// then a missing namespace.
pub fn classify_exception(
    resp: &Response,
    namespace: &str,
    eval_ns: &str,
) -> Option<EvalFailure> {
    let field = |key| resp.middleware_field(namespace, key);
    let text = |key| field(key).and_then(Value::as_str).filter(|s| !s.is_empty());

    if let (Some(class), Some(msg)) = (text(fields::ROOT_EX_CLASS), text(fields::ROOT_EX_MSG)) {
        let mut message = format!("{}: {}", class, msg);
        if let Some(data) = text(fields::ROOT_EX_DATA) {
            message.push(' ');
            message.push_str(data);
        }

        let line = field(fields::LINE).and_then(Value::as_int);
        let column = field(fields::COLUMN).and_then(Value::as_int);
        let source = text(fields::SOURCE).map(str::to_string);

        if let (Some(line), Some(column), Some(source)) = (line, column, &source) {
            message.push_str(&format!(" ({}:{}:{})", source, line, column));
        }

        let location = match (line, column) {
            (Some(line), Some(column)) => Some(SourceLocation {
                line: to_u32(line).saturating_sub(1),
                column: to_u32(column),
                source,
            }),
            _ => None,
        };

        return Some(EvalFailure {
            message,
            trace: text(fields::TRACE).map(str::to_string),
            location,
        });
    }

    if let Some(root) = resp.get_str(keys::ROOT_EX) {
        return Some(EvalFailure::new(root));
    }

    if let Some(ex) = resp.get_str(keys::EX) {
        return Some(EvalFailure::new(ex));
    }

    if resp.has_status(status::NAMESPACE_NOT_FOUND) {
        let ns = resp
            .get_str(keys::NS)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(eval_ns);
        return Some(EvalFailure::new(format!("Namespace not found: {}", ns)));
    }

    None
}

fn elapsed(resp: &Response, namespace: &str) -> Option<Duration> {
    resp.middleware_field(namespace, fields::TIME_TAKEN)
        .and_then(Value::as_int)
        .and_then(|nanos| u64::try_from(nanos).ok())
        .map(Duration::from_nanos)
}

fn text_of(value: &Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}

fn to_u32(n: i64) -> u32 {
    u32::try_from(n.max(0)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::record::{EvalKind, EvalStatus, SourceContext};

    const MW: &str = "repl-link.middleware";

    fn record() -> EvalRecord {
        EvalRecord::new(10, EvalKind::Eval, "(/ 1 0)", SourceContext::new().in_ns("app.core"))
    }

    fn resp(value: Value) -> Response {
        Response::from_value(value.with("id", 10i64)).unwrap()
    }

    #[test]
    fn test_new_session_wins_over_value() {
        let r = resp(Value::dict().with("new-session", "child").with("value", "1"));
        assert_eq!(classify(&r, &record(), MW), Routed::NewSession("child".into()));
    }

    #[test]
    fn test_value_with_elapsed() {
        let r = resp(
            Value::dict()
                .with("value", "3")
                .with(format!("{}/time-taken", MW).as_str(), 1_500_000i64),
        );
        assert_eq!(
            classify(&r, &record(), MW),
            Routed::Value {
                value: "3".into(),
                elapsed: Some(Duration::from_micros(1500)),
            }
        );
    }

    #[test]
    fn test_structured_exception_summary() {
        let r = resp(
            Value::dict()
                .with("root-ex-class", "ArithmeticException")
                .with("root-ex-msg", "Divide by zero"),
        );
        let Routed::Exception(failure) = classify(&r, &record(), MW) else {
            panic!("expected exception");
        };
        assert_eq!(failure.message, "ArithmeticException: Divide by zero");
        assert_eq!(failure.trace, None);
        assert_eq!(failure.location, None);
    }

    #[test]
    fn test_structured_exception_wins_over_raw_fields() {
        let r = resp(
            Value::dict()
                .with("ex", "class java.lang.ArithmeticException")
                .with("root-ex", "class java.lang.ArithmeticException")
                .with("root-ex-class", "ArithmeticException")
                .with("root-ex-msg", "Divide by zero")
                .with("status", vec!["eval-error"]),
        );
        let Routed::Exception(failure) = classify(&r, &record(), MW) else {
            panic!("expected exception");
        };
        assert_eq!(failure.message, "ArithmeticException: Divide by zero");
    }

    #[test]
    fn test_structured_exception_with_data_and_location() {
        let r = resp(
            Value::dict()
                .with(format!("{}/root-ex-class", MW).as_str(), "ExceptionInfo")
                .with(format!("{}/root-ex-msg", MW).as_str(), "boom")
                .with(format!("{}/root-ex-data", MW).as_str(), "{:a 1}")
                .with(format!("{}/line", MW).as_str(), 3i64)
                .with(format!("{}/column", MW).as_str(), 5i64)
                .with(format!("{}/source", MW).as_str(), "core.clj")
                .with(format!("{}/trace", MW).as_str(), "at core.clj:3"),
        );
        let failure = classify_exception(&r, MW, "user").unwrap();
        assert_eq!(failure.message, "ExceptionInfo: boom {:a 1} (core.clj:3:5)");
        assert_eq!(failure.trace.as_deref(), Some("at core.clj:3"));
        assert_eq!(
            failure.location,
            Some(SourceLocation {
                line: 2,
                column: 5,
                source: Some("core.clj".into()),
            })
        );
    }

    #[test]
    fn test_root_ex_before_ex() {
        let r = resp(Value::dict().with("root-ex", "class java.lang.Root").with("ex", "class Wrapper"));
        assert_eq!(
            classify_exception(&r, MW, "user").unwrap().message,
            "class java.lang.Root"
        );

        let r = resp(Value::dict().with("ex", "class Wrapper"));
        assert_eq!(classify_exception(&r, MW, "user").unwrap().message, "class Wrapper");
    }

    #[test]
    fn test_namespace_not_found() {
        let r = resp(
            Value::dict()
                .with("ns", "missing.ns")
                .with("status", vec!["namespace-not-found", "done"]),
        );
        assert_eq!(
            classify(&r, &record(), MW),
            Routed::Exception(EvalFailure::new("Namespace not found: missing.ns"))
        );

        let r = resp(Value::dict().with("status", vec!["namespace-not-found"]));
        assert_eq!(
            classify_exception(&r, MW, "app.core").unwrap().message,
            "Namespace not found: app.core"
        );
    }

    #[test]
    fn test_lookup_info() {
        let r = resp(Value::dict().with("info", Value::dict()));
        assert_eq!(classify(&r, &record(), MW), Routed::Lookup(None));
    }

    #[test]
    fn test_done_depends_on_outcome() {
        let r = resp(Value::dict().with("status", vec!["done"]));
        assert_eq!(classify(&r, &record(), MW), Routed::DoneWithoutOutcome);

        let mut interrupted = record();
        interrupted.status = EvalStatus::Interrupted;
        assert_eq!(classify(&r, &interrupted, MW), Routed::DoneWithoutOutcome);

        let mut finished = record();
        finished.status = EvalStatus::Succeeded;
        assert_eq!(classify(&r, &finished, MW), Routed::Ignored);
    }

    #[test]
    fn test_output_is_ignored() {
        let r = resp(Value::dict().with("out", "hello\n"));
        assert_eq!(classify(&r, &record(), MW), Routed::Ignored);
    }
}
