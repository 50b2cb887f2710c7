//! Text for eval outcomes.

use repl_link::{EvalEventKind, LookupInfo};
use std::time::Duration;

/// `850µs`, `12ms`, `1.50s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    if elapsed < Duration::from_millis(1) {
        format!("{}µs", elapsed.as_micros())
    } else if elapsed < Duration::from_secs(1) {
        format!("{}ms", elapsed.as_millis())
    } else {
        format!("{:.2}s", elapsed.as_secs_f64())
    }
}

pub fn format_lookup(info: &LookupInfo) -> String {
    let mut lines = vec![info.qualified_name()];
    if let Some(arglists) = info.arglists_display() {
        lines.push(arglists.to_string());
    }
    lines.extend(info.forms.iter().cloned());
    if let Some(doc) = &info.doc {
        lines.push(format!("  {}", doc));
    }
    if let Some(file) = &info.file {
        lines.push(file.clone());
    }
    lines.join("\n")
}

/// Render a terminal outcome. `Err` carries text for a failed eval.
pub fn render_outcome(kind: &EvalEventKind) -> Result<String, String> {
    match kind {
        EvalEventKind::Succeeded { value, elapsed } => Ok(match elapsed {
            Some(elapsed) => format!("{} ({})", value, format_elapsed(*elapsed)),
            None => value.clone(),
        }),
        EvalEventKind::Failed(failure) => Err(failure.message.clone()),
        EvalEventKind::LookupComplete(Some(info)) => Ok(format_lookup(info)),
        EvalEventKind::LookupComplete(None) => Err("Symbol not found".to_string()),
        EvalEventKind::Canceled => Err("Canceled".to_string()),
        other => Err(format!("Unexpected outcome: {:?}", other)),
    }
}
