//! Centralized configuration for repl-link.
//!
//! Wire limits and connection constants live in unit structs with associated
//! consts. User-tunable behavior lives in [`Settings`], which is loaded from a
//! JSON file and defaults every field.

use crate::error::{ReplError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Limits enforced by the bencode codec.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Largest byte string the decoder accepts.
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024; // 64MB
    /// Deepest list/dict nesting the decoder accepts.
    pub const MAX_NESTING_DEPTH: usize = 512;
    /// Bytes requested from the socket per read.
    pub const READ_CHUNK_SIZE: usize = 4096;
    /// Appended to every value listed in a message's truncated keys.
    pub const TRUNCATION_MARKER: &'static str = "...";
    pub const TRUNCATED_KEYS: &'static str = "nrepl.middleware.print/truncated-keys";
}

/// Connection and handshake constants.
pub struct ConnectionConfig;

impl ConnectionConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;
    pub const DEFAULT_HOST: &'static str = "localhost";
    pub const PORT_FILE_NAME: &'static str = ".nrepl-port";

    // Handshake request ids. Eval ids start above them so the two never collide.
    pub const CLONE_ID: u64 = 1;
    pub const LOAD_MIDDLEWARE_ID: u64 = 2;
    pub const ADD_MIDDLEWARE_WITH_INIT_ID: u64 = 3;
    pub const ADD_MIDDLEWARE_ID: u64 = 4;
    pub const SHARED_INIT_ID: u64 = 4;
    pub const HOST_INIT_ID: u64 = 2;
    pub const FIRST_EVAL_ID: u64 = 10;

    pub const DEFAULT_NAMESPACE: &'static str = "user";
    pub const NO_SOURCE_FILE: &'static str = "NO_SOURCE_FILE.cljc";
}

/// Progress indicator defaults.
pub struct ProgressConfig;

impl ProgressConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_PHASES: &'static [&'static str] =
        &["🌑", "🌒", "🌓", "🌔", "🌕", "🌖", "🌗", "🌘"];
}

/// Server-side middleware uploaded during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MiddlewareSettings {
    /// Namespace the middleware source defines. Response fields added by the
    /// middleware are keyed `<namespace>/<field>`.
    pub namespace: String,
    /// File holding the middleware source text sent with `load-file`.
    pub source_path: Option<PathBuf>,
    /// Unqualified middleware var names, activated in this order.
    pub names: Vec<String>,
    /// Extra namespaces to require when activating. Empty means `[namespace]`.
    pub extra_namespaces: Vec<String>,
    /// Print quota passed to the print middleware.
    pub print_quota: i64,
}

impl Default for MiddlewareSettings {
    fn default() -> Self {
        Self {
            namespace: "repl-link.middleware".to_string(),
            source_path: None,
            names: vec![
                "clone-and-eval".to_string(),
                "time-eval".to_string(),
                "wrap-errors".to_string(),
                "wrap-output".to_string(),
            ],
            extra_namespaces: Vec::new(),
            print_quota: 4096,
        }
    }
}

impl MiddlewareSettings {
    /// Fully qualified middleware names, in activation order.
    pub fn qualified_names(&self) -> Vec<String> {
        self.names
            .iter()
            .map(|name| self.qualify(name))
            .collect()
    }

    /// Namespaces to pass as `extra-namespaces`.
    pub fn extra_namespaces(&self) -> Vec<String> {
        if self.extra_namespaces.is_empty() {
            vec![self.namespace.clone()]
        } else {
            self.extra_namespaces.clone()
        }
    }

    /// Qualify a var or response key with the middleware namespace.
    pub fn qualify(&self, name: &str) -> String {
        format!("{}/{}", self.namespace, name)
    }
}

/// User settings for a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    /// Code evaluated once after the middleware is active.
    pub eval_shared: Option<String>,
    /// Evaluate in the primary session instead of a private child session.
    pub eval_in_session: bool,
    /// Labels cycled through while evaluations are pending.
    pub progress_phases: Vec<String>,
    /// Delay between progress ticks.
    pub progress_interval_ms: u64,
    /// Verbose wire logging.
    pub debug: bool,
    pub middleware: MiddlewareSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            eval_shared: None,
            eval_in_session: false,
            progress_phases: ProgressConfig::DEFAULT_PHASES
                .iter()
                .map(|phase| phase.to_string())
                .collect(),
            progress_interval_ms: ProgressConfig::DEFAULT_INTERVAL.as_millis() as u64,
            debug: false,
            middleware: MiddlewareSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ReplError::Io {
            message: format!("Failed to read settings {}: {}", path.display(), e),
            source: Some(e),
        })?;
        Self::from_json_str(&text)
    }

    /// Parse settings from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.progress_interval_ms == 0 && self.progress_phases.len() > 1 {
            return Err(ReplError::config("progress_interval_ms must be positive"));
        }
        if self.middleware.namespace.trim().is_empty() {
            return Err(ReplError::config("middleware.namespace must not be empty"));
        }
        Ok(())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Shared init code, treating blank text as absent.
    pub fn shared_init_code(&self) -> Option<&str> {
        self.eval_shared
            .as_deref()
            .filter(|code| !code.trim().is_empty())
    }

    /// Read the middleware source text to upload.
    pub fn middleware_source(&self) -> Result<String> {
        let path = self.middleware.source_path.as_ref().ok_or_else(|| {
            ReplError::config("middleware.source_path is required for the clojure profile")
        })?;
        std::fs::read_to_string(path).map_err(|e| ReplError::Io {
            message: format!("Failed to read middleware {}: {}", path.display(), e),
            source: Some(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_reasonable() {
        let settings = Settings::default();
        assert!(settings.progress_phases.len() > 1);
        assert_eq!(settings.progress_interval(), Duration::from_millis(100));
        assert!(ConnectionConfig::FIRST_EVAL_ID > ConnectionConfig::ADD_MIDDLEWARE_ID);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings = Settings::from_json_str(
            r#"{"eval_shared": "(require 'clojure.repl)", "middleware": {"namespace": "my.mw"}}"#,
        )
        .unwrap();

        assert_eq!(settings.shared_init_code(), Some("(require 'clojure.repl)"));
        assert!(!settings.eval_in_session);
        assert_eq!(settings.middleware.namespace, "my.mw");
        assert_eq!(settings.middleware.print_quota, 4096);
        assert_eq!(
            settings.middleware.qualified_names()[0],
            "my.mw/clone-and-eval"
        );
        assert_eq!(settings.middleware.extra_namespaces(), vec!["my.mw".to_string()]);
    }

    #[test]
    fn test_blank_shared_code_is_absent() {
        let settings = Settings {
            eval_shared: Some("   ".to_string()),
            ..Settings::default()
        };
        assert_eq!(settings.shared_init_code(), None);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let result = Settings::from_json_str(r#"{"progress_interval_ms": 0}"#);
        assert!(matches!(result, Err(ReplError::Config { .. })));

        let result = Settings::from_json_str("not json");
        assert!(matches!(result, Err(ReplError::Json { .. })));
    }

    #[test]
    fn test_load_from_file_and_middleware_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let mw_path = dir.path().join("middleware.clj");
        std::fs::write(&mw_path, "(ns my.mw)").unwrap();

        let settings_path = dir.path().join("settings.json");
        let json = serde_json::json!({
            "middleware": {"namespace": "my.mw", "source_path": mw_path}
        });
        std::fs::write(&settings_path, json.to_string()).unwrap();

        let settings = Settings::load(&settings_path).unwrap();
        assert_eq!(settings.middleware_source().unwrap(), "(ns my.mw)");
    }

    #[test]
    fn test_missing_middleware_source_is_config_error() {
        let settings = Settings::default();
        assert!(matches!(
            settings.middleware_source(),
            Err(ReplError::Config { .. })
        ));
    }
}
