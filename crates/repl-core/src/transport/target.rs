use crate::config::ConnectionConfig;
use crate::error::{ReplError, Result};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static HOST_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-zA-Z0-9.]+):(\d{1,5})$").expect("host:port regex must compile"));

static PORT_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[1-9][0-9]*$").expect("port file regex must compile"));

/// Where the REPL server listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectTarget {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl ConnectTarget {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ConnectTarget::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`; anything else is taken as a socket path.
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(ReplError::config("Empty connection address"));
        }
        if let Some(caps) = HOST_PORT.captures(address) {
            let port = parse_port(&caps[2])?;
            return Ok(Self::tcp(&caps[1], port));
        }
        Ok(ConnectTarget::Unix(PathBuf::from(address)))
    }

    /// A host selects TCP with `port_or_path` as the port; no host means
    /// `port_or_path` is a socket path.
    pub fn from_parts(host: Option<&str>, port_or_path: &str) -> Result<Self> {
        match host.filter(|h| !h.is_empty()) {
            Some(host) => Ok(Self::tcp(host, parse_port(port_or_path)?)),
            None if port_or_path.is_empty() => {
                Err(ReplError::config("Empty socket path"))
            }
            None => Ok(ConnectTarget::Unix(PathBuf::from(port_or_path))),
        }
    }

    /// Read the port a running server left in `dir/.nrepl-port`.
    pub fn discover(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(ConnectionConfig::PORT_FILE_NAME);
        let contents = std::fs::read_to_string(&path).map_err(|e| ReplError::Io {
            message: format!("Failed to read port file {}: {}", path.display(), e),
            source: Some(e),
        })?;
        let port = contents.trim();
        if !PORT_FILE.is_match(port) {
            return Err(ReplError::config(format!(
                "Port file {} does not contain a port",
                path.display()
            )));
        }
        Ok(Self::tcp(ConnectionConfig::DEFAULT_HOST, parse_port(port)?))
    }

    /// Label shown once connected.
    pub fn connected_label(&self) -> String {
        format!("🌕 {}", self)
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectTarget::Tcp { host, port } => write!(f, "{}:{}", host, port),
            ConnectTarget::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

fn parse_port(text: &str) -> Result<u16> {
    match text.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ReplError::config(format!("Invalid port: {}", text))),
    }
}
