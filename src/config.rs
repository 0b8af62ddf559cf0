//! Bridge configuration loading and validation.
//!
//! Reads a YAML file and resolves environment variables. The endpoint URL and
//! bearer credential are usually injected as `${BRIGHTDATA_MCP_URL}` and
//! `${BRIGHTDATA_API_TOKEN}` so secrets never live in the file itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::ToolEntry;
use crate::errors::BridgeError;
use crate::upstream::{SessionMode, SessionOptions};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "BRIGHTBRIDGE_CONFIG";

/// File name searched for in the working directory.
const LOCAL_CONFIG_FILE: &str = "brightbridge.yaml";

// ─── Public Types ────────────────────────────────────────────────────────────

/// How envelopes travel to the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// One HTTP POST per request.
    Http,
    /// Persistent Server-Sent Events stream.
    Sse,
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Upstream endpoint URL (POST target for `http`, stream URL for `sse`).
    pub endpoint: String,
    /// Bearer credential sent with every upstream request.
    pub credential: String,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default = "default_mode")]
    pub mode: SessionMode,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Default per-call bound; callers may override per invocation.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Maximum concurrent sub-calls of one batch fan-out.
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
    /// Whether the stream transport may carry several calls at once.
    #[serde(default = "default_multiplex")]
    pub multiplex: bool,
    /// Log to this file instead of stderr.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Replaces the built-in tool table when set.
    #[serde(default)]
    pub tools: Option<Vec<ToolEntry>>,
}

fn default_transport() -> TransportKind {
    TransportKind::Sse
}
fn default_mode() -> SessionMode {
    SessionMode::Persistent
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_batch_concurrency() -> usize {
    4
}
fn default_multiplex() -> bool {
    true
}

impl BridgeConfig {
    /// Minimal config with defaults, mainly for embedding and tests.
    pub fn new(endpoint: &str, credential: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            credential: credential.to_string(),
            transport: default_transport(),
            mode: default_mode(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            batch_concurrency: default_batch_concurrency(),
            multiplex: default_multiplex(),
            log_file: None,
            tools: None,
        }
    }

    /// Check required fields and bounds.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.endpoint.trim().is_empty() {
            return Err(config_error("endpoint must be a non-empty URL"));
        }
        if self.credential.trim().is_empty() {
            return Err(config_error("credential must be a non-empty string"));
        }
        if self.handshake_timeout_ms == 0 || self.call_timeout_ms == 0 {
            return Err(config_error("timeouts must be greater than zero"));
        }
        if self.batch_concurrency == 0 {
            return Err(config_error("batch_concurrency must be at least 1"));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            mode: self.mode,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }
}

fn config_error(reason: impl Into<String>) -> BridgeError {
    BridgeError::Config {
        reason: reason.into(),
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Order: `BRIGHTBRIDGE_CONFIG`, then `brightbridge.yaml` in `start`, then
/// `<config dir>/brightbridge/config.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, BridgeError> {
    // 1. Check env var
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        return Err(config_error(format!(
            "{CONFIG_ENV_VAR} points to missing file {}",
            candidate.display()
        )));
    }

    // 2. Working directory
    let local = start.join(LOCAL_CONFIG_FILE);
    if local.exists() {
        return Ok(local);
    }

    // 3. Platform config directory
    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("brightbridge").join("config.yaml");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(config_error(format!(
        "could not find {LOCAL_CONFIG_FILE} (set {CONFIG_ENV_VAR} to point at a config file)"
    )))
}

/// Load, interpolate, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<BridgeConfig, BridgeError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;
    parse_config(&raw)
}

/// Parse config text after `${VAR}` interpolation.
pub fn parse_config(raw: &str) -> Result<BridgeConfig, BridgeError> {
    let interpolated = interpolate_env_vars(raw);

    let config: BridgeConfig = serde_yaml::from_str(&interpolated)
        .map_err(|e| config_error(format!("failed to parse config: {e}")))?;

    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
///
/// An unterminated `${` is kept as written.
fn interpolate_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        let expr_start = open + 2;
        let Some(len) = rest[expr_start..].find('}') else {
            break;
        };
        out.push_str(&rest[..open]);
        out.push_str(&resolve_var_expr(&rest[expr_start..expr_start + len]));
        rest = &rest[expr_start + len + 1..];
    }

    out.push_str(rest);
    out
}

/// `VAR` resolves to its value or nothing. `VAR:-default` falls back to the
/// tilde-expanded default when `VAR` is unset or empty.
fn resolve_var_expr(expr: &str) -> String {
    let (name, default) = match expr.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (expr, None),
    };
    let value = std::env::var(name).ok().filter(|v| !v.is_empty());

    match (value, default) {
        (Some(value), _) => value,
        (None, Some(default)) => expand_tilde(default),
        (None, None) => String::new(),
    }
}

/// Expand `~` and `~/...` to the home directory. `~user` forms are left alone.
fn expand_tilde(path: &str) -> String {
    let expanded = if path == "~" {
        dirs::home_dir()
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir().map(|home| home.join(rest))
    } else {
        None
    };
    expanded.map_or_else(|| path.to_string(), |p| p.to_string_lossy().into_owned())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
