pub mod config;
pub mod dispatch;
pub mod errors;
pub mod normalize;
pub mod upstream;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub use config::{find_config_path, load_config, BridgeConfig, TransportKind};
pub use dispatch::{Bridge, BridgeOptions, DispatchOutput, ToolBehavior, ToolEntry, ToolTable};
pub use errors::{BridgeError, ErrorBody};
pub use normalize::{CanonicalResult, NormalizedSearchResponse};

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "brightbridge=info,warn";

/// Number of rotated log files kept next to the live one.
const KEEP_ROTATED_LOGS: u32 = 3;

/// Initialize the tracing subscriber.
///
/// Stdout carries the call protocol, so logs go to stderr unless `log_file`
/// is set. A log file is rotated on startup (`bridge.log` → `.1` → `.2` →
/// `.3`) and each event is written straight to the unbuffered file.
pub fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let installed = match log_file {
        Some(path) => builder
            .with_writer(Mutex::new(open_log_file(path)?))
            .with_ansi(false)
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_file.map(|p| p.display().to_string()),
        pid = std::process::id(),
        "=== brightbridge starting ==="
    );
    Ok(())
}

/// Rotate any previous log at `path` and open a fresh one.
fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    shift_rotated_logs(path, KEEP_ROTATED_LOGS);
    OpenOptions::new().create(true).append(true).open(path)
}

/// `bridge.log.{n}` for the log at `path`.
fn rotated_name(path: &Path, n: u32) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Shift `path` into slot 1, slot n into n+1, and drop whatever was in slot
/// `keep`. Missing slots are fine; rename errors only cost history.
fn shift_rotated_logs(path: &Path, keep: u32) {
    let _ = std::fs::remove_file(rotated_name(path, keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(rotated_name(path, n), rotated_name(path, n + 1));
    }
    let _ = std::fs::rename(path, rotated_name(path, 1));
}
