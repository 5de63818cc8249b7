//! Shared tracing setup: stdout (env-filter controlled) plus an optional rolling file
//! appender under `$XDG_STATE_HOME/<app_name>/` (falls back to `~/.local/state/<app_name>/`).
//!
//! Feature-gated (`tracing-init`) so lean consumers of `config` don't pull in
//! `tracing-subscriber`/`tracing-appender`.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directory used for rolling log files: `$XDG_STATE_HOME/<app_name>` or
/// `~/.local/state/<app_name>` if `XDG_STATE_HOME` is unset.
fn state_dir(app_name: &str) -> Option<PathBuf> {
    let base = cross_xdg::BaseDirs::new().ok()?;
    Some(base.state_home().join(app_name))
}

/// Initializes a global tracing subscriber: stdout writer (respecting `RUST_LOG`, default
/// `info`) plus a daily-rolling file appender under the app's state directory named
/// `<app_name>.log`.
///
/// Returns the `WorkerGuard` for the file appender; the caller must keep it alive for the
/// process lifetime (dropping it flushes and stops the background writer thread).
///
/// Call once at process start. A second call on the same process will return an error from
/// the global subscriber registration, which is logged and ignored (tests may call this
/// more than once across different test binaries, never within one).
pub fn init_tracing(app_name: &str) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match state_dir(app_name) {
        Some(dir) => {
            if std::fs::create_dir_all(&dir).is_err() {
                (None, None)
            } else {
                let appender = tracing_appender::rolling::daily(&dir, format!("{app_name}.log"));
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer().with_writer(writer).with_ansi(false);
                (Some(layer), Some(guard))
            }
        }
        None => (None, None),
    };

    let stdout_layer = fmt::layer().with_target(true);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    let result = match file_layer {
        Some(layer) => registry.with(layer).try_init(),
        None => registry.try_init(),
    };

    if let Err(e) = result {
        eprintln!("tracing already initialized: {e}");
    }

    guard
}
