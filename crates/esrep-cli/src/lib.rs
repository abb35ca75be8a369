//! Plumbing shared by the `esrep` and `esbackup` binaries: logging, signal
//! handling, configuration and the JSON response printed on stdout.

pub mod callback;
pub mod commands;

use clap::Args;
use esrep_core::action::unix_now;
use esrep_core::{install_signal_handlers, Fields, Response, ERR_UNKNOWN};
use esrep_driver::CancelToken;
use esrep_types::EsrepConfig;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::warn;

/// Options accepted by every subcommand of both binaries.
#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Path to the configuration file (default: $ESREP_CONFIG, then
    /// /opt/erigones/etc/esrep.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    pub verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    pub trace: bool,
}

/// Exit quietly when stdout goes away mid-print.
pub fn install_pipe_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));
}

/// Log to stderr; stdout carries only JSON.
pub fn init_logging(global: &GlobalArgs) {
    let default_level = if global.trace {
        "trace"
    } else if global.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("ESREP_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

/// Token raised by SIGINT and SIGTERM.
pub fn cancel_token() -> CancelToken {
    let token = CancelToken::new();
    if let Err(e) = install_signal_handlers(&token) {
        warn!("signals will not cancel the running action: {e}");
    }
    token
}

pub fn load_config(path: Option<&Path>) -> Result<EsrepConfig, String> {
    EsrepConfig::resolve(path).map_err(|e| format!("Invalid configuration: {e}"))
}

/// Error response for failures that happen before an engine action starts.
pub fn failure(msg: impl Into<String>) -> Response {
    let now = unix_now();
    Response {
        rc: ERR_UNKNOWN,
        success: false,
        msg: Some(msg.into()),
        fields: Fields::new(),
        time_started: now,
        time_ended: now,
        time_elapsed: 0,
    }
}

/// Print the response and exit with its rc.
pub fn emit(response: &Response) -> ExitCode {
    match commands::json_pretty(response) {
        Ok(json) => {
            println!("{json}");
            ExitCode::from(response.exit_code())
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(commands::EXIT_FAILURE)
        }
    }
}

/// Exit status of the auxiliary (non-engine) commands.
pub fn exit_with(result: Result<u8, String>) -> ExitCode {
    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(commands::EXIT_FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_is_an_unknown_error() {
        let response = failure("boom");
        assert_eq!(response.rc, ERR_UNKNOWN);
        assert!(!response.success);
        assert_eq!(response.msg.as_deref(), Some("boom"));
        assert_eq!(response.exit_code(), 99);
        assert_eq!(response.time_elapsed, 0);
    }
}
