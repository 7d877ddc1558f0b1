//! Startup configuration: socket path, log verbosity, socket activation.

use std::env;

/// Default location of the proxy's listening socket when no positional
/// argument overrides it.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/cc-oci-runtime/proxy.sock";

/// Resolves the socket path from the first positional argument, if any.
pub fn socket_path(args: &[String]) -> String {
    args.get(1)
        .cloned()
        .unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_string())
}

/// Reads `CC_PROXY_LOG_LEVEL` and builds an `env_logger` filter string.
///
/// The variable holds an integer verbosity (0=error .. 4=trace). Absent or
/// unparsable values fall back to `RUST_LOG`, and ultimately to `info`.
pub fn log_filter() -> String {
    match env::var("CC_PROXY_LOG_LEVEL").ok().and_then(|v| v.parse::<u8>().ok()) {
        Some(0) => "error".to_string(),
        Some(1) => "warn".to_string(),
        Some(2) => "info".to_string(),
        Some(3) => "debug".to_string(),
        Some(_) => "trace".to_string(),
        None => env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
    }
}
