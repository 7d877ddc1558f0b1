//! Listening socket setup: either inherited via socket activation or
//! created fresh at a configured path.

use std::fs;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener as StdUnixListener;

use crate::error::ListenError;

/// First inherited descriptor under the systemd-style activation protocol.
const SD_LISTEN_FDS_START: RawFd = 3;

/// Returns the file descriptors handed down via socket activation, if any.
///
/// Follows the `LISTEN_PID`/`LISTEN_FDS` convention: `LISTEN_PID` must match
/// our own pid (otherwise the environment wasn't meant for us and we ignore
/// it), `LISTEN_FDS` gives the count of descriptors starting at fd 3.
fn activated_fds() -> Vec<RawFd> {
    let pid_matches = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .map(|pid| pid == std::process::id() as i32)
        .unwrap_or(false);

    if !pid_matches {
        return Vec::new();
    }

    let count = std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0);

    (0..count).map(|i| SD_LISTEN_FDS_START + i).collect()
}

/// Brings up the listening socket: reuses an activated descriptor if present,
/// otherwise creates one at `path` with mode 0666.
pub fn bind_or_activate(path: &str) -> Result<tokio::net::UnixListener, ListenError> {
    let fds = activated_fds();

    let std_listener = if fds.len() > 1 {
        return Err(ListenError::TooManyActivatedSockets(fds.len()));
    } else if fds.len() == 1 {
        // SAFETY: fd 3 is owned by us per the activation protocol and not
        // used elsewhere before this point.
        let listener = unsafe { StdUnixListener::from_raw_fd(fds[0]) };
        listener
            .set_nonblocking(true)
            .map_err(ListenError::ActivatedListen)?;
        listener
    } else {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(ListenError::RemoveExisting(err));
            }
        }
        let listener = StdUnixListener::bind(path).map_err(ListenError::Bind)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o666)).map_err(ListenError::Chmod)?;
        listener.set_nonblocking(true).map_err(ListenError::Bind)?;
        listener
    };

    tokio::net::UnixListener::from_std(std_listener).map_err(ListenError::Bind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activated_fds_empty_without_matching_pid() {
        std::env::remove_var("LISTEN_PID");
        std::env::remove_var("LISTEN_FDS");
        assert!(activated_fds().is_empty());
    }

    #[tokio::test]
    async fn bind_creates_socket_with_world_rw_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        let listener = bind_or_activate(path.to_str().unwrap()).unwrap();
        drop(listener);
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o666);
    }
}
