//! Client for the BTS's textual command socket.
//!
//! The stack exposes its CLI over a Unix datagram socket; one datagram out,
//! one reply back. The protocol has no status codes, so failure is detected
//! heuristically by scanning the reply for the stack's known error phrases.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::net::UnixDatagram;
use tokio::time::{timeout, Duration};

/// Reply phrases that mean the command was not accepted.
const FAILURE_MARKERS: [&str; 5] = [
    "wrong number of arguments",
    "bad argument(s)",
    "command not found",
    "too many arguments for parser",
    "command failed",
];

/// Seconds to wait for a reply before giving up on a command.
const REPLY_TIMEOUT_SECS: u64 = 5;

const MAX_REPLY_BYTES: usize = 64 * 1024;

static SOCKET_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum CliError {
    #[error("command socket: {0}")]
    Io(#[from] std::io::Error),
    #[error("no reply to {command:?} within {REPLY_TIMEOUT_SECS}s")]
    Timeout { command: String },
    #[error("command {command:?} rejected: {reply}")]
    CommandFailed { command: String, reply: String },
}

/// One BTS command socket. Binds its own reply socket next to the system
/// temp directory; the bound path is removed on drop.
pub struct CmdSocket {
    server: PathBuf,
    local_path: PathBuf,
    sock: UnixDatagram,
}

impl CmdSocket {
    pub fn connect<P: AsRef<Path>>(server: P) -> Result<Self, CliError> {
        let seq = SOCKET_SEQ.fetch_add(1, Ordering::Relaxed);
        let local_path =
            std::env::temp_dir().join(format!("gsmws-cli-{}-{}.sock", std::process::id(), seq));
        let _ = std::fs::remove_file(&local_path);
        let sock = UnixDatagram::bind(&local_path)?;
        Ok(Self {
            server: server.as_ref().to_path_buf(),
            local_path,
            sock,
        })
    }

    /// Run one CLI command and return its reply text.
    pub async fn command(&self, cmd: &str) -> Result<String, CliError> {
        self.sock.send_to(cmd.as_bytes(), &self.server).await?;

        let mut buf = vec![0u8; MAX_REPLY_BYTES];
        let n = timeout(
            Duration::from_secs(REPLY_TIMEOUT_SECS),
            self.sock.recv(&mut buf),
        )
        .await
        .map_err(|_| CliError::Timeout {
            command: cmd.to_string(),
        })??;

        let reply = String::from_utf8_lossy(&buf[..n]).trim().to_string();
        if let Some(marker) = FAILURE_MARKERS.iter().find(|m| reply.contains(**m)) {
            return Err(CliError::CommandFailed {
                command: cmd.to_string(),
                reply: format!("{marker} ({reply})"),
            });
        }
        Ok(reply)
    }
}

impl Drop for CmdSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local_path);
    }
}
