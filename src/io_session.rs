//! One client's private stdio pipe into a VM's I/O channel.

use std::sync::Arc;

use log::warn;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinSet};

use crate::frame::{read_tty_frame, write_tty_frame};

/// Binds a contiguous range `[io_base, io_base + n_streams)` of I/O-channel
/// sequence numbers to one client's socket.
///
/// `n_streams` is 1 (stdin/stdout share `io_base`) or 2 (stderr gets
/// `io_base + 1`); either way a single client socket carries every stream in
/// the range, demultiplexed by the tty frame header.
#[derive(Debug)]
pub struct IoSession {
    pub io_base: u64,
    pub n_streams: u64,
    pub client_id: u64,
    client_write: Mutex<OwnedWriteHalf>,
    pump: AbortHandle,
}

impl IoSession {
    /// Splits `socket` into read/write halves, spawns the stdin pump onto
    /// `tasks`, and returns the new session.
    pub fn spawn(
        io_base: u64,
        n_streams: u64,
        client_id: u64,
        socket: UnixStream,
        agent_io_write: Arc<Mutex<OwnedWriteHalf>>,
        tasks: &mut JoinSet<()>,
    ) -> Arc<Self> {
        let (read_half, write_half) = socket.into_split();
        let pump = tasks.spawn(pump_loop(read_half, io_base, agent_io_write));

        Arc::new(Self {
            io_base,
            n_streams,
            client_id,
            client_write: Mutex::new(write_half),
            pump,
        })
    }

    /// Writes an already-encoded tty frame (header + body) to the client.
    pub async fn write_frame(&self, encoded: &[u8]) -> std::io::Result<()> {
        self.client_write.lock().await.write_all(encoded).await
    }

    /// Ends the pump and shuts down the client-facing socket.
    pub async fn close(&self) {
        self.pump.abort();
        let _ = self.client_write.lock().await.shutdown().await;
    }
}

/// Client → agent direction: reads tty frames off the client's socket and
/// forwards each body to the agent's I/O channel under its own sequence.
///
/// Only frames addressed to `io_base` (the stdin stream) are accepted; a
/// client sending any other sequence on its own socket is a protocol
/// violation and ends the pump.
async fn pump_loop(
    mut client_read: OwnedReadHalf,
    io_base: u64,
    agent_io_write: Arc<Mutex<OwnedWriteHalf>>,
) {
    loop {
        let frame = match read_tty_frame(&mut client_read).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                warn!("stdin read error on session {io_base}: {err}");
                return;
            }
        };

        if frame.session != io_base {
            warn!(
                "session {io_base}: client sent sequence {}, expected {io_base}, closing",
                frame.session
            );
            return;
        }

        let mut writer = agent_io_write.lock().await;
        if let Err(err) = write_tty_frame(&mut *writer, frame.session, &frame.body).await {
            warn!("session {io_base}: agent io write failed: {err}");
            return;
        }
    }
}
