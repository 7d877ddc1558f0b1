//! A connected VM's agent handle: control-channel transactions and the
//! I/O demuxer.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::error::VmError;
use crate::frame::{self, read_ctl_frame, read_tty_frame, write_ctl_frame};
use crate::hyperstart;
use crate::io_session::IoSession;

#[derive(Debug)]
struct VmState {
    sessions: HashMap<u64, Arc<IoSession>>,
    next_io_base: u64,
}

/// One VM's agent handle, shared by every client bound to it.
///
/// `ctl` and `state` are independent locks: a control transaction never
/// touches the session table, so session allocation never waits behind a
/// `hyper` forward in flight.
#[derive(Debug)]
pub struct VM {
    pub container_id: String,
    ctl: Mutex<UnixStream>,
    io_write: Arc<Mutex<OwnedWriteHalf>>,
    state: Mutex<VmState>,
    tasks: Mutex<JoinSet<()>>,
    /// Cancels the demuxer directly on `close()`: shutting down only the
    /// write half of the agent I/O socket does not unblock a read blocked
    /// on the (shared) read half.
    demux_abort: std::sync::OnceLock<tokio::task::AbortHandle>,
}

impl VM {
    /// Opens both agent sockets, waits for the initial `READY` frame on the
    /// control channel, and spawns the demuxer. The returned VM is fully
    /// connected; there is no separate "connecting" state visible outside
    /// this function.
    pub async fn connect(
        container_id: String,
        ctl_serial: &str,
        io_serial: &str,
    ) -> Result<Arc<Self>, VmError> {
        let mut ctl_stream = UnixStream::connect(ctl_serial).await?;

        let first = read_ctl_frame(&mut ctl_stream).await?.ok_or_else(|| {
            VmError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "agent closed before sending READY",
            ))
        })?;
        if first.code != hyperstart::INIT_READY {
            return Err(VmError::UnexpectedMessage(first.code));
        }

        let io_stream = UnixStream::connect(io_serial).await?;
        let (io_read, io_write) = io_stream.into_split();

        let vm = Arc::new(Self {
            container_id,
            ctl: Mutex::new(ctl_stream),
            io_write: Arc::new(Mutex::new(io_write)),
            state: Mutex::new(VmState {
                sessions: HashMap::new(),
                next_io_base: 1,
            }),
            tasks: Mutex::new(JoinSet::new()),
            demux_abort: std::sync::OnceLock::new(),
        });

        let demux_vm = Arc::clone(&vm);
        let abort = vm
            .tasks
            .lock()
            .await
            .spawn(async move { demux_vm.demux_loop(io_read).await });
        let _ = vm.demux_abort.set(abort);

        Ok(vm)
    }

    /// Agent → clients. Runs until the agent's I/O socket errors or closes.
    async fn demux_loop(self: Arc<Self>, mut reader: tokio::net::unix::OwnedReadHalf) {
        loop {
            let frame = match read_tty_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(err) => {
                    warn!("{}: agent io read error, demuxer exiting: {err}", self.container_id);
                    return;
                }
            };

            let session = {
                let state = self.state.lock().await;
                state.sessions.get(&frame.session).cloned()
            };

            match session {
                Some(session) => {
                    let encoded = frame.encode();
                    if let Err(err) = session.write_frame(&encoded).await {
                        warn!(
                            "{}: client write failed, demuxer exiting: {err}",
                            self.container_id
                        );
                        return;
                    }
                }
                None => {
                    warn!(
                        "{}: no session for sequence {}, dropping frame",
                        self.container_id, frame.session
                    );
                }
            }
        }
    }

    /// Runs one serialized control transaction: write the framed command,
    /// drain `NEXT` acks, then accept `ACK`/`ERROR` as the terminal reply.
    pub async fn send_message(&self, name: &str, data: &Value) -> Result<(), VmError> {
        let code = hyperstart::code_for_command(name)
            .ok_or_else(|| VmError::UnknownCommand(name.to_string()))?;

        let body = match data {
            Value::Null => Vec::new(),
            other => serde_json::to_vec(other)
                .map_err(|err| VmError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err)))?,
        };

        let mut ctl = self.ctl.lock().await;

        write_ctl_frame(&mut *ctl, code, &body).await?;
        let sent_len = (frame::CTL_HEADER_LEN + body.len()) as u64;
        let mut acked = 0u64;

        loop {
            let reply = read_ctl_frame(&mut *ctl).await?.ok_or_else(|| {
                VmError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "agent closed mid-transaction",
                ))
            })?;

            if reply.code == hyperstart::INIT_NEXT {
                if reply.body.len() < 4 {
                    return Err(VmError::UnexpectedMessage(reply.code));
                }
                let chunk = u32::from_be_bytes(reply.body[0..4].try_into().unwrap()) as u64;
                acked += chunk;
                if acked > sent_len {
                    warn!(
                        "{}: over-ack ({acked} > {sent_len}), tolerating",
                        self.container_id
                    );
                }
                continue;
            }

            return match reply.code {
                hyperstart::INIT_ACK => Ok(()),
                hyperstart::INIT_ERROR => Err(VmError::AgentError),
                other => Err(VmError::UnexpectedMessage(other)),
            };
        }
    }

    /// Allocates the next `n_streams` sequence numbers to `client_socket`
    /// and starts its stdin pump, returning the assigned `io_base`.
    pub async fn allocate_io(
        self: &Arc<Self>,
        n_streams: u64,
        client_id: u64,
        client_socket: UnixStream,
    ) -> u64 {
        let io_base = {
            let mut state = self.state.lock().await;
            let base = state.next_io_base;
            state.next_io_base += n_streams;
            base
        };

        let session = {
            let mut tasks = self.tasks.lock().await;
            IoSession::spawn(
                io_base,
                n_streams,
                client_id,
                client_socket,
                Arc::clone(&self.io_write),
                &mut tasks,
            )
        };

        {
            let mut state = self.state.lock().await;
            for seq in io_base..io_base + n_streams {
                state.sessions.insert(seq, Arc::clone(&session));
            }
        }

        io_base
    }

    /// Closes both agent sockets, closes every session exactly once, and
    /// waits for every background task (demuxer and pumps) to finish.
    pub async fn close(&self) {
        if let Some(abort) = self.demux_abort.get() {
            abort.abort();
        }

        {
            let mut ctl = self.ctl.lock().await;
            let _ = ctl.shutdown().await;
        }
        {
            let mut io_write = self.io_write.lock().await;
            let _ = io_write.shutdown().await;
        }

        let sessions: Vec<Arc<IoSession>> = {
            let mut state = self.state.lock().await;
            state
                .sessions
                .drain()
                .filter(|(seq, session)| *seq == session.io_base)
                .map(|(_, session)| session)
                .collect()
        };

        for session in &sessions {
            session.close().await;
        }

        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }
}
