//! Integration-test harness: a stub hyperstart agent and a minimal
//! JSON+SCM_RIGHTS client, both speaking the wire protocol directly rather
//! than reusing the binary's internals (this file compiles as its own crate).

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

use nix::sys::socket::{self, ControlMessageOwned, MsgFlags, UnixAddr};
use serde_json::{json, Value};

pub const INIT_READY: u32 = 8;
pub const INIT_ACK: u32 = 9;
pub const INIT_ERROR: u32 = 10;
pub const INIT_NEXT: u32 = 14;
pub const INIT_PING: u32 = 12;

fn write_ctl_frame(stream: &mut UnixStream, code: u32, body: &[u8]) {
    let length = (8 + body.len()) as u32;
    stream.write_all(&code.to_be_bytes()).unwrap();
    stream.write_all(&length.to_be_bytes()).unwrap();
    stream.write_all(body).unwrap();
}

fn read_ctl_frame(stream: &mut UnixStream) -> (u32, Vec<u8>) {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).unwrap();
    let code = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let length = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
    let mut body = vec![0u8; length - 8];
    stream.read_exact(&mut body).unwrap();
    (code, body)
}

pub fn write_tty_frame(stream: &mut UnixStream, session: u64, body: &[u8]) {
    let length = (12 + body.len()) as u32;
    stream.write_all(&session.to_be_bytes()).unwrap();
    stream.write_all(&length.to_be_bytes()).unwrap();
    stream.write_all(body).unwrap();
}

pub fn read_tty_frame(stream: &mut UnixStream) -> (u64, Vec<u8>) {
    let mut header = [0u8; 12];
    stream.read_exact(&mut header).unwrap();
    let session = u64::from_be_bytes(header[0..8].try_into().unwrap());
    let length = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
    let mut body = vec![0u8; length - 12];
    stream.read_exact(&mut body).unwrap();
    (session, body)
}

/// A stub hyperstart agent: two plain listening sockets (ctl, io) at
/// caller-chosen paths. `accept_and_greet` takes the first ctl connection
/// and immediately sends `READY`.
pub struct StubAgent {
    pub ctl_path: std::path::PathBuf,
    pub io_path: std::path::PathBuf,
    ctl_listener: UnixListener,
    io_listener: UnixListener,
}

impl StubAgent {
    pub fn bind(dir: &std::path::Path, name: &str) -> Self {
        let ctl_path = dir.join(format!("{name}-ctl.sock"));
        let io_path = dir.join(format!("{name}-io.sock"));
        let ctl_listener = UnixListener::bind(&ctl_path).unwrap();
        let io_listener = UnixListener::bind(&io_path).unwrap();
        Self {
            ctl_path,
            io_path,
            ctl_listener,
            io_listener,
        }
    }

    /// Accepts the control connection, sends `READY`, and returns the
    /// accepted stream for further scripted interaction.
    pub fn accept_ctl_and_greet(&self) -> UnixStream {
        let (mut ctl, _) = self.ctl_listener.accept().unwrap();
        write_ctl_frame(&mut ctl, INIT_READY, b"");
        ctl
    }

    pub fn accept_io(&self) -> UnixStream {
        self.io_listener.accept().unwrap().0
    }
}

/// Reads one `code, body` pair and replies with two NEXT chunk-acks
/// totaling the sent length, then a terminal ACK.
pub fn ack_with_next_chunks(ctl: &mut UnixStream) -> (u32, Vec<u8>) {
    let (code, body) = read_ctl_frame(ctl);
    let sent_len = 8 + body.len() as u32;
    let half = sent_len / 2;
    write_ctl_frame(ctl, INIT_NEXT, &half.to_be_bytes());
    write_ctl_frame(ctl, INIT_NEXT, &(sent_len - half).to_be_bytes());
    write_ctl_frame(ctl, INIT_ACK, b"");
    (code, body)
}

pub fn reply_error(ctl: &mut UnixStream) {
    let _ = read_ctl_frame(ctl);
    write_ctl_frame(ctl, INIT_ERROR, b"");
}

/// A minimal client for the proxy's JSON-over-Unix-socket protocol.
pub struct TestClient {
    stream: UnixStream,
}

impl TestClient {
    pub fn connect(path: &std::path::Path) -> Self {
        Self {
            stream: UnixStream::connect(path).unwrap(),
        }
    }

    /// Sends one request and reads exactly one response line. Reading up to
    /// the trailing newline (rather than stopping as soon as the JSON
    /// parses) matters here: a leftover unread byte would sit ahead of a
    /// following SCM_RIGHTS message and break `recv_fd`.
    pub fn request(&mut self, id: &str, data: Value) -> Value {
        let req = json!({ "id": id, "data": data });
        self.stream.write_all(req.to_string().as_bytes()).unwrap();

        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte).unwrap();
            if byte[0] == b'\n' {
                break;
            }
            buf.push(byte[0]);
        }
        serde_json::from_slice(&buf).unwrap()
    }

    /// Receives one SCM_RIGHTS fd with its one-byte `'F'` payload.
    pub fn recv_fd(&mut self) -> OwnedFd {
        let mut iobuf = [0u8; 1];
        let mut iov = [std::io::IoSliceMut::new(&mut iobuf)];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);

        let msg = socket::recvmsg::<UnixAddr>(
            self.stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )
        .unwrap();

        for cmsg in msg.cmsgs().unwrap() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                return unsafe { OwnedFd::from_raw_fd(fds[0]) };
            }
        }
        panic!("no fd received");
    }

    pub fn into_inner(self) -> UnixStream {
        self.stream
    }
}
