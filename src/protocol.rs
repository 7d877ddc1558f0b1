//! The client-facing JSON-over-Unix-socket request/response protocol,
//! including the out-of-band file-descriptor return path.

use std::collections::HashMap;
use std::future::Future;
use std::io::IoSlice;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::pin::Pin;

use log::{error, warn};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::io::Interest;
use tokio::net::UnixStream;

/// `{id, data}` as sent by a client.
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// `{success, error?, data?}` as sent back to a client.
#[derive(Debug, Serialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

/// Accumulates what a handler wants to send back: an error, a results
/// object, and/or a file descriptor to hand off via SCM_RIGHTS.
#[derive(Default)]
pub struct HandlerResponse {
    error: Option<String>,
    results: Option<Map<String, Value>>,
    file: Option<OwnedFd>,
}

impl HandlerResponse {
    pub fn set_error(&mut self, msg: impl Into<String>) {
        self.error = Some(msg.into());
    }

    pub fn add_result(&mut self, key: &str, value: Value) {
        self.results
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
    }

    pub fn set_file(&mut self, file: OwnedFd) {
        self.file = Some(file);
    }

    pub(crate) fn into_response(self) -> (Response, Option<OwnedFd>) {
        let response = match self.error {
            Some(err) => Response {
                success: false,
                error: Some(err),
                data: self.results,
            },
            None => Response {
                success: true,
                error: None,
                data: self.results,
            },
        };
        (response, self.file)
    }
}

/// A growing byte buffer that peels off one JSON value at a time.
///
/// Mirrors a streaming `json.Decoder`: multiple whitespace-separated (or
/// directly adjacent) objects already present in the buffer are drained one
/// per call without requiring another socket read.
#[derive(Default)]
pub struct JsonDecoder {
    buf: Vec<u8>,
}

impl JsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Tries to decode one complete request from buffered bytes.
    ///
    /// `Ok(None)` means the buffer holds no complete value yet (including an
    /// empty buffer) and more bytes are needed. A real JSON syntax error
    /// (not just running out of input) is returned as `Err`.
    pub fn try_decode(&mut self) -> Result<Option<Request>, serde_json::Error> {
        let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Request>();
        match stream.next() {
            None => Ok(None),
            Some(Ok(req)) => {
                let consumed = stream.byte_offset();
                self.buf.drain(..consumed);
                Ok(Some(req))
            }
            Some(Err(err)) => {
                if err.is_eof() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A single verb's implementation: consumes the raw `data` payload and the
/// per-connection context, and fills in a [`HandlerResponse`].
pub type Handler<C> =
    for<'a> fn(&'a Value, &'a mut C, &'a mut HandlerResponse) -> HandlerFuture<'a>;

/// Maps request ids to handlers and runs the per-connection serve loop.
pub struct Dispatcher<C> {
    handlers: HashMap<&'static str, Handler<C>>,
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn handle(&mut self, id: &'static str, handler: Handler<C>) {
        self.handlers.insert(id, handler);
    }

    /// Runs the sequential request/response loop for one client connection.
    ///
    /// A JSON decode error or a write failure closes the connection; a
    /// clean EOF (no bytes, or only whitespace, pending) ends the loop
    /// without logging anything — the client simply went away.
    pub async fn serve(&self, mut stream: UnixStream, mut ctx: C) {
        let mut decoder = JsonDecoder::new();
        let mut read_buf = [0u8; 65536];

        loop {
            let req = loop {
                match decoder.try_decode() {
                    Ok(Some(req)) => break req,
                    Ok(None) => {
                        let n = match stream.read(&mut read_buf).await {
                            Ok(0) => return,
                            Ok(n) => n,
                            Err(err) => {
                                warn!("client read error: {err}");
                                return;
                            }
                        };
                        decoder.feed(&read_buf[..n]);
                    }
                    Err(err) => {
                        warn!("malformed request, closing connection: {err}");
                        return;
                    }
                }
            };

            let response = self.handle_request(req, &mut ctx).await;
            let (response, file) = response.into_response();

            let mut body = match serde_json::to_vec(&response) {
                Ok(body) => body,
                Err(err) => {
                    error!("couldn't encode response: {err}");
                    return;
                }
            };
            body.push(b'\n');

            if let Err(err) = stream.write_all(&body).await {
                error!("couldn't write response: {err}");
                return;
            }

            if let Some(file) = file {
                if let Err(err) = send_fd(&stream, file.as_raw_fd()).await {
                    error!("error sending fd: {err}");
                }
                // `file` drops here, closing the proxy's local copy; the
                // kernel duplicated the descriptor into the peer during
                // sendmsg, so the recipient's copy stays alive.
            }
        }
    }

    async fn handle_request(&self, req: Request, ctx: &mut C) -> HandlerResponse {
        let mut hr = HandlerResponse::default();

        let id = match req.id {
            Some(id) if !id.is_empty() => id,
            _ => {
                hr.set_error("no 'id' field in request");
                return hr;
            }
        };

        match self.handlers.get(id.as_str()) {
            Some(handler) => {
                handler(&req.data, ctx, &mut hr).await;
                hr
            }
            None => {
                hr.set_error(format!("no payload named '{id}'"));
                hr
            }
        }
    }
}

/// Sends `fd` to the peer as SCM_RIGHTS ancillary data with a single-byte
/// `'F'` inline payload, sent strictly after the JSON response frame.
///
/// `nix::sys::socket::sendmsg` is a plain blocking syscall wrapper, so it's
/// driven through tokio's reactor via [`UnixStream::try_io`]: wait for the
/// socket to report writable, attempt the syscall, and retry on `WouldBlock`
/// the same way `try_io` expects any raw-fd operation to behave.
pub async fn send_fd(stream: &UnixStream, fd: RawFd) -> std::io::Result<()> {
    loop {
        stream.writable().await?;
        let result = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(b"F")];
            let fds = [fd];
            let cmsgs = [ControlMessage::ScmRights(&fds)];
            sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                .map(|_| ())
                .map_err(|err| std::io::Error::from_raw_os_error(err as i32))
        });
        match result {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
}
