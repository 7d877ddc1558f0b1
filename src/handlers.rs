//! The five verbs a client may send, and the per-connection context they
//! operate on.

use std::sync::Arc;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use serde_json::Value;

use crate::protocol::{Dispatcher, HandlerResponse};
use crate::registry::Proxy;
use crate::vm::VM;

/// Per-connection state: which client this is, the registry it talks to,
/// and the VM it has bound (if any) via `hello`/`attach`.
pub struct ClientCtx {
    pub client_id: u64,
    pub proxy: Arc<Proxy>,
    pub vm: Option<Arc<VM>>,
}

/// Builds the fixed `id → handler` table. Cheap enough to build once per
/// connection; there is no per-process shared state in the table itself.
pub fn dispatcher() -> Dispatcher<ClientCtx> {
    let mut d = Dispatcher::new();
    d.handle("hello", |data, ctx, hr| Box::pin(hello(data, ctx, hr)));
    d.handle("attach", |data, ctx, hr| Box::pin(attach(data, ctx, hr)));
    d.handle("bye", |data, ctx, hr| Box::pin(bye(data, ctx, hr)));
    d.handle("allocateIO", |data, ctx, hr| Box::pin(allocate_io(data, ctx, hr)));
    d.handle("hyper", |data, ctx, hr| Box::pin(hyper(data, ctx, hr)));
    d
}

/// Runs the dispatcher loop for one accepted client connection.
pub async fn serve_client(proxy: Arc<Proxy>, client_id: u64, stream: tokio::net::UnixStream) {
    let ctx = ClientCtx {
        client_id,
        proxy,
        vm: None,
    };
    dispatcher().serve(stream, ctx).await;
}

fn str_field(data: &Value, key: &str) -> String {
    data.get(key).and_then(Value::as_str).unwrap_or("").to_string()
}

async fn hello(data: &Value, ctx: &mut ClientCtx, hr: &mut HandlerResponse) {
    let container_id = str_field(data, "containerId");
    let ctl_serial = str_field(data, "ctlSerial");
    let io_serial = str_field(data, "ioSerial");

    match ctx.proxy.register(container_id, ctl_serial, io_serial).await {
        Ok(vm) => ctx.vm = Some(vm),
        Err(err) => hr.set_error(err),
    }
}

async fn attach(data: &Value, ctx: &mut ClientCtx, hr: &mut HandlerResponse) {
    let container_id = str_field(data, "containerId");
    match ctx.proxy.attach(&container_id).await {
        Ok(vm) => ctx.vm = Some(vm),
        Err(err) => hr.set_error(err),
    }
}

async fn bye(data: &Value, ctx: &mut ClientCtx, hr: &mut HandlerResponse) {
    let explicit = data
        .get("containerId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let container_id = match explicit.or_else(|| ctx.vm.as_ref().map(|vm| vm.container_id.clone())) {
        Some(id) => id,
        None => {
            hr.set_error("client not attached to a vm");
            return;
        }
    };

    if let Err(err) = ctx.proxy.bye(&container_id).await {
        hr.set_error(err);
        return;
    }

    if ctx.vm.as_ref().is_some_and(|vm| vm.container_id == container_id) {
        ctx.vm = None;
    }
}

async fn allocate_io(data: &Value, ctx: &mut ClientCtx, hr: &mut HandlerResponse) {
    let vm = match &ctx.vm {
        Some(vm) => Arc::clone(vm),
        None => {
            hr.set_error("client not attached to a vm");
            return;
        }
    };

    let n_streams = data.get("nStreams").and_then(Value::as_u64).unwrap_or(0);
    if !(1..=2).contains(&n_streams) {
        hr.set_error(format!("asking for unexpected number of streams ({n_streams})"));
        return;
    }

    let (proxy_fd, client_fd) =
        match socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty()) {
            Ok(pair) => pair,
            Err(err) => {
                hr.set_error(format!("couldn't create socket pair: {err}"));
                return;
            }
        };

    let std_stream = std::os::unix::net::UnixStream::from(proxy_fd);
    if let Err(err) = std_stream.set_nonblocking(true) {
        hr.set_error(format!("couldn't configure socket: {err}"));
        return;
    }
    let tokio_stream = match tokio::net::UnixStream::from_std(std_stream) {
        Ok(stream) => stream,
        Err(err) => {
            hr.set_error(format!("couldn't configure socket: {err}"));
            return;
        }
    };

    let io_base = vm.allocate_io(n_streams, ctx.client_id, tokio_stream).await;

    hr.add_result("ioBase", Value::from(io_base));
    hr.set_file(client_fd);
}

async fn hyper(data: &Value, ctx: &mut ClientCtx, hr: &mut HandlerResponse) {
    let vm = match &ctx.vm {
        Some(vm) => Arc::clone(vm),
        None => {
            hr.set_error("client not attached to a vm");
            return;
        }
    };

    let hyper_name = str_field(data, "hyperName");
    let payload = data.get("data").cloned().unwrap_or(Value::Null);

    if let Err(err) = vm.send_message(&hyper_name, &payload).await {
        hr.set_error(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocate_io_rejects_bad_stream_count() {
        let proxy = Proxy::new();
        let dir = tempfile::tempdir().unwrap();
        let ctl_path = dir.path().join("ctl.sock");
        let io_path = dir.path().join("io.sock");
        let ctl_listener = std::os::unix::net::UnixListener::bind(&ctl_path).unwrap();
        let _io_listener = std::os::unix::net::UnixListener::bind(&io_path).unwrap();

        let accept = tokio::task::spawn_blocking(move || ctl_listener.accept());
        let connect = VM::connect(
            "abc".to_string(),
            ctl_path.to_str().unwrap(),
            io_path.to_str().unwrap(),
        );
        let (mut accepted, _) = accept.await.unwrap().unwrap();
        use std::io::Write;
        accepted.write_all(&8u32.to_be_bytes()).unwrap();
        accepted.write_all(&8u32.to_be_bytes()).unwrap();
        let vm = connect.await.unwrap();

        let mut ctx = ClientCtx {
            client_id: 1,
            proxy,
            vm: Some(vm),
        };
        let mut hr = HandlerResponse::default();
        let data = serde_json::json!({"nStreams": 3});
        allocate_io(&data, &mut ctx, &mut hr).await;

        let (resp, _) = hr.into_response();
        assert!(!resp.success);
        assert_eq!(
            resp.error.as_deref(),
            Some("asking for unexpected number of streams (3)")
        );
    }
}
