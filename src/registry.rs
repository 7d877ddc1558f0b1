//! The process-wide `containerID → VM` map and the client accept loop.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::error;
use tokio::net::UnixListener;
use tokio::sync::Mutex;

use crate::vm::VM;

/// Single mutex-guarded registry of connected VMs, shared by every client
/// dispatcher task.
pub struct Proxy {
    vms: Mutex<HashMap<String, Arc<VM>>>,
    /// Container ids with a `hello` in flight, so a second concurrent
    /// `hello` for the same id is rejected before either finishes
    /// connecting rather than racing to insert into `vms`.
    pending: Mutex<HashSet<String>>,
    next_client_id: AtomicU64,
}

impl Proxy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            vms: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            next_client_id: AtomicU64::new(1),
        })
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Validates and connects a new VM, registering it under `container_id`.
    /// On any failure the registry is left exactly as it was before the call.
    pub async fn register(
        &self,
        container_id: String,
        ctl_serial: String,
        io_serial: String,
    ) -> Result<Arc<VM>, String> {
        if container_id.is_empty() || ctl_serial.is_empty() || io_serial.is_empty() {
            return Err("malformed hello command".to_string());
        }

        {
            let vms = self.vms.lock().await;
            let mut pending = self.pending.lock().await;
            if vms.contains_key(&container_id) || pending.contains(&container_id) {
                return Err(format!("{container_id}: container already registered"));
            }
            pending.insert(container_id.clone());
        }

        let connected = VM::connect(container_id.clone(), &ctl_serial, &io_serial).await;

        self.pending.lock().await.remove(&container_id);

        match connected {
            Ok(vm) => {
                self.vms.lock().await.insert(container_id, Arc::clone(&vm));
                Ok(vm)
            }
            Err(err) => Err(err.to_string()),
        }
    }

    /// Binds the current client to an already-registered VM without
    /// modifying the registry.
    pub async fn attach(&self, container_id: &str) -> Result<Arc<VM>, String> {
        self.vms
            .lock()
            .await
            .get(container_id)
            .cloned()
            .ok_or_else(|| format!("unknown containerID: {container_id}"))
    }

    /// Removes and closes a VM.
    pub async fn bye(&self, container_id: &str) -> Result<(), String> {
        let vm = self.vms.lock().await.remove(container_id);
        match vm {
            Some(vm) => {
                vm.close().await;
                Ok(())
            }
            None => Err(format!("unknown containerID: {container_id}")),
        }
    }

    /// Accepts connections forever, spawning one dispatcher task per client.
    /// Accept errors are logged and do not stop the loop.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let proxy = Arc::clone(&self);
                    let client_id = proxy.next_client_id();
                    tokio::spawn(async move {
                        crate::handlers::serve_client(proxy, client_id, stream).await;
                    });
                }
                Err(err) => {
                    error!("accept error: {err}");
                }
            }
        }
    }
}
