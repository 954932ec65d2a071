//! The unix-socket connection server.
//!
//! One task per connection. The reader half feeds decoded requests to
//! a processor task that dispatches them strictly one at a time; the
//! writer half drains the outbound frame queue, which both replies and
//! pushed async-wait frames go through. Handler failures never close a
//! connection; only I/O framing errors do. When a connection ends, its
//! pending wait is cancelled and its weak containers are reaped.

use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use porto_container::Cred;
use porto_core::Runtime;
use porto_error::{PortoError, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

use crate::dispatcher::{ConnHandle, Dispatcher};
use crate::framing::{read_message, write_message};
use crate::protocol::{ContainerRequest, ContainerResponse};

/// Outbound frames buffered per connection before backpressure.
const OUTBOUND_QUEUE: usize = 64;

/// The RPC server.
pub struct Server {
    runtime: Arc<Runtime>,
    next_conn_id: AtomicU64,
}

impl Server {
    /// Creates the server over the runtime context.
    #[must_use]
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Binds the socket and serves connections until the task is
    /// cancelled. Loss of the listener is fatal.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or an accept
    /// fails unrecoverably.
    pub async fn run(&self) -> Result<()> {
        let path = self.runtime.config.socket_path.clone();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PortoError::unknown(format!("can't create socket dir: {e}")))?;
        }
        let _ = std::fs::remove_file(&path);

        let listener = UnixListener::bind(&path)
            .map_err(|e| PortoError::unknown(format!("can't bind {}: {e}", path.display())))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))
            .map_err(|e| PortoError::unknown(format!("can't chmod socket: {e}")))?;
        tracing::info!(socket = %path.display(), "listening");

        loop {
            let (stream, _addr) = listener
                .accept()
                .await
                .map_err(|e| PortoError::unknown(format!("accept failed: {e}")))?;

            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            let runtime = Arc::clone(&self.runtime);
            tokio::spawn(async move {
                handle_connection(runtime, stream, conn_id).await;
            });
        }
    }
}

async fn handle_connection(runtime: Arc<Runtime>, stream: UnixStream, conn_id: u64) {
    let cred = match stream.peer_cred() {
        Ok(ucred) => Cred::new(ucred.uid(), ucred.gid()),
        Err(e) => {
            tracing::warn!(conn = conn_id, "can't read peer credentials: {e}");
            return;
        }
    };
    tracing::debug!(conn = conn_id, %cred, "connection opened");

    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<ContainerResponse>(OUTBOUND_QUEUE);
    let (req_tx, req_rx) = mpsc::channel::<ContainerRequest>(1);
    let (closed_tx, closed_rx) = watch::channel(false);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_message(&mut writer, &frame).await {
                tracing::debug!(conn = conn_id, "write failed: {e}");
                break;
            }
        }
    });

    let conn = ConnHandle {
        id: conn_id,
        outbound: out_tx,
        closed: closed_rx,
    };
    let processor = tokio::spawn(process_requests(Arc::clone(&runtime), req_rx, conn, cred));

    loop {
        match read_message::<ContainerRequest, _>(&mut reader).await {
            Ok(Some(request)) => {
                if req_tx.send(request).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(conn = conn_id, "framing error: {e}");
                break;
            }
        }
    }

    // Cancel an in-flight wait and let the processor drain.
    let _ = closed_tx.send(true);
    drop(req_tx);
    let _ = processor.await;
    writer_task.abort();

    let mut state = runtime.state.lock().await;
    state.holder.destroy_weak(conn_id).await;
    tracing::debug!(conn = conn_id, "connection closed");
}

/// Dispatches requests strictly one at a time. Mutating handlers
/// always run to completion; only a parked wait observes the close
/// signal carried inside the handle.
async fn process_requests(
    runtime: Arc<Runtime>,
    mut req_rx: mpsc::Receiver<ContainerRequest>,
    conn: ConnHandle,
    cred: Cred,
) {
    let dispatcher = Dispatcher::new(runtime);
    while let Some(request) = req_rx.recv().await {
        let response = dispatcher.dispatch(request, cred, &conn).await;
        if conn.outbound.send(response).await.is_err() {
            return;
        }
    }
}
