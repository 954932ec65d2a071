//! Request dispatch.
//!
//! One handler per request variant, in the shape of the wire contract:
//! log the short form, resolve the entity, check credentials for
//! mutators, execute, fill the response. Every failure becomes an
//! `(error, error_msg)` pair; a panicking handler is converted to an
//! `Unknown` response at the dispatch boundary and never tears down
//! the daemon.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use porto_container::{Cred, StateEvent};
use porto_core::Runtime;
use porto_error::{EError, PortoError, Result};
use tokio::sync::{broadcast, mpsc, watch};

use crate::protocol::container_request::Request;
use crate::protocol::{
    AsyncWaitResponse, ContainerRequest, ContainerResponse, CreateRequest, CreateVolumeRequest,
    DestroyRequest, DestroyVolumeRequest, GetDataRequest, GetDataResponse, GetPropertyRequest,
    GetPropertyResponse, KillRequest, LinkVolumeRequest, ListRequest, ListResponse,
    ListVolumesResponse, PauseRequest, RespawnRequest, ResumeRequest, SchemaEntry,
    SchemaListResponse, SetPropertyRequest, StartRequest, StopRequest, UnlinkVolumeRequest,
    VersionResponse, VolumeDescription, WaitRequest, WaitResponse,
};

/// Per-connection dispatch context.
#[derive(Clone)]
pub struct ConnHandle {
    /// Connection id; weak containers are keyed to it.
    pub id: u64,
    /// Outbound frame queue, shared with the connection's writer half.
    pub outbound: mpsc::Sender<ContainerResponse>,
    /// Flips to true when the peer goes away; a parked wait observes
    /// this and gives up without a reply.
    pub closed: watch::Receiver<bool>,
}

fn ok_response() -> ContainerResponse {
    ContainerResponse::default()
}

fn error_response(err: &PortoError) -> ContainerResponse {
    ContainerResponse {
        error: err.code.code(),
        error_msg: err.message.clone(),
        ..Default::default()
    }
}

fn to_response(result: Result<ContainerResponse>) -> ContainerResponse {
    match result {
        Ok(rsp) => rsp,
        Err(e) => error_response(&e),
    }
}

fn wait_response(name: String) -> ContainerResponse {
    ContainerResponse {
        wait: Some(WaitResponse { name }),
        ..Default::default()
    }
}

/// Routes decoded requests to their handlers.
pub struct Dispatcher {
    runtime: Arc<Runtime>,
}

impl Dispatcher {
    /// Creates a dispatcher over the runtime context.
    #[must_use]
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// Handles one request and produces the reply frame.
    pub async fn dispatch(
        &self,
        req: ContainerRequest,
        cred: Cred,
        conn: &ConnHandle,
    ) -> ContainerResponse {
        let Some(request) = req.request else {
            return error_response(&PortoError::new(
                EError::InvalidMethod,
                "request selects no method",
            ));
        };
        tracing::debug!(%cred, conn = conn.id, request = ?request, "rpc");

        let handled = AssertUnwindSafe(self.handle(request, cred, conn))
            .catch_unwind()
            .await;
        let rsp = match handled {
            Ok(rsp) => rsp,
            Err(panic) => {
                let what = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                tracing::error!(conn = conn.id, "handler panic: {what}");
                error_response(&PortoError::unknown(what))
            }
        };

        if rsp.error != 0 {
            tracing::debug!(conn = conn.id, error = rsp.error, msg = %rsp.error_msg, "rpc error");
        }
        rsp
    }

    async fn handle(&self, request: Request, cred: Cred, conn: &ConnHandle) -> ContainerResponse {
        match request {
            Request::Create(r) => to_response(self.create(&r, cred).await),
            Request::CreateWeak(r) => to_response(self.create_weak(&r, cred, conn.id).await),
            Request::Destroy(r) => to_response(self.destroy(&r, cred).await),
            Request::List(r) => to_response(self.list(&r).await),
            Request::GetProperty(r) => to_response(self.get_property(&r).await),
            Request::SetProperty(r) => to_response(self.set_property(&r, cred).await),
            Request::GetData(r) => to_response(self.get_data(&r).await),
            Request::Start(r) => to_response(self.start(&r, cred).await),
            Request::Stop(r) => to_response(self.stop(&r, cred).await),
            Request::Pause(r) => to_response(self.pause(&r, cred).await),
            Request::Resume(r) => to_response(self.resume(&r, cred).await),
            Request::Kill(r) => to_response(self.kill(&r, cred).await),
            Request::Respawn(r) => to_response(self.respawn(&r, cred).await),
            Request::PropertyList(_) => to_response(Self::property_list()),
            Request::DataList(_) => to_response(Self::data_list()),
            Request::Version(_) => to_response(Self::version()),
            Request::Wait(r) => self.wait(&r, conn).await,
            Request::AsyncWait(r) => to_response(self.async_wait(&r, conn).await),
            Request::CreateVolume(r) => to_response(self.create_volume(&r, cred).await),
            Request::DestroyVolume(r) => to_response(self.destroy_volume(&r, cred).await),
            Request::ListVolumes(_) => to_response(self.list_volumes().await),
            Request::LinkVolume(r) => to_response(self.link_volume(&r, cred).await),
            Request::UnlinkVolume(r) => to_response(self.unlink_volume(&r, cred).await),
        }
    }

    async fn create(&self, req: &CreateRequest, cred: Cred) -> Result<ContainerResponse> {
        let mut state = self.runtime.state.lock().await;
        state.holder.create(&req.name, cred)?;
        Ok(ok_response())
    }

    async fn create_weak(
        &self,
        req: &CreateRequest,
        cred: Cred,
        conn_id: u64,
    ) -> Result<ContainerResponse> {
        let mut state = self.runtime.state.lock().await;
        state.holder.create_weak(&req.name, cred, conn_id)?;
        Ok(ok_response())
    }

    async fn destroy(&self, req: &DestroyRequest, cred: Cred) -> Result<ContainerResponse> {
        let mut state = self.runtime.state.lock().await;
        if let Some(container) = state.holder.get(&req.name) {
            container.check_permission(cred)?;
        }
        let destroyed = state.holder.destroy(&req.name).await?;
        for name in &destroyed {
            state.volumes.container_destroyed(name);
        }
        Ok(ok_response())
    }

    async fn list(&self, req: &ListRequest) -> Result<ContainerResponse> {
        let state = self.runtime.state.lock().await;
        let name = state.holder.list(req.mask.as_deref());
        Ok(ContainerResponse {
            list: Some(ListResponse { name }),
            ..Default::default()
        })
    }

    async fn get_property(&self, req: &GetPropertyRequest) -> Result<ContainerResponse> {
        let state = self.runtime.state.lock().await;
        let value = state.holder.get_property(&req.name, &req.property)?;
        Ok(ContainerResponse {
            get_property: Some(GetPropertyResponse { value }),
            ..Default::default()
        })
    }

    async fn set_property(&self, req: &SetPropertyRequest, cred: Cred) -> Result<ContainerResponse> {
        let mut state = self.runtime.state.lock().await;
        state
            .holder
            .get(&req.name)
            .ok_or_else(|| PortoError::no_container(&req.name))?
            .check_permission(cred)?;
        state
            .holder
            .set_property(&req.name, &req.property, &req.value, cred)?;
        Ok(ok_response())
    }

    async fn get_data(&self, req: &GetDataRequest) -> Result<ContainerResponse> {
        let state = self.runtime.state.lock().await;
        let value = state.holder.get_data(&req.name, &req.data)?;
        Ok(ContainerResponse {
            get_data: Some(GetDataResponse { value }),
            ..Default::default()
        })
    }

    async fn start(&self, req: &StartRequest, cred: Cred) -> Result<ContainerResponse> {
        let mut state = self.runtime.state.lock().await;
        state
            .holder
            .get(&req.name)
            .ok_or_else(|| PortoError::no_container(&req.name))?
            .check_permission(cred)?;
        state.holder.start(&req.name).await?;
        Ok(ok_response())
    }

    async fn stop(&self, req: &StopRequest, cred: Cred) -> Result<ContainerResponse> {
        let mut state = self.runtime.state.lock().await;
        state
            .holder
            .get(&req.name)
            .ok_or_else(|| PortoError::no_container(&req.name))?
            .check_permission(cred)?;
        let timeout = req.timeout_ms.map(Duration::from_millis);
        state.holder.stop(&req.name, timeout).await?;
        Ok(ok_response())
    }

    async fn pause(&self, req: &PauseRequest, cred: Cred) -> Result<ContainerResponse> {
        let mut state = self.runtime.state.lock().await;
        state
            .holder
            .get(&req.name)
            .ok_or_else(|| PortoError::no_container(&req.name))?
            .check_permission(cred)?;
        state.holder.pause(&req.name).await?;
        Ok(ok_response())
    }

    async fn resume(&self, req: &ResumeRequest, cred: Cred) -> Result<ContainerResponse> {
        let mut state = self.runtime.state.lock().await;
        state
            .holder
            .get(&req.name)
            .ok_or_else(|| PortoError::no_container(&req.name))?
            .check_permission(cred)?;
        state.holder.resume(&req.name).await?;
        Ok(ok_response())
    }

    async fn kill(&self, req: &KillRequest, cred: Cred) -> Result<ContainerResponse> {
        let mut state = self.runtime.state.lock().await;
        state
            .holder
            .get(&req.name)
            .ok_or_else(|| PortoError::no_container(&req.name))?
            .check_permission(cred)?;
        state.holder.kill(&req.name, req.sig)?;
        Ok(ok_response())
    }

    async fn respawn(&self, req: &RespawnRequest, cred: Cred) -> Result<ContainerResponse> {
        let mut state = self.runtime.state.lock().await;
        state
            .holder
            .get(&req.name)
            .ok_or_else(|| PortoError::no_container(&req.name))?
            .check_permission(cred)?;
        state.holder.respawn(&req.name).await?;
        Ok(ok_response())
    }

    fn property_list() -> Result<ContainerResponse> {
        let list = porto_container::property::property_set()
            .iter()
            .filter(|def| !def.has_flags(porto_value::HIDDEN_VALUE))
            .map(|def| SchemaEntry {
                name: def.name.to_string(),
                desc: def.desc.to_string(),
            })
            .collect();
        Ok(ContainerResponse {
            property_list: Some(SchemaListResponse { list }),
            ..Default::default()
        })
    }

    fn data_list() -> Result<ContainerResponse> {
        let list = porto_container::data::data_set()
            .iter()
            .filter(|def| !porto_value::has_flags(def.flags, porto_value::HIDDEN_VALUE))
            .map(|def| SchemaEntry {
                name: def.name.to_string(),
                desc: def.desc.to_string(),
            })
            .collect();
        Ok(ContainerResponse {
            data_list: Some(SchemaListResponse { list }),
            ..Default::default()
        })
    }

    fn version() -> Result<ContainerResponse> {
        Ok(ContainerResponse {
            version: Some(VersionResponse {
                tag: env!("CARGO_PKG_VERSION").to_string(),
                revision: option_env!("PORTO_REVISION").unwrap_or("").to_string(),
            }),
            ..Default::default()
        })
    }

    /// Long-poll wait. The lock is held only for the initial check and
    /// subscription; parking happens without it and is abandoned when
    /// the connection closes.
    async fn wait(&self, req: &WaitRequest, conn: &ConnHandle) -> ContainerResponse {
        let rx = {
            let state = self.runtime.state.lock().await;
            match state.holder.find_terminal(&req.name) {
                Err(e) => return error_response(&e),
                Ok(Some(name)) => return wait_response(name),
                Ok(None) => {}
            }
            if req.timeout_ms == Some(0) {
                return wait_response(String::new());
            }
            state.holder.subscribe()
        };

        let mut closed = conn.closed.clone();
        let name = tokio::select! {
            name = self.park(rx, &req.name, req.timeout_ms) => name,
            _ = closed.changed() => None,
        };
        wait_response(name.unwrap_or_default())
    }

    async fn park(
        &self,
        mut rx: broadcast::Receiver<StateEvent>,
        names: &[String],
        timeout_ms: Option<u64>,
    ) -> Option<String> {
        let deadline = timeout_ms.map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
        loop {
            let event = match deadline {
                Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                    Ok(event) => event,
                    Err(_) => return None,
                },
                None => rx.recv().await,
            };

            match event {
                Ok(ev) if ev.state.is_terminal() && names.contains(&ev.name) => {
                    return Some(ev.name)
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Missed events; re-check the authoritative state.
                    let state = self.runtime.state.lock().await;
                    if let Ok(Some(name)) = state.holder.find_terminal(names) {
                        return Some(name);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Async wait: replies immediately, then pushes a frame for every
    /// terminal transition of the watched names on the same connection.
    async fn async_wait(&self, req: &WaitRequest, conn: &ConnHandle) -> Result<ContainerResponse> {
        let (initial, rx) = {
            let state = self.runtime.state.lock().await;
            for name in &req.name {
                if state.holder.get(name).is_none() {
                    return Err(PortoError::no_container(name));
                }
            }
            let initial: Vec<AsyncWaitResponse> = req
                .name
                .iter()
                .filter_map(|n| {
                    state
                        .holder
                        .get(n)
                        .filter(|c| c.state().is_terminal())
                        .map(|c| AsyncWaitResponse {
                            name: n.clone(),
                            state: c.state().to_string(),
                        })
                })
                .collect();
            (initial, state.holder.subscribe())
        };

        for event in initial {
            let _ = conn
                .outbound
                .send(ContainerResponse {
                    async_wait: Some(event),
                    ..Default::default()
                })
                .await;
        }

        let names = req.name.clone();
        let outbound = conn.outbound.clone();
        let timeout_ms = req.timeout_ms;
        tokio::spawn(watch_task(rx, names, outbound, timeout_ms));
        Ok(ok_response())
    }

    async fn create_volume(&self, req: &CreateVolumeRequest, cred: Cred) -> Result<ContainerResponse> {
        let mut state = self.runtime.state.lock().await;
        state
            .volumes
            .create(&req.path, &req.source, req.quota, &req.flags, cred)?;
        Ok(ok_response())
    }

    async fn destroy_volume(
        &self,
        req: &DestroyVolumeRequest,
        cred: Cred,
    ) -> Result<ContainerResponse> {
        let mut state = self.runtime.state.lock().await;
        state
            .volumes
            .get(&req.path)
            .ok_or_else(|| PortoError::no_volume(&req.path))?
            .check_permission(cred)?;
        state.volumes.destroy(&req.path)?;
        Ok(ok_response())
    }

    async fn list_volumes(&self) -> Result<ContainerResponse> {
        let state = self.runtime.state.lock().await;
        let volumes = state
            .volumes
            .list()
            .into_iter()
            .map(|v| VolumeDescription {
                path: v.path.clone(),
                source: v.source.clone(),
                quota: v.quota,
                flags: v.flags.clone(),
                containers: v.links.iter().map(|l| l.container.clone()).collect(),
            })
            .collect();
        Ok(ContainerResponse {
            volume_list: Some(ListVolumesResponse { volumes }),
            ..Default::default()
        })
    }

    async fn link_volume(&self, req: &LinkVolumeRequest, cred: Cred) -> Result<ContainerResponse> {
        let mut state = self.runtime.state.lock().await;
        if state.holder.get(&req.container).is_none() {
            return Err(PortoError::no_container(&req.container));
        }
        state
            .volumes
            .get(&req.path)
            .ok_or_else(|| PortoError::no_volume(&req.path))?
            .check_permission(cred)?;
        state.volumes.link(
            &req.path,
            &req.container,
            req.target.clone().into(),
            req.read_only,
            req.required,
        )?;
        Ok(ok_response())
    }

    async fn unlink_volume(
        &self,
        req: &UnlinkVolumeRequest,
        cred: Cred,
    ) -> Result<ContainerResponse> {
        let mut state = self.runtime.state.lock().await;
        state
            .volumes
            .get(&req.path)
            .ok_or_else(|| PortoError::no_volume(&req.path))?
            .check_permission(cred)?;
        state.volumes.unlink(&req.path, &req.container)?;
        Ok(ok_response())
    }
}

async fn recv_until<T>(
    deadline: Option<tokio::time::Instant>,
    fut: impl std::future::Future<Output = T>,
) -> Option<T> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Forwards terminal transitions of the watched names to a connection
/// until the timeout elapses or the connection goes away.
async fn watch_task(
    mut rx: broadcast::Receiver<StateEvent>,
    names: Vec<String>,
    outbound: mpsc::Sender<ContainerResponse>,
    timeout_ms: Option<u64>,
) {
    let deadline = timeout_ms.map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
    loop {
        let event = tokio::select! {
            event = recv_until(deadline, rx.recv()) => match event {
                Some(event) => event,
                None => return,
            },
            () = outbound.closed() => return,
        };
        let event = match event {
            Ok(ev) => ev,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };

        if event.state.is_terminal() && names.contains(&event.name) {
            let frame = ContainerResponse {
                async_wait: Some(AsyncWaitResponse {
                    name: event.name,
                    state: event.state.to_string(),
                }),
                ..Default::default()
            };
            if outbound.send(frame).await.is_err() {
                return;
            }
        }
    }
}
