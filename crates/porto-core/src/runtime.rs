//! The runtime context threaded through RPC handlers.

use std::sync::Arc;

use porto_cgroup::CgroupRegistry;
use porto_container::{
    ContainerHolder, LocalVolumeBackend, ProcessSpawner, Spawner, VolumeHolder,
};
use porto_error::Result;
use porto_kv::KvStorage;
use porto_net::{CgFilter, Network, Qdisc, TcClass};
use tokio::sync::Mutex;

use crate::config::Config;

/// Mutable daemon state guarded by the single handler mutex.
///
/// Handlers are serialized behind this lock; cascading operations rely
/// on that exclusion for correctness.
pub struct DaemonState {
    pub holder: ContainerHolder,
    pub volumes: VolumeHolder,
}

/// Everything a handler needs, built once at daemon start.
pub struct Runtime {
    pub config: Config,
    pub registry: Arc<CgroupRegistry>,
    pub net: Arc<Network>,
    pub state: Mutex<DaemonState>,
}

impl Runtime {
    /// Builds the runtime from configuration: discovers cgroup mounts
    /// (fatal when mountinfo is unreadable), resolves network links and
    /// opens the key-value storage.
    ///
    /// # Errors
    ///
    /// Returns an error when a mandatory resource is unavailable.
    pub fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(CgroupRegistry::discover()?);
        let net = Arc::new(if config.network.enabled {
            Network::open(&config.network.devices)?
        } else {
            Network::disabled()
        });
        let spawner: Arc<dyn Spawner> = Arc::new(ProcessSpawner::new());
        Self::with_parts(config, registry, net, spawner)
    }

    /// Builds the runtime over explicit kernel seams (tests, chroots).
    ///
    /// # Errors
    ///
    /// Returns an error when the key-value storage cannot be opened.
    pub fn with_parts(
        config: Config,
        registry: Arc<CgroupRegistry>,
        net: Arc<Network>,
        spawner: Arc<dyn Spawner>,
    ) -> Result<Self> {
        let kv = KvStorage::open(config.kv_dir())?;
        let mut holder =
            ContainerHolder::new(Arc::clone(&registry), Arc::clone(&net), spawner, kv);
        holder.set_stop_timeout(config.stop_timeout());

        let volumes = VolumeHolder::new(Box::new(LocalVolumeBackend::new(config.volumes_dir())));

        Ok(Self {
            config,
            registry,
            net,
            state: Mutex::new(DaemonState { holder, volumes }),
        })
    }

    /// Prepares kernel-side globals and restores persisted containers.
    ///
    /// The root qdisc, its default class and the cgroup filter are
    /// installed on every managed link; containers are then rebuilt
    /// from storage and reconciled with live pids.
    ///
    /// # Errors
    ///
    /// Returns an error when the qdisc setup or the storage replay
    /// fails.
    pub async fn init(&self) -> Result<()> {
        let qdisc = Qdisc::root();
        qdisc.create(&self.net)?;
        TcClass::default_class().create(&self.net, 3, 1, 0)?;
        CgFilter::new(qdisc.handle()).create(&self.net)?;

        let mut state = self.state.lock().await;
        state.holder.restore().await?;
        tracing::info!(
            containers = state.holder.list(None).len(),
            "runtime initialized"
        );
        Ok(())
    }

    /// Runs the reaper until the daemon shuts down: collects dead init
    /// processes at the configured cadence.
    pub async fn run_reaper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.reap_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut state = self.state.lock().await;
            state.holder.reap().await;
        }
    }

    /// Flushes daemon-side state on shutdown. Containers keep running;
    /// a later restart reattaches to them.
    pub async fn shutdown(&self) {
        let state = self.state.lock().await;
        tracing::info!(
            containers = state.holder.list(None).len(),
            "daemon shutting down, containers stay running"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use porto_cgroup::SubsystemKind;
    use porto_container::MockSpawner;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn test_runtime(dir: &TempDir) -> Runtime {
        let mounts: HashMap<_, _> = SubsystemKind::ALL
            .into_iter()
            .map(|kind| (kind, dir.path().join(kind.as_str())))
            .collect();
        let config = Config {
            data_dir: dir.path().join("data"),
            ..Config::default()
        };
        Runtime::with_parts(
            config,
            Arc::new(CgroupRegistry::with_mounts(mounts)),
            Arc::new(Network::disabled()),
            Arc::new(MockSpawner::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn init_restores_empty_storage() {
        let dir = TempDir::new().unwrap();
        let runtime = test_runtime(&dir);
        runtime.init().await.unwrap();

        let state = runtime.state.lock().await;
        assert!(state.holder.list(None).is_empty());
    }

    #[tokio::test]
    async fn state_is_shared_through_the_lock() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(test_runtime(&dir));
        runtime.init().await.unwrap();

        {
            let mut state = runtime.state.lock().await;
            state
                .holder
                .create("a", porto_container::Cred::root())
                .unwrap();
        }
        let state = runtime.state.lock().await;
        assert_eq!(state.holder.list(None), vec!["a".to_string()]);
    }
}
