//! Holder-level lifecycle scenarios against mock kernel seams.

use std::collections::HashMap;
use std::sync::Arc;

use porto_cgroup::{CgroupRegistry, SubsystemKind};
use porto_container::{ContainerHolder, Cred, MockSpawner, Spawner};
use porto_error::EError;
use porto_kv::KvStorage;
use porto_net::Network;
use tempfile::TempDir;

fn registry_for(dir: &TempDir) -> Arc<CgroupRegistry> {
    let mounts: HashMap<_, _> = SubsystemKind::ALL
        .into_iter()
        .map(|kind| (kind, dir.path().join("cgroup").join(kind.as_str())))
        .collect();
    Arc::new(CgroupRegistry::with_mounts(mounts))
}

fn holder_for(dir: &TempDir) -> (ContainerHolder, Arc<MockSpawner>) {
    let spawner = Arc::new(MockSpawner::new());
    let kv = KvStorage::open(dir.path().join("kv")).unwrap();
    let holder = ContainerHolder::new(
        registry_for(dir),
        Arc::new(Network::disabled()),
        spawner.clone(),
        kv,
    );
    (holder, spawner)
}

fn runnable(holder: &mut ContainerHolder, name: &str) {
    holder.create(name, Cred::new(1000, 1000)).unwrap();
    holder
        .set_property(name, "command", "sleep 1000", Cred::new(1000, 1000))
        .unwrap();
}

#[tokio::test]
async fn create_start_stop_cycle() {
    let dir = TempDir::new().unwrap();
    let (mut holder, _spawner) = holder_for(&dir);

    runnable(&mut holder, "a");
    assert_eq!(holder.get_data("a", "state").unwrap(), "stopped");

    holder.start("a").await.unwrap();
    assert_eq!(holder.get_data("a", "state").unwrap(), "running");
    assert!(holder.get("a").unwrap().root_pid().is_some());

    holder.stop("a", None).await.unwrap();
    assert_eq!(holder.get_data("a", "state").unwrap(), "stopped");
    assert!(holder.get("a").unwrap().root_pid().is_none());
}

#[tokio::test]
async fn name_validation_and_duplicates() {
    let dir = TempDir::new().unwrap();
    let (mut holder, _) = holder_for(&dir);

    assert_eq!(
        holder.create("bad name", Cred::root()).unwrap_err().code,
        EError::InvalidValue
    );
    assert_eq!(
        holder.create("a.b", Cred::root()).unwrap_err().code,
        EError::ContainerDoesNotExist
    );

    holder.create("a", Cred::root()).unwrap();
    assert_eq!(
        holder.create("a", Cred::root()).unwrap_err().code,
        EError::ContainerAlreadyExists
    );
    holder.create("a.b", Cred::root()).unwrap();
}

#[tokio::test]
async fn child_needs_running_parent() {
    let dir = TempDir::new().unwrap();
    let (mut holder, _) = holder_for(&dir);

    runnable(&mut holder, "a");
    runnable(&mut holder, "a.b");

    let err = holder.start("a.b").await.unwrap_err();
    assert_eq!(err.code, EError::InvalidState);

    holder.start("a").await.unwrap();
    holder.start("a.b").await.unwrap();
    assert_eq!(holder.get_data("a.b", "state").unwrap(), "running");
}

#[tokio::test]
async fn stop_cascades_to_descendants() {
    let dir = TempDir::new().unwrap();
    let (mut holder, _) = holder_for(&dir);

    runnable(&mut holder, "a");
    runnable(&mut holder, "a.b");
    runnable(&mut holder, "a.b.c");
    holder.start("a").await.unwrap();
    holder.start("a.b").await.unwrap();
    holder.start("a.b.c").await.unwrap();

    holder.stop("a", None).await.unwrap();
    for name in ["a", "a.b", "a.b.c"] {
        assert_eq!(holder.get_data(name, "state").unwrap(), "stopped");
    }
}

#[tokio::test]
async fn destroy_cascades_and_unregisters() {
    let dir = TempDir::new().unwrap();
    let (mut holder, _) = holder_for(&dir);

    runnable(&mut holder, "a");
    runnable(&mut holder, "a.b");
    holder.start("a").await.unwrap();
    holder.start("a.b").await.unwrap();

    let destroyed = holder.destroy("a").await.unwrap();
    assert_eq!(destroyed, vec!["a.b".to_string(), "a".to_string()]);
    assert!(holder.get("a").is_none());
    assert!(holder.get("a.b").is_none());
    assert!(holder.list(None).is_empty());
}

#[tokio::test]
async fn list_honors_masks() {
    let dir = TempDir::new().unwrap();
    let (mut holder, _) = holder_for(&dir);

    for name in ["web", "web.front", "web.back", "db"] {
        holder.create(name, Cred::root()).unwrap();
    }

    assert_eq!(holder.list(None).len(), 4);
    assert_eq!(
        holder.list(Some("web.*")),
        vec!["web.back".to_string(), "web.front".to_string()]
    );
    assert_eq!(holder.list(Some("d?")), vec!["db".to_string()]);
}

#[tokio::test]
async fn pause_resume_and_kill_gates() {
    let dir = TempDir::new().unwrap();
    let (mut holder, spawner) = holder_for(&dir);

    runnable(&mut holder, "f");
    holder.start("f").await.unwrap();
    let pid = holder.get("f").unwrap().root_pid().unwrap();

    holder.pause("f").await.unwrap();
    assert_eq!(holder.get_data("f", "state").unwrap(), "paused");

    // Kill is defined on running containers only.
    let err = holder.kill("f", 9).unwrap_err();
    assert_eq!(err.code, EError::InvalidState);

    holder.resume("f").await.unwrap();
    assert_eq!(holder.get_data("f", "state").unwrap(), "running");

    holder.kill("f", 9).unwrap();
    assert!(!spawner.alive(pid));

    holder.reap().await;
    assert_eq!(holder.get_data("f", "state").unwrap(), "dead");
    let status: i32 = holder.get_data("f", "exit_status").unwrap().parse().unwrap();
    assert_eq!(status, 128 + 9);
}

#[tokio::test]
async fn properties_round_trip_and_gate_on_state() {
    let dir = TempDir::new().unwrap();
    let (mut holder, _) = holder_for(&dir);
    let cred = Cred::new(1000, 1000);

    runnable(&mut holder, "x");
    holder
        .set_property("x", "memory_limit", "1048576", cred)
        .unwrap();
    assert_eq!(holder.get_property("x", "memory_limit").unwrap(), "1048576");

    let err = holder
        .set_property("x", "memory_limit", "lots", cred)
        .unwrap_err();
    assert_eq!(err.code, EError::InvalidValue);
    // A failed set leaves the previous value visible.
    assert_eq!(holder.get_property("x", "memory_limit").unwrap(), "1048576");

    holder.start("x").await.unwrap();
    // Static property while running.
    let err = holder
        .set_property("x", "command", "true", cred)
        .unwrap_err();
    assert_eq!(err.code, EError::InvalidState);
    // Dynamic property while running.
    holder
        .set_property("x", "memory_limit", "2097152", cred)
        .unwrap();
    assert_eq!(holder.get_property("x", "memory_limit").unwrap(), "2097152");
}

#[tokio::test]
async fn superuser_and_unknown_properties() {
    let dir = TempDir::new().unwrap();
    let (mut holder, _) = holder_for(&dir);

    holder.create("x", Cred::new(1000, 1000)).unwrap();

    let err = holder
        .set_property("x", "devices", "c 1:3 rwm", Cred::new(1000, 1000))
        .unwrap_err();
    assert_eq!(err.code, EError::Permission);
    holder
        .set_property("x", "devices", "c 1:3 rwm", Cred::root())
        .unwrap();

    let err = holder
        .set_property("x", "flux_capacitor", "on", Cred::root())
        .unwrap_err();
    assert_eq!(err.code, EError::InvalidValue);
    assert_eq!(
        holder.get_property("x", "flux_capacitor").unwrap_err().code,
        EError::InvalidValue
    );
}

#[tokio::test]
async fn parent_default_resolves_through_ancestors() {
    let dir = TempDir::new().unwrap();
    let (mut holder, _) = holder_for(&dir);
    let cred = Cred::new(1000, 1000);

    holder.create("a", cred).unwrap();
    holder.create("a.b", cred).unwrap();
    holder.create("a.b.c", cred).unwrap();

    holder
        .set_property("a", "memory_limit", "1048576", cred)
        .unwrap();
    assert_eq!(
        holder.get_property("a.b", "memory_limit").unwrap(),
        "1048576"
    );
    assert_eq!(
        holder.get_property("a.b.c", "memory_limit").unwrap(),
        "1048576"
    );

    // An explicit child value shadows the chain.
    holder
        .set_property("a.b", "memory_limit", "4096", cred)
        .unwrap();
    assert_eq!(holder.get_property("a.b.c", "memory_limit").unwrap(), "4096");

    // Non-parent-default properties use the schema default.
    assert_eq!(holder.get_property("a.b", "cwd").unwrap(), "/");
}

#[tokio::test]
async fn persistence_survives_holder_restart() {
    let dir = TempDir::new().unwrap();
    let cred = Cred::new(1000, 1000);

    {
        let (mut holder, _) = holder_for(&dir);
        runnable(&mut holder, "x");
        holder
            .set_property("x", "memory_limit", "1048576", cred)
            .unwrap();
        holder.create("x.y", cred).unwrap();
    }

    let (mut holder, _) = holder_for(&dir);
    holder.restore().await.unwrap();

    assert_eq!(holder.get_property("x", "memory_limit").unwrap(), "1048576");
    assert_eq!(holder.get_property("x", "command").unwrap(), "sleep 1000");
    assert_eq!(holder.get_data("x", "state").unwrap(), "stopped");
    assert!(holder.get("x.y").is_some());
    assert_eq!(
        holder.get("x").unwrap().creds(),
        cred,
        "creator credentials survive restart"
    );
}

#[tokio::test]
async fn restore_reattaches_live_containers() {
    let dir = TempDir::new().unwrap();

    let spawner = {
        let (mut holder, spawner) = holder_for(&dir);
        runnable(&mut holder, "x");
        holder.start("x").await.unwrap();
        spawner
    };

    // Same spawner instance: the init "process" is still alive.
    let kv = KvStorage::open(dir.path().join("kv")).unwrap();
    let mut holder = ContainerHolder::new(
        registry_for(&dir),
        Arc::new(Network::disabled()),
        spawner.clone(),
        kv,
    );
    holder.restore().await.unwrap();
    assert_eq!(holder.get_data("x", "state").unwrap(), "running");

    // And with the process gone, the container restores as stopped.
    let pid = holder.get("x").unwrap().root_pid().unwrap();
    spawner.exit(pid, 0);

    let kv = KvStorage::open(dir.path().join("kv")).unwrap();
    let mut holder = ContainerHolder::new(
        registry_for(&dir),
        Arc::new(Network::disabled()),
        Arc::new(MockSpawner::new()),
        kv,
    );
    holder.restore().await.unwrap();
    assert_eq!(holder.get_data("x", "state").unwrap(), "stopped");
}

#[tokio::test]
async fn weak_containers_die_with_their_connection() {
    let dir = TempDir::new().unwrap();
    let (mut holder, _) = holder_for(&dir);

    holder.create_weak("w", Cred::new(1000, 1000), 7).unwrap();
    holder.create("solid", Cred::new(1000, 1000)).unwrap();

    holder.destroy_weak(7).await;
    assert!(holder.get("w").is_none());
    assert!(holder.get("solid").is_some());
}

#[tokio::test]
async fn respawn_restarts_dead_init() {
    let dir = TempDir::new().unwrap();
    let (mut holder, spawner) = holder_for(&dir);
    let cred = Cred::new(1000, 1000);

    runnable(&mut holder, "r");
    holder.set_property("r", "respawn", "true", cred).unwrap();
    holder.start("r").await.unwrap();
    let pid = holder.get("r").unwrap().root_pid().unwrap();

    spawner.exit(pid, 0);
    holder.reap().await;

    assert_eq!(holder.get_data("r", "state").unwrap(), "running");
    assert_eq!(holder.get_data("r", "respawn_count").unwrap(), "1");
    assert_ne!(holder.get("r").unwrap().root_pid().unwrap(), pid);
}

#[tokio::test]
async fn respawn_budget_is_honored() {
    let dir = TempDir::new().unwrap();
    let (mut holder, spawner) = holder_for(&dir);
    let cred = Cred::new(1000, 1000);

    runnable(&mut holder, "r");
    holder.set_property("r", "respawn", "true", cred).unwrap();
    holder.set_property("r", "max_respawns", "1", cred).unwrap();
    holder.start("r").await.unwrap();

    let pid = holder.get("r").unwrap().root_pid().unwrap();
    spawner.exit(pid, 0);
    holder.reap().await;
    assert_eq!(holder.get_data("r", "state").unwrap(), "running");

    let pid = holder.get("r").unwrap().root_pid().unwrap();
    spawner.exit(pid, 0);
    holder.reap().await;
    assert_eq!(holder.get_data("r", "state").unwrap(), "dead");
}

#[tokio::test]
async fn failed_start_unwinds_to_stopped() {
    let dir = TempDir::new().unwrap();
    let (mut holder, _) = holder_for(&dir);

    // No command set: the spawner refuses and start must unwind.
    holder.create("broken", Cred::root()).unwrap();
    let err = holder.start("broken").await.unwrap_err();
    assert_eq!(err.code, EError::InvalidValue);

    assert_eq!(holder.get_data("broken", "state").unwrap(), "stopped");
    assert!(!holder.get_data("broken", "last_error").unwrap().is_empty());
}

#[tokio::test]
async fn permission_model() {
    let dir = TempDir::new().unwrap();
    let (mut holder, _) = holder_for(&dir);

    holder.create("mine", Cred::new(1000, 1000)).unwrap();
    let container = holder.get("mine").unwrap();

    container.check_permission(Cred::new(1000, 1000)).unwrap();
    container.check_permission(Cred::root()).unwrap();
    let err = container.check_permission(Cred::new(2000, 2000)).unwrap_err();
    assert_eq!(err.code, EError::Permission);
}
