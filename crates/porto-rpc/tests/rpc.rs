//! End-to-end RPC scenarios over a real unix socket with mock kernel
//! seams behind the runtime.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use porto_cgroup::{CgroupRegistry, SubsystemKind};
use porto_container::MockSpawner;
use porto_core::{Config, Runtime};
use porto_error::EError;
use porto_net::Network;
use porto_rpc::framing::{read_message, write_message};
use porto_rpc::protocol::container_request::Request;
use porto_rpc::protocol::{
    ContainerRequest, ContainerResponse, CreateRequest, DestroyRequest, GetDataRequest,
    GetPropertyRequest, KillRequest, ListRequest, SetPropertyRequest, StartRequest, StopRequest,
    VersionRequest, WaitRequest,
};
use porto_rpc::Server;
use tempfile::TempDir;
use tokio::net::UnixStream;

struct Client {
    stream: UnixStream,
}

impl Client {
    async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        Self { stream }
    }

    async fn call(&mut self, request: Request) -> ContainerResponse {
        let req = ContainerRequest {
            request: Some(request),
        };
        write_message(&mut self.stream, &req).await.unwrap();
        read_message(&mut self.stream).await.unwrap().unwrap()
    }

    async fn read_frame(&mut self) -> ContainerResponse {
        read_message(&mut self.stream).await.unwrap().unwrap()
    }
}

struct Daemon {
    _dir: TempDir,
    runtime: Arc<Runtime>,
    _spawner: Arc<MockSpawner>,
    socket: std::path::PathBuf,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn daemon() -> Daemon {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("portod.socket");
    let mounts: HashMap<_, _> = SubsystemKind::ALL
        .into_iter()
        .map(|kind| (kind, dir.path().join("cgroup").join(kind.as_str())))
        .collect();

    let config = Config {
        socket_path: socket.clone(),
        data_dir: dir.path().join("data"),
        ..Config::default()
    };
    let spawner = Arc::new(MockSpawner::new());
    let runtime = Arc::new(
        Runtime::with_parts(
            config,
            Arc::new(CgroupRegistry::with_mounts(mounts)),
            Arc::new(Network::disabled()),
            spawner.clone(),
        )
        .unwrap(),
    );
    runtime.init().await.unwrap();

    let server_runtime = Arc::clone(&runtime);
    let server = tokio::spawn(async move {
        let _ = Server::new(server_runtime).run().await;
    });

    // Wait for the socket to appear.
    while !socket.exists() {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    Daemon {
        _dir: dir,
        runtime,
        _spawner: spawner,
        socket,
        server,
    }
}

fn create(name: &str) -> Request {
    Request::Create(CreateRequest {
        name: name.to_string(),
    })
}

fn set(name: &str, property: &str, value: &str) -> Request {
    Request::SetProperty(SetPropertyRequest {
        name: name.to_string(),
        property: property.to_string(),
        value: value.to_string(),
    })
}

fn get_data(name: &str, data: &str) -> Request {
    Request::GetData(GetDataRequest {
        name: name.to_string(),
        data: data.to_string(),
    })
}

fn start(name: &str) -> Request {
    Request::Start(StartRequest {
        name: name.to_string(),
    })
}

#[tokio::test]
async fn lifecycle_over_the_wire() {
    let daemon = daemon().await;
    let mut client = Client::connect(&daemon.socket).await;

    let rsp = client.call(create("a")).await;
    assert_eq!(rsp.error, EError::Success.code());

    let rsp = client.call(set("a", "command", "sleep 1000")).await;
    assert_eq!(rsp.error, EError::Success.code());

    let rsp = client.call(start("a")).await;
    assert_eq!(rsp.error, EError::Success.code());

    let rsp = client.call(get_data("a", "state")).await;
    assert_eq!(rsp.get_data.unwrap().value, "running");

    let rsp = client
        .call(Request::Stop(StopRequest {
            name: "a".to_string(),
            timeout_ms: Some(1000),
        }))
        .await;
    assert_eq!(rsp.error, EError::Success.code());

    let rsp = client.call(get_data("a", "state")).await;
    assert_eq!(rsp.get_data.unwrap().value, "stopped");
}

#[tokio::test]
async fn errors_carry_wire_codes_and_keep_the_connection() {
    let daemon = daemon().await;
    let mut client = Client::connect(&daemon.socket).await;

    let rsp = client
        .call(Request::Start(StartRequest {
            name: "ghost".to_string(),
        }))
        .await;
    assert_eq!(rsp.error, EError::ContainerDoesNotExist.code());
    assert!(!rsp.error_msg.is_empty());

    // An empty request selects no method.
    let rsp = {
        write_message(
            &mut client.stream,
            &ContainerRequest { request: None },
        )
        .await
        .unwrap();
        client.read_frame().await
    };
    assert_eq!(rsp.error, EError::InvalidMethod.code());

    // The same connection keeps working afterwards.
    let rsp = client.call(Request::Version(VersionRequest {})).await;
    assert_eq!(rsp.error, EError::Success.code());
    assert_eq!(rsp.version.unwrap().tag, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn list_and_schema_listings() {
    let daemon = daemon().await;
    let mut client = Client::connect(&daemon.socket).await;

    client.call(create("web")).await;
    client.call(create("web.front")).await;
    client.call(create("db")).await;

    let rsp = client
        .call(Request::List(ListRequest {
            mask: Some("web*".to_string()),
        }))
        .await;
    assert_eq!(
        rsp.list.unwrap().name,
        vec!["web".to_string(), "web.front".to_string()]
    );

    let rsp = client
        .call(Request::PropertyList(Default::default()))
        .await;
    let names: Vec<String> = rsp
        .property_list
        .unwrap()
        .list
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert!(names.contains(&"memory_limit".to_string()));

    let rsp = client.call(Request::DataList(Default::default())).await;
    let names: Vec<String> = rsp
        .data_list
        .unwrap()
        .list
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert!(names.contains(&"state".to_string()));
    assert!(names.contains(&"exit_status".to_string()));
}

#[tokio::test]
async fn property_round_trip_over_the_wire() {
    let daemon = daemon().await;
    let mut client = Client::connect(&daemon.socket).await;

    client.call(create("x")).await;
    let rsp = client.call(set("x", "memory_limit", "1048576")).await;
    assert_eq!(rsp.error, EError::Success.code());

    let rsp = client
        .call(Request::GetProperty(GetPropertyRequest {
            name: "x".to_string(),
            property: "memory_limit".to_string(),
        }))
        .await;
    assert_eq!(rsp.get_property.unwrap().value, "1048576");

    let rsp = client.call(set("x", "memory_limit", "garbage")).await;
    assert_eq!(rsp.error, EError::InvalidValue.code());
}

#[tokio::test]
async fn wait_resolves_immediately_for_terminal_containers() {
    let daemon = daemon().await;
    let mut client = Client::connect(&daemon.socket).await;

    client.call(create("t")).await;
    let rsp = client
        .call(Request::Wait(WaitRequest {
            name: vec!["t".to_string()],
            timeout_ms: Some(0),
        }))
        .await;
    assert_eq!(rsp.error, EError::Success.code());
    assert_eq!(rsp.wait.unwrap().name, "t");
}

#[tokio::test]
async fn wait_parks_until_a_container_dies() {
    let daemon = daemon().await;
    let mut waiter = Client::connect(&daemon.socket).await;
    let mut driver = Client::connect(&daemon.socket).await;

    driver.call(create("w")).await;
    driver.call(set("w", "command", "sleep 1000")).await;
    driver.call(start("w")).await;

    let wait_fut = waiter.call(Request::Wait(WaitRequest {
        name: vec!["w".to_string()],
        timeout_ms: Some(5000),
    }));

    let kill_fut = async {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        driver
            .call(Request::Kill(KillRequest {
                name: "w".to_string(),
                sig: 9,
            }))
            .await;
        // The reaper turns the dead init into the Dead state.
        let mut state = daemon.runtime.state.lock().await;
        state.holder.reap().await;
    };

    let (rsp, ()) = tokio::join!(wait_fut, kill_fut);
    assert_eq!(rsp.error, EError::Success.code());
    assert_eq!(rsp.wait.unwrap().name, "w");
}

#[tokio::test]
async fn async_wait_pushes_frames_on_the_same_connection() {
    let daemon = daemon().await;
    let mut client = Client::connect(&daemon.socket).await;

    client.call(create("aw")).await;
    client.call(set("aw", "command", "sleep 1000")).await;
    client.call(start("aw")).await;

    let rsp = client
        .call(Request::AsyncWait(WaitRequest {
            name: vec!["aw".to_string()],
            timeout_ms: None,
        }))
        .await;
    assert_eq!(rsp.error, EError::Success.code());
    assert!(rsp.async_wait.is_none());

    // Stop through a second connection; the first gets the event frame.
    let mut driver = Client::connect(&daemon.socket).await;
    driver
        .call(Request::Stop(StopRequest {
            name: "aw".to_string(),
            timeout_ms: Some(1000),
        }))
        .await;

    let frame = client.read_frame().await;
    let event = frame.async_wait.unwrap();
    assert_eq!(event.name, "aw");
    assert_eq!(event.state, "stopped");
}

#[tokio::test]
async fn weak_containers_vanish_with_their_connection() {
    let daemon = daemon().await;

    {
        let mut owner = Client::connect(&daemon.socket).await;
        let rsp = owner
            .call(Request::CreateWeak(CreateRequest {
                name: "w".to_string(),
            }))
            .await;
        assert_eq!(rsp.error, EError::Success.code());
    }

    // The daemon reaps the weak container after the socket closes.
    let mut observer = Client::connect(&daemon.socket).await;
    for _ in 0..100 {
        let rsp = observer.call(Request::List(ListRequest { mask: None })).await;
        if !rsp.list.unwrap().name.contains(&"w".to_string()) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("weak container survived its connection");
}

#[tokio::test]
async fn destroy_cascades_over_the_wire() {
    let daemon = daemon().await;
    let mut client = Client::connect(&daemon.socket).await;

    client.call(create("a")).await;
    client.call(create("a.b")).await;
    client.call(set("a", "command", "sleep 1")).await;
    client.call(set("a.b", "command", "sleep 1")).await;
    client.call(start("a")).await;
    client.call(start("a.b")).await;

    let rsp = client
        .call(Request::Destroy(DestroyRequest {
            name: "a".to_string(),
        }))
        .await;
    assert_eq!(rsp.error, EError::Success.code());

    let rsp = client.call(Request::List(ListRequest { mask: None })).await;
    assert!(rsp.list.unwrap().name.is_empty());
}

#[tokio::test]
async fn concurrent_sets_are_serialized() {
    let daemon = daemon().await;
    let mut setup = Client::connect(&daemon.socket).await;
    setup.call(create("race")).await;

    let socket = daemon.socket.clone();
    let writer_a = tokio::spawn({
        let socket = socket.clone();
        async move {
            let mut client = Client::connect(&socket).await;
            for i in 0..50 {
                client
                    .call(set("race", "memory_limit", &format!("{}", 4096 + i)))
                    .await;
            }
        }
    });
    let writer_b = tokio::spawn({
        let socket = socket.clone();
        async move {
            let mut client = Client::connect(&socket).await;
            for i in 0..50 {
                client
                    .call(set("race", "memory_limit", &format!("{}", 8192 + i)))
                    .await;
            }
        }
    });

    writer_a.await.unwrap();
    writer_b.await.unwrap();

    let rsp = setup
        .call(Request::GetProperty(GetPropertyRequest {
            name: "race".to_string(),
            property: "memory_limit".to_string(),
        }))
        .await;
    let value: u64 = rsp.get_property.unwrap().value.parse().unwrap();
    // The final value is one of the written values, never corrupted.
    assert!((4096..4146).contains(&value) || (8192..8242).contains(&value));
}
