//! Registry lifecycle tests: single-flight connects, stop/start cycles and
//! cross-server isolation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use toolbridge::config::{
    DescriptorStore, MemoryStore, ServerDescriptor, ServerStatus, TransportConfig,
};
use toolbridge::mcp::{
    CallToolResult, ClientError, ClientRegistry, ConnectionState, RegistryError, ToolContent,
    ToolDescriptor, ToolInputSchema, Transport, TransportError, TransportFactory,
};

fn descriptor(id: &str) -> ServerDescriptor {
    ServerDescriptor {
        id: id.to_string(),
        name: format!("Server {id}"),
        transport: TransportConfig::Stdio {
            command: "unused".to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
        },
        status: ServerStatus::Stopped,
    }
}

/// Fake transport: counts sessions globally and answers `ping`.
struct FakeTransport {
    session_counter: Arc<AtomicUsize>,
    connect_delay: Duration,
    alive: bool,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&mut self) -> Result<Vec<ToolDescriptor>, TransportError> {
        self.session_counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.connect_delay).await;
        self.alive = true;
        Ok(vec![ToolDescriptor {
            name: "ping".to_string(),
            description: None,
            input_schema: ToolInputSchema::any_object(),
        }])
    }

    async fn call_tool(
        &mut self,
        _name: &str,
        _arguments: Option<Map<String, Value>>,
        _wait: Duration,
    ) -> Result<CallToolResult, TransportError> {
        if !self.alive {
            return Err(TransportError::ChannelClosed("session closed".to_string()));
        }
        Ok(CallToolResult {
            content: vec![ToolContent::Text { text: "pong".to_string() }],
            is_error: None,
        })
    }

    async fn close(&mut self) {
        self.alive = false;
    }

    fn kind(&self) -> &'static str {
        "fake"
    }
}

fn fake_factory(session_counter: Arc<AtomicUsize>, connect_delay: Duration) -> TransportFactory {
    Arc::new(move |_| {
        Box::new(FakeTransport {
            session_counter: session_counter.clone(),
            connect_delay,
            alive: false,
        }) as Box<dyn Transport + Send>
    })
}

fn registry_with(
    ids: &[&str],
    connect_delay: Duration,
) -> (Arc<ClientRegistry>, Arc<MemoryStore>, Arc<AtomicUsize>) {
    let sessions = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(MemoryStore::new(ids.iter().map(|id| descriptor(id)).collect()));
    let registry = Arc::new(ClientRegistry::with_factory(
        store.clone(),
        fake_factory(sessions.clone(), connect_delay),
    ));
    (registry, store, sessions)
}

/// Concurrent `get` calls for one id open exactly one session.
#[tokio::test]
async fn concurrent_gets_share_one_session() {
    let (registry, _, sessions) = registry_with(&["db"], Duration::from_millis(25));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get("db", true).await.unwrap() })
        })
        .collect();

    let handles: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(sessions.load(Ordering::SeqCst), 1);
    assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
}

/// Stop followed by get runs a fresh Connecting -> Connected cycle on a
/// fresh handle; nothing from before the stop is reused.
#[tokio::test]
async fn stop_then_get_reconnects_fresh() {
    let (registry, store, sessions) = registry_with(&["db"], Duration::ZERO);

    registry.start("db").await.unwrap();
    let old = registry.get("db", false).await.unwrap();
    assert_eq!(sessions.load(Ordering::SeqCst), 1);
    assert_eq!(store.get("db").unwrap().status, ServerStatus::Running);

    registry.stop("db").await.unwrap();
    assert_eq!(store.get("db").unwrap().status, ServerStatus::Stopped);
    assert_eq!(old.state().await, ConnectionState::Disconnected);

    let new = registry.get("db", true).await.unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(new.state().await, ConnectionState::Connected);
    assert_eq!(sessions.load(Ordering::SeqCst), 2);
}

/// After an explicit close, a call on the same handle transparently brings
/// up a new session instead of touching the dead one.
#[tokio::test]
async fn call_after_close_reconnects() {
    let (registry, _, sessions) = registry_with(&["db"], Duration::ZERO);

    let handle = registry.get("db", true).await.unwrap();
    handle.close().await;
    assert_eq!(handle.state().await, ConnectionState::Disconnected);

    let result = handle.call_tool("ping", None).await.unwrap();
    assert_eq!(result.text(), "pong");
    assert_eq!(sessions.load(Ordering::SeqCst), 2);
}

/// One server's transport failure never moves another handle's state.
#[tokio::test]
async fn failures_stay_isolated_per_server() {
    let sessions = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(MemoryStore::new(vec![descriptor("good"), descriptor("bad")]));
    let factory: TransportFactory = {
        let sessions = sessions.clone();
        Arc::new(move |d: &ServerDescriptor| {
            if d.id == "bad" {
                Box::new(RefusingTransport) as Box<dyn Transport + Send>
            } else {
                Box::new(FakeTransport {
                    session_counter: sessions.clone(),
                    connect_delay: Duration::ZERO,
                    alive: false,
                }) as Box<dyn Transport + Send>
            }
        })
    };
    let registry = ClientRegistry::with_factory(store, factory);

    let good = registry.get("good", true).await.unwrap();

    let err = registry.get("bad", true).await.unwrap_err();
    assert!(matches!(err, RegistryError::Client(ClientError::Connect { .. })));

    assert_eq!(good.state().await, ConnectionState::Connected);
    let bad = registry.get("bad", false).await.unwrap();
    assert_eq!(bad.state().await, ConnectionState::Disconnected);
    assert_eq!(registry.list_running().await.len(), 1);
}

/// Restart persists the stopped status on the way down and running on the
/// way back up.
#[tokio::test]
async fn restart_cycles_status_and_session() {
    let (registry, store, sessions) = registry_with(&["db"], Duration::ZERO);

    registry.start("db").await.unwrap();
    registry.restart("db").await.unwrap();

    assert_eq!(store.get("db").unwrap().status, ServerStatus::Running);
    assert_eq!(sessions.load(Ordering::SeqCst), 2);
    assert_eq!(registry.list_running().await.len(), 1);
}

/// Unknown ids are reported, not silently created.
#[tokio::test]
async fn unknown_server_is_an_error() {
    let (registry, _, _) = registry_with(&["db"], Duration::ZERO);

    assert!(matches!(
        registry.get("nope", true).await,
        Err(RegistryError::UnknownServer(_))
    ));
    assert!(matches!(
        registry.restart("nope").await,
        Err(RegistryError::UnknownServer(_))
    ));
}

struct RefusingTransport;

#[async_trait]
impl Transport for RefusingTransport {
    async fn connect(&mut self) -> Result<Vec<ToolDescriptor>, TransportError> {
        Err(TransportError::Handshake("connection refused".to_string()))
    }

    async fn call_tool(
        &mut self,
        _name: &str,
        _arguments: Option<Map<String, Value>>,
        _wait: Duration,
    ) -> Result<CallToolResult, TransportError> {
        Err(TransportError::ChannelClosed("never connected".to_string()))
    }

    async fn close(&mut self) {}

    fn kind(&self) -> &'static str {
        "fake"
    }
}
