//! Process-wide registry of server connection handles.
//!
//! The registry is an explicit object over an injected descriptor store, not
//! a module-level singleton; tests build independent registries around an
//! in-memory store. The handle map has its own lock so one server's connect
//! never blocks operations on unrelated servers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::handle::{default_transport_factory, ClientError, ClientHandle, TransportFactory};
use crate::config::{ConfigError, DescriptorStore, ServerDescriptor, ServerStatus, TransportConfig};

/// Settle delay between stop and start when restarting a stdio server.
pub const STDIO_SETTLE: Duration = Duration::from_millis(250);

/// Settle delay for http servers, whose stream teardown outlives subprocess
/// teardown.
pub const HTTP_SETTLE: Duration = Duration::from_millis(750);

/// Error type for registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("store error: {0}")]
    Store(#[from] ConfigError),
}

/// Map from server id to its single connection handle.
pub struct ClientRegistry {
    store: Arc<dyn DescriptorStore>,
    factory: TransportFactory,
    clients: Mutex<HashMap<String, Arc<ClientHandle>>>,
}

impl ClientRegistry {
    /// Create a registry over a descriptor store.
    pub fn new(store: Arc<dyn DescriptorStore>) -> Self {
        Self::with_factory(store, default_transport_factory())
    }

    /// Create a registry with a custom transport factory.
    pub fn with_factory(store: Arc<dyn DescriptorStore>, factory: TransportFactory) -> Self {
        Self { store, factory, clients: Mutex::new(HashMap::new()) }
    }

    /// Get the handle for a server, creating it on first use. With `connect`
    /// the handle is also brought to Connected before returning.
    ///
    /// Concurrent calls for the same id always observe the same handle; the
    /// map lock makes check-then-create single-flight and the handle's own
    /// mutex makes the connect single-flight.
    pub async fn get(
        &self,
        id: &str,
        connect: bool,
    ) -> Result<Arc<ClientHandle>, RegistryError> {
        let handle = {
            let mut clients = self.clients.lock().await;
            match clients.get(id) {
                Some(handle) => handle.clone(),
                None => {
                    let descriptor = self
                        .store
                        .get(id)
                        .ok_or_else(|| RegistryError::UnknownServer(id.to_string()))?;
                    let handle =
                        Arc::new(ClientHandle::with_factory(descriptor, self.factory.clone()));
                    clients.insert(id.to_string(), handle.clone());
                    handle
                }
            }
        };

        if connect {
            handle.ensure_connected().await?;
        }
        Ok(handle)
    }

    /// Connect a server and persist its running status.
    pub async fn start(&self, id: &str) -> Result<(), RegistryError> {
        match self.get(id, true).await {
            Ok(_) => {
                self.store.update_status(id, ServerStatus::Running)?;
                tracing::info!(server = id, "started");
                Ok(())
            }
            Err(e) => {
                // Best effort; the connect failure is the interesting error.
                let _ = self.store.update_status(id, ServerStatus::Error);
                Err(e)
            }
        }
    }

    /// Close a server's handle and persist its stopped status.
    ///
    /// The close always runs first: if the status write fails midway, the
    /// persisted state still reads "probably stopped" rather than claiming a
    /// connection that no longer exists.
    pub async fn stop(&self, id: &str) -> Result<(), RegistryError> {
        let handle = self.clients.lock().await.remove(id);
        if let Some(handle) = handle {
            handle.close().await;
        }
        self.store.update_status(id, ServerStatus::Stopped)?;
        tracing::info!(server = id, "stopped");
        Ok(())
    }

    /// Stop, wait for the transport to settle, then start again.
    pub async fn restart(&self, id: &str) -> Result<(), RegistryError> {
        let descriptor = self
            .store
            .get(id)
            .ok_or_else(|| RegistryError::UnknownServer(id.to_string()))?;

        self.stop(id).await?;

        let settle = match descriptor.transport {
            TransportConfig::Stdio { .. } => STDIO_SETTLE,
            TransportConfig::Http { .. } => HTTP_SETTLE,
        };
        tokio::time::sleep(settle).await;

        self.start(id).await
    }

    /// Handles that currently hold a live session.
    pub async fn running_handles(&self) -> Vec<Arc<ClientHandle>> {
        let handles: Vec<Arc<ClientHandle>> =
            self.clients.lock().await.values().cloned().collect();
        let mut running = Vec::new();
        for handle in handles {
            if handle.is_connected().await {
                running.push(handle);
            }
        }
        running
    }

    /// Descriptors of every connected server.
    pub async fn list_running(&self) -> Vec<ServerDescriptor> {
        self.running_handles().await.iter().map(|h| h.descriptor().clone()).collect()
    }

    /// Close every handle. Used at shutdown.
    pub async fn close_all(&self) {
        let handles: Vec<Arc<ClientHandle>> =
            self.clients.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::{Map, Value};

    use super::*;
    use crate::config::MemoryStore;
    use crate::mcp::protocol::{CallToolResult, ToolContent, ToolDescriptor, ToolInputSchema};
    use crate::mcp::transport::{Transport, TransportError};

    fn stdio_descriptor(id: &str) -> ServerDescriptor {
        ServerDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            transport: TransportConfig::Stdio {
                command: "unused".to_string(),
                args: vec![],
                env: StdHashMap::new(),
                cwd: None,
            },
            status: ServerStatus::Stopped,
        }
    }

    struct CountingTransport {
        connects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn connect(&mut self) -> Result<Vec<ToolDescriptor>, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            // Hold the connect open long enough for racers to pile up.
            tokio::time::sleep(Duration::from_millis(20)).await;
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
            Ok(CallToolResult {
                content: vec![ToolContent::Text { text: "pong".to_string() }],
                is_error: None,
            })
        }

        async fn close(&mut self) {}

        fn kind(&self) -> &'static str {
            "fake"
        }
    }

    fn counting_registry(ids: &[&str]) -> (ClientRegistry, Arc<AtomicUsize>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let factory: TransportFactory = {
            let connects = connects.clone();
            Arc::new(move |_| {
                Box::new(CountingTransport { connects: connects.clone() })
                    as Box<dyn Transport + Send>
            })
        };
        let store =
            Arc::new(MemoryStore::new(ids.iter().map(|id| stdio_descriptor(id)).collect()));
        (ClientRegistry::with_factory(store, factory), connects)
    }

    #[tokio::test]
    async fn test_get_unknown_server() {
        let (registry, _) = counting_registry(&["a"]);
        assert!(matches!(
            registry.get("missing", false).await,
            Err(RegistryError::UnknownServer(_))
        ));
    }

    #[tokio::test]
    async fn test_get_without_connect_is_lazy() {
        let (registry, connects) = counting_registry(&["a"]);
        let handle = registry.get("a", false).await.unwrap();
        assert!(!handle.is_connected().await);
        assert_eq!(connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_get_is_single_flight() {
        let (registry, connects) = counting_registry(&["a"]);
        let registry = Arc::new(registry);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move { registry.get("a", true).await.unwrap() }));
        }
        let handles: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        for pair in handles.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }

    #[tokio::test]
    async fn test_stop_closes_and_persists() {
        let ids = ["a"];
        let connects = Arc::new(AtomicUsize::new(0));
        let factory: TransportFactory = {
            let connects = connects.clone();
            Arc::new(move |_| {
                Box::new(CountingTransport { connects: connects.clone() })
                    as Box<dyn Transport + Send>
            })
        };
        let store =
            Arc::new(MemoryStore::new(ids.iter().map(|id| stdio_descriptor(id)).collect()));
        let registry = ClientRegistry::with_factory(store.clone(), factory);

        registry.start("a").await.unwrap();
        assert_eq!(store.get("a").unwrap().status, ServerStatus::Running);
        assert_eq!(registry.list_running().await.len(), 1);

        registry.stop("a").await.unwrap();
        assert_eq!(store.get("a").unwrap().status, ServerStatus::Stopped);
        assert!(registry.list_running().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_then_get_builds_fresh_handle() {
        let (registry, connects) = counting_registry(&["a"]);

        let before = registry.get("a", true).await.unwrap();
        registry.stop("a").await.unwrap();

        let after = registry.get("a", true).await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.is_connected().await);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_isolation_between_servers() {
        // Server "bad" never connects; server "good" must be unaffected.
        let connects = Arc::new(AtomicUsize::new(0));
        let factory: TransportFactory = {
            let connects = connects.clone();
            Arc::new(move |descriptor: &ServerDescriptor| {
                if descriptor.id == "bad" {
                    Box::new(FailingTransport) as Box<dyn Transport + Send>
                } else {
                    Box::new(CountingTransport { connects: connects.clone() })
                        as Box<dyn Transport + Send>
                }
            })
        };
        let store = Arc::new(MemoryStore::new(vec![
            stdio_descriptor("good"),
            stdio_descriptor("bad"),
        ]));
        let registry = ClientRegistry::with_factory(store, factory);

        let good = registry.get("good", true).await.unwrap();
        assert!(registry.get("bad", true).await.is_err());

        assert!(good.is_connected().await);
        assert_eq!(registry.list_running().await.len(), 1);
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn connect(&mut self) -> Result<Vec<ToolDescriptor>, TransportError> {
            Err(TransportError::Handshake("refused".to_string()))
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
}
