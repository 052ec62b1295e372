//! Server descriptor configuration and the external store.
//!
//! Server descriptors are owned by an external configuration document. This
//! module reads them and writes status updates back; everything else in the
//! crate treats descriptors as read-only input.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Default location of the server configuration document.
static DEFAULT_STORE_PATH: Lazy<PathBuf> = Lazy::new(|| {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("toolbridge").join("servers.json")
});

/// Error type for configuration store operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown server: {0}")]
    UnknownServer(String),
}

/// Persisted lifecycle status of a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Server should not be running
    #[default]
    Stopped,
    /// Server should be running
    Running,
    /// Last lifecycle operation failed
    Error,
}

/// Transport-specific connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transportKind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Subprocess reached over its stdio pipe pair.
    #[serde(rename_all = "camelCase")]
    Stdio {
        /// Command to run
        command: String,
        /// Command arguments
        #[serde(default)]
        args: Vec<String>,
        /// Environment variables (values may reference `$VARS`)
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// HTTP endpoint with a server-to-client event stream.
    #[serde(rename_all = "camelCase")]
    Http {
        /// URL of the event-stream endpoint
        base_url: String,
        /// Extra request headers (authorization and the like)
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    /// Short transport kind label, matching the serialized tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
        }
    }
}

/// One configured tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// How to reach the server
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Persisted lifecycle status
    #[serde(default)]
    pub status: ServerStatus,
}

/// The configuration document as persisted on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    servers: Vec<ServerDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

/// Read access to server descriptors plus status write-back.
///
/// The registry takes this as an injected dependency so tests can run
/// against an in-memory store.
pub trait DescriptorStore: Send + Sync {
    /// All configured servers.
    fn list(&self) -> Vec<ServerDescriptor>;

    /// Look up one server by id.
    fn get(&self, id: &str) -> Option<ServerDescriptor>;

    /// Persist a status change for one server.
    fn update_status(&self, id: &str, status: ServerStatus) -> Result<(), ConfigError>;
}

/// File-backed store over a JSON document.
pub struct FileStore {
    path: PathBuf,
    document: RwLock<StoreDocument>,
}

impl FileStore {
    /// Load the store from the given path. A missing file yields an empty
    /// document; it is created on the first status update.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let document = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            StoreDocument::default()
        };
        Ok(Self { path, document: RwLock::new(document) })
    }

    /// Load the store from the default location.
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(&*DEFAULT_STORE_PATH)
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, document: &StoreDocument) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(document)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl DescriptorStore for FileStore {
    fn list(&self) -> Vec<ServerDescriptor> {
        self.document.read().servers.clone()
    }

    fn get(&self, id: &str) -> Option<ServerDescriptor> {
        self.document.read().servers.iter().find(|s| s.id == id).cloned()
    }

    fn update_status(&self, id: &str, status: ServerStatus) -> Result<(), ConfigError> {
        let mut document = self.document.write();
        let server = document
            .servers
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| ConfigError::UnknownServer(id.to_string()))?;
        server.status = status;
        document.updated_at = Some(Utc::now());
        self.save(&document)
    }
}

/// In-memory store for tests and ephemeral setups.
#[derive(Default)]
pub struct MemoryStore {
    servers: RwLock<Vec<ServerDescriptor>>,
}

impl MemoryStore {
    /// Create a store holding the given descriptors.
    pub fn new(servers: Vec<ServerDescriptor>) -> Self {
        Self { servers: RwLock::new(servers) }
    }
}

impl DescriptorStore for MemoryStore {
    fn list(&self) -> Vec<ServerDescriptor> {
        self.servers.read().clone()
    }

    fn get(&self, id: &str) -> Option<ServerDescriptor> {
        self.servers.read().iter().find(|s| s.id == id).cloned()
    }

    fn update_status(&self, id: &str, status: ServerStatus) -> Result<(), ConfigError> {
        let mut servers = self.servers.write();
        let server = servers
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| ConfigError::UnknownServer(id.to_string()))?;
        server.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_descriptor(id: &str) -> ServerDescriptor {
        ServerDescriptor {
            id: id.to_string(),
            name: format!("Server {id}"),
            transport: TransportConfig::Stdio {
                command: "echo".to_string(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
            },
            status: ServerStatus::Stopped,
        }
    }

    #[test]
    fn test_descriptor_serialization_shape() {
        let descriptor = ServerDescriptor {
            id: "db".to_string(),
            name: "Database".to_string(),
            transport: TransportConfig::Http {
                base_url: "http://localhost:8080/sse".to_string(),
                headers: HashMap::new(),
            },
            status: ServerStatus::Running,
        };

        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["transportKind"], "http");
        assert_eq!(json["baseUrl"], "http://localhost:8080/sse");
        assert_eq!(json["status"], "running");
    }

    #[test]
    fn test_descriptor_stdio_defaults() {
        let descriptor: ServerDescriptor = serde_json::from_value(serde_json::json!({
            "id": "fs",
            "name": "Filesystem",
            "transportKind": "stdio",
            "command": "npx"
        }))
        .unwrap();

        match descriptor.transport {
            TransportConfig::Stdio { ref command, ref args, .. } => {
                assert_eq!(command, "npx");
                assert!(args.is_empty());
            }
            TransportConfig::Http { .. } => panic!("expected stdio transport"),
        }
        assert_eq!(descriptor.status, ServerStatus::Stopped);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");

        let document = StoreDocument {
            servers: vec![stdio_descriptor("a"), stdio_descriptor("b")],
            updated_at: None,
        };
        std::fs::write(&path, serde_json::to_string(&document).unwrap()).unwrap();

        let store = FileStore::load(&path).unwrap();
        assert_eq!(store.list().len(), 2);
        assert!(store.get("a").is_some());
        assert!(store.get("missing").is_none());

        store.update_status("a", ServerStatus::Running).unwrap();

        let reloaded = FileStore::load(&path).unwrap();
        assert_eq!(reloaded.get("a").unwrap().status, ServerStatus::Running);
    }

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::load(dir.path().join("nope.json")).unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_memory_store_update_status() {
        let store = MemoryStore::new(vec![stdio_descriptor("a")]);

        store.update_status("a", ServerStatus::Error).unwrap();
        assert_eq!(store.get("a").unwrap().status, ServerStatus::Error);

        assert!(matches!(
            store.update_status("missing", ServerStatus::Stopped),
            Err(ConfigError::UnknownServer(_))
        ));
    }
}
