//! Agent relay broker daemon: registry, delivery tracker, router, connection
//! handling, and the lifecycle that wires them together.
//!
//! Mirrors the flat-module-plus-curated-re-export shape of the teacher's
//! `sven-p2p` crate (`sven-p2p/src/lib.rs`): every concern gets its own
//! module, and the handful of types callers actually construct are
//! re-exported here.

pub mod cloud_sync;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod error;
pub mod files;
pub mod membership;
pub mod registry;
pub mod router;
pub mod session;
pub mod storage;
pub mod tracker;

pub use cloud_sync::{CloudSync, NoopCloudSync};
pub use config::{workspace_namespaced_socket_path, DaemonConfig, DEFAULT_SOCKET_PATH};
pub use daemon::run;
pub use error::{DaemonError, HandshakeError};
pub use membership::{InMemoryMembershipStore, MembershipAction, MembershipStore};
pub use registry::{is_reserved_name, AgentRecord, AgentRegistry, EntityType};
pub use router::{Router, RouterHandle, ShadowBinding, WelcomeOutcome};
pub use session::{Session, SessionStore};
pub use storage::{InMemoryStorage, MessageFilter, MessageStatus, NullStorage, StorageAdapter};
