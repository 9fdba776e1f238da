//! # Codex Sync Engine
//!
//! The deterministic core of the DM Codex local-first store.
//!
//! This crate holds the pieces of multi-device synchronization that can be
//! expressed as pure logic: the entity model, version stamps, conflict
//! resolution, the offline operation queue, the persistence key namespace,
//! shape validation of remote documents and the backup format. The async
//! runtime that drives them lives in the `codex-sync` crate.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches storage, network or clocks
//! - **Deterministic**: the same inputs always produce the same decisions
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Entities
//!
//! Data is stored as flat JSON documents with:
//! - Stable ID
//! - Sync version (monotonic per entity, the only ordering signal)
//! - Device ID of the device that produced the version
//! - Advisory timestamps (never used for ordering)
//! - Opaque application payload
//!
//! ### Version Stamps
//!
//! A [`VersionStamp`] pairs a sync version with a device ID. Stamps are totally
//! ordered: higher version wins, equal versions fall back to the
//! lexicographically larger device ID.
//!
//! ### Conflict Resolution
//!
//! The [`ConflictResolver`] decides whether an incoming remote copy replaces
//! the local one ([`Resolution::ApplyRemote`]), loses to it
//! ([`Resolution::KeepLocal`], the caller re-publishes) or is ignored
//! ([`Resolution::NoOp`], e.g. echoes of this device's own writes).
//!
//! ### Pending Operations
//!
//! The [`PendingOpsQueue`] buffers publishes that could not reach the remote
//! store and collapses them per entity before replay.
//!
//! ## Quick Start
//!
//! ```rust
//! use codex_sync_engine::{ConflictResolver, Entity, Resolution};
//! use serde_json::json;
//!
//! let resolver = ConflictResolver::new("device-aaa");
//!
//! let local = Entity::from_payload("camp-1", json!({"name": "Camp1"}))
//!     .unwrap()
//!     .with_version(5, "device-aaa");
//! let remote = Entity::from_payload("camp-1", json!({"name": "Camp1 (edited)"}))
//!     .unwrap()
//!     .with_version(5, "device-bbb");
//!
//! let decision = resolver.resolve(Some(&local), &remote);
//! assert_eq!(decision.resolution, Resolution::ApplyRemote);
//! ```

pub mod backup;
pub mod entity;
pub mod error;
pub mod keyspace;
pub mod pending;
pub mod resolver;
pub mod schema;
pub mod version;

// Re-export main types at crate root
pub use backup::{Backup, BACKUP_FORMAT_VERSION};
pub use entity::{Entity, RESERVED_FIELDS};
pub use error::Error;
pub use keyspace::{DocumentKey, Keyspace, DEFAULT_PREFIX};
pub use pending::{EnqueueOutcome, PendingOperation, PendingOpsQueue, QueueReason};
pub use resolver::{ConflictResolver, Decision, Reason, Resolution};
pub use schema::{CollectionSchema, FieldDef, FieldType, Schema};
pub use version::VersionStamp;

/// Type aliases for clarity
pub type EntityId = String;
pub type CollectionName = String;
pub type DeviceId = String;
pub type UserId = String;
pub type SyncVersion = u64;
pub type Timestamp = u64;

/// A flat JSON document as it is stored locally and remotely.
pub type Document = serde_json::Map<String, serde_json::Value>;
