//! Consolidated view of everything the backing store knows about one unit.
//!
//! The [`Snapshot`] is the single datum shared between the aggregator loop
//! and external consumers. Reads are copy-on-read: callers always get an
//! owned value and never observe a half-applied handler.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Lifecycle phase of a unit, service, relation, or storage attachment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Life {
    #[default]
    Alive,
    Dying,
    Dead,
}

/// How a previously failed operation has been resolved by an operator.
///
/// Cleared (back to `None`) through
/// [`crate::RemoteStateWatcher::clear_resolved_mode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolvedMode {
    #[default]
    None,
    RetryHooks,
    NoHooks,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    #[default]
    Unknown,
    Block,
    Filesystem,
}

/// Server-side identifier of one relation between two services.
pub type RelationId = u64;

macro_rules! name_tag {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                $name(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

name_tag!(
    /// A unit name such as `"app/0"`.
    UnitTag
);
name_tag!(
    /// A service name such as `"app"`.
    ServiceTag
);
name_tag!(
    /// A relation key such as `"app:db other:db"`.
    RelationKey
);
name_tag!(
    /// A storage instance name such as `"data/0"`.
    StorageTag
);

impl UnitTag {
    /// The owning service, derived from the unit name.
    pub fn service(&self) -> ServiceTag {
        let name = match self.0.split_once('/') {
            Some((service, _)) => service,
            None => self.0.as_str(),
        };
        ServiceTag::new(name)
    }
}

/// The authoritative consolidated view of one unit's remote state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub life: Life,

    /// Operator resolution of a failed operation, if any.
    pub resolved_mode: ResolvedMode,

    /// Artifact the service is expected to run. `None` until the first
    /// service refresh reports one.
    pub charm_url: Option<String>,

    /// Whether an artifact upgrade must proceed even while the unit is busy.
    pub force_charm_upgrade: bool,

    /// Bumped on unit-config and unit-address changes alike; both invalidate
    /// the same derived configuration downstream.
    pub config_version: u64,

    pub leader_settings_version: u64,

    /// Whether this unit currently holds service leadership.
    pub leader: bool,

    /// Relations the unit is in scope for, keyed by relation id.
    pub relations: HashMap<RelationId, RelationSnapshot>,

    /// Storage attachments the backing store reports as existing.
    pub storage: HashMap<StorageTag, StorageSnapshot>,
}

/// State of one relation, as far as this unit needs to know it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationSnapshot {
    pub life: Life,

    /// Member units currently in the relation and the version of their last
    /// seen settings.
    pub members: HashMap<String, i64>,
}

/// State of one storage attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageSnapshot {
    pub tag: StorageTag,
    pub life: Life,
    pub kind: StorageKind,
    pub location: String,
    pub attached: bool,
}

impl StorageSnapshot {
    /// A placeholder entry for an attachment whose details have not yet been
    /// reported by its attachment watcher.
    pub fn placeholder(tag: StorageTag) -> Self {
        StorageSnapshot {
            tag,
            life: Life::Alive,
            kind: StorageKind::Unknown,
            location: String::new(),
            attached: false,
        }
    }
}
