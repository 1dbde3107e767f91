//! Backing-store surface the watcher aggregates over: entity lookups plus
//! the change-stream factories of the nine sources. Change tokens never
//! carry state, so every handler re-queries through this trait.

use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::ChangeStream;
use crate::Life;
use crate::RelationId;
use crate::RelationKey;
use crate::ResolvedMode;
use crate::ServiceTag;
use crate::StorageSnapshot;
use crate::StorageTag;
use crate::StoreError;
use crate::UnitTag;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub life: Life,
    pub resolved_mode: ResolvedMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub charm_url: Option<String>,
    pub force_charm_upgrade: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationInfo {
    pub id: RelationId,
    pub life: Life,
}

/// One attachment: the storage instance plus the unit it is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageAttachmentId {
    pub storage: StorageTag,
    pub unit: UnitTag,
}

/// Delta over the member units of one relation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationUnitsDelta {
    /// Units whose settings changed, with the new settings version.
    pub changed: HashMap<String, i64>,

    /// Units that left the relation.
    pub departed: Vec<String>,
}

/// Entity lookups and change-stream factories. Each `watch_*` factory
/// subscribes a fresh stream whose first token is an initial event.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UnitStateStore: Send + Sync + 'static {
    async fn unit(&self, unit: &UnitTag) -> StoreResult<UnitInfo>;

    async fn service(&self, service: &ServiceTag) -> StoreResult<ServiceInfo>;

    async fn relation(&self, key: &RelationKey) -> StoreResult<RelationInfo>;

    /// Full details for one attachment.
    async fn storage_attachment(&self, id: &StorageAttachmentId) -> StoreResult<StorageSnapshot>;

    /// Batched life query; one result per requested id, in order.
    async fn storage_attachment_life(
        &self,
        ids: &[StorageAttachmentId],
    ) -> StoreResult<Vec<StoreResult<Life>>>;

    async fn watch_unit(&self, unit: &UnitTag) -> StoreResult<ChangeStream<()>>;

    async fn watch_service(&self, service: &ServiceTag) -> StoreResult<ChangeStream<()>>;

    async fn watch_config_settings(&self, unit: &UnitTag) -> StoreResult<ChangeStream<()>>;

    async fn watch_unit_addresses(&self, unit: &UnitTag) -> StoreResult<ChangeStream<()>>;

    /// Tokens are lists of relation keys whose state may have changed.
    async fn watch_service_relations(
        &self,
        service: &ServiceTag,
    ) -> StoreResult<ChangeStream<Vec<RelationKey>>>;

    /// Tokens are lists of storage tags whose attachment may have changed.
    async fn watch_unit_storage(&self, unit: &UnitTag)
        -> StoreResult<ChangeStream<Vec<StorageTag>>>;

    async fn watch_leadership_settings(
        &self,
        service: &ServiceTag,
    ) -> StoreResult<ChangeStream<()>>;

    /// Member-unit deltas for one relation, scoped to the given unit.
    async fn watch_relation_units(
        &self,
        key: &RelationKey,
        unit: &UnitTag,
    ) -> StoreResult<ChangeStream<RelationUnitsDelta>>;

    async fn watch_storage_attachment(
        &self,
        id: &StorageAttachmentId,
    ) -> StoreResult<ChangeStream<()>>;
}
