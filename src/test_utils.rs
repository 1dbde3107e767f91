//! Hand-written stubs for scenario tests: a scriptable backing store whose
//! stream handles stay with the test, and a scriptable leadership tracker.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::timeout;

use crate::ChangeStream;
use crate::LeadershipTracker;
use crate::Life;
use crate::RelationInfo;
use crate::RelationKey;
use crate::RelationUnitsDelta;
use crate::RemoteStateWatcher;
use crate::ResolvedMode;
use crate::ServiceInfo;
use crate::ServiceTag;
use crate::StorageAttachmentId;
use crate::StorageSnapshot;
use crate::StorageTag;
use crate::StoreError;
use crate::StoreResult;
use crate::StreamHandle;
use crate::Ticket;
use crate::TicketHandle;
use crate::UnitInfo;
use crate::UnitStateStore;
use crate::UnitTag;

pub(crate) const BUFFER: usize = 16;

/// Producer handles for the seven primary streams.
pub(crate) struct StubHandles {
    pub(crate) unit: StreamHandle<()>,
    pub(crate) service: StreamHandle<()>,
    pub(crate) config: StreamHandle<()>,
    pub(crate) addresses: StreamHandle<()>,
    pub(crate) leader_settings: StreamHandle<()>,
    pub(crate) relations: StreamHandle<Vec<RelationKey>>,
    pub(crate) storage: StreamHandle<Vec<StorageTag>>,
}

impl StubHandles {
    /// Delivers the initial event of every primary stream except leadership
    /// (which the tracker settles separately).
    pub(crate) async fn deliver_initial_events(&self) {
        assert!(self.unit.send(()).await);
        assert!(self.service.send(()).await);
        assert!(self.config.send(()).await);
        assert!(self.addresses.send(()).await);
        assert!(self.leader_settings.send(()).await);
        assert!(self.relations.send(Vec::new()).await);
        assert!(self.storage.send(Vec::new()).await);
    }
}

#[derive(Default)]
struct Stashed {
    unit: Option<ChangeStream<()>>,
    service: Option<ChangeStream<()>>,
    config: Option<ChangeStream<()>>,
    addresses: Option<ChangeStream<()>>,
    leader_settings: Option<ChangeStream<()>>,
    relations: Option<ChangeStream<Vec<RelationKey>>>,
    storage: Option<ChangeStream<Vec<StorageTag>>>,
    relation_units: HashMap<RelationKey, ChangeStream<RelationUnitsDelta>>,
    attachments: HashMap<StorageTag, ChangeStream<()>>,
}

/// Scriptable backing store. Entity tables are plain maps the test mutates;
/// streams are pre-created so their producer handles stay with the test.
pub(crate) struct StubStore {
    pub(crate) units: Mutex<HashMap<UnitTag, StoreResult<UnitInfo>>>,
    pub(crate) services: Mutex<HashMap<ServiceTag, StoreResult<ServiceInfo>>>,
    pub(crate) relations: Mutex<HashMap<RelationKey, StoreResult<RelationInfo>>>,
    pub(crate) attachments: Mutex<HashMap<StorageTag, StoreResult<StorageSnapshot>>>,
    pub(crate) attachment_life: Mutex<HashMap<StorageTag, StoreResult<Life>>>,
    streams: Mutex<Stashed>,
}

impl StubStore {
    /// A store that knows `unit` (alive, unresolved) and its service, with
    /// all seven primary streams pre-created.
    pub(crate) fn new(unit: &UnitTag) -> (Arc<StubStore>, StubHandles) {
        let (unit_h, unit_s) = ChangeStream::channel(BUFFER);
        let (service_h, service_s) = ChangeStream::channel(BUFFER);
        let (config_h, config_s) = ChangeStream::channel(BUFFER);
        let (addresses_h, addresses_s) = ChangeStream::channel(BUFFER);
        let (leader_settings_h, leader_settings_s) = ChangeStream::channel(BUFFER);
        let (relations_h, relations_s) = ChangeStream::channel(BUFFER);
        let (storage_h, storage_s) = ChangeStream::channel(BUFFER);

        let mut units = HashMap::new();
        units.insert(
            unit.clone(),
            Ok(UnitInfo {
                life: Life::Alive,
                resolved_mode: ResolvedMode::None,
            }),
        );
        let mut services = HashMap::new();
        services.insert(
            unit.service(),
            Ok(ServiceInfo {
                charm_url: Some("local:quantal/app-1".to_string()),
                force_charm_upgrade: false,
            }),
        );

        let store = Arc::new(StubStore {
            units: Mutex::new(units),
            services: Mutex::new(services),
            relations: Mutex::new(HashMap::new()),
            attachments: Mutex::new(HashMap::new()),
            attachment_life: Mutex::new(HashMap::new()),
            streams: Mutex::new(Stashed {
                unit: Some(unit_s),
                service: Some(service_s),
                config: Some(config_s),
                addresses: Some(addresses_s),
                leader_settings: Some(leader_settings_s),
                relations: Some(relations_s),
                storage: Some(storage_s),
                relation_units: HashMap::new(),
                attachments: HashMap::new(),
            }),
        });
        let handles = StubHandles {
            unit: unit_h,
            service: service_h,
            config: config_h,
            addresses: addresses_h,
            leader_settings: leader_settings_h,
            relations: relations_h,
            storage: storage_h,
        };
        (store, handles)
    }

    /// Pre-creates the member stream for `key`; the watcher picks it up when
    /// it subscribes.
    pub(crate) fn stash_relation_units(&self, key: &RelationKey) -> StreamHandle<RelationUnitsDelta> {
        let (handle, stream) = ChangeStream::channel(BUFFER);
        self.streams.lock().relation_units.insert(key.clone(), stream);
        handle
    }

    /// Pre-creates the attachment stream for `tag`.
    pub(crate) fn stash_attachment(&self, tag: &StorageTag) -> StreamHandle<()> {
        let (handle, stream) = ChangeStream::channel(BUFFER);
        self.streams.lock().attachments.insert(tag.clone(), stream);
        handle
    }
}

fn unscripted<T>(what: &str) -> StoreResult<T> {
    Err(StoreError::RequestFailed(format!("no {what} scripted")))
}

#[async_trait]
impl UnitStateStore for StubStore {
    async fn unit(&self, unit: &UnitTag) -> StoreResult<UnitInfo> {
        self.units
            .lock()
            .get(unit)
            .cloned()
            .unwrap_or_else(|| Err(StoreError::not_found(format!("unit {unit}"))))
    }

    async fn service(&self, service: &ServiceTag) -> StoreResult<ServiceInfo> {
        self.services
            .lock()
            .get(service)
            .cloned()
            .unwrap_or_else(|| Err(StoreError::not_found(format!("service {service}"))))
    }

    async fn relation(&self, key: &RelationKey) -> StoreResult<RelationInfo> {
        self.relations
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_else(|| Err(StoreError::not_found(format!("relation {key}"))))
    }

    async fn storage_attachment(&self, id: &StorageAttachmentId) -> StoreResult<StorageSnapshot> {
        self.attachments
            .lock()
            .get(&id.storage)
            .cloned()
            .unwrap_or_else(|| Err(StoreError::not_found(format!("storage {}", id.storage))))
    }

    async fn storage_attachment_life(
        &self,
        ids: &[StorageAttachmentId],
    ) -> StoreResult<Vec<StoreResult<Life>>> {
        let life = self.attachment_life.lock();
        Ok(ids
            .iter()
            .map(|id| {
                life.get(&id.storage)
                    .cloned()
                    .unwrap_or_else(|| Err(StoreError::not_found(format!("storage {}", id.storage))))
            })
            .collect())
    }

    async fn watch_unit(&self, _unit: &UnitTag) -> StoreResult<ChangeStream<()>> {
        self.streams
            .lock()
            .unit
            .take()
            .map_or_else(|| unscripted("unit stream"), Ok)
    }

    async fn watch_service(&self, _service: &ServiceTag) -> StoreResult<ChangeStream<()>> {
        self.streams
            .lock()
            .service
            .take()
            .map_or_else(|| unscripted("service stream"), Ok)
    }

    async fn watch_config_settings(&self, _unit: &UnitTag) -> StoreResult<ChangeStream<()>> {
        self.streams
            .lock()
            .config
            .take()
            .map_or_else(|| unscripted("config stream"), Ok)
    }

    async fn watch_unit_addresses(&self, _unit: &UnitTag) -> StoreResult<ChangeStream<()>> {
        self.streams
            .lock()
            .addresses
            .take()
            .map_or_else(|| unscripted("addresses stream"), Ok)
    }

    async fn watch_service_relations(
        &self,
        _service: &ServiceTag,
    ) -> StoreResult<ChangeStream<Vec<RelationKey>>> {
        self.streams
            .lock()
            .relations
            .take()
            .map_or_else(|| unscripted("relations stream"), Ok)
    }

    async fn watch_unit_storage(
        &self,
        _unit: &UnitTag,
    ) -> StoreResult<ChangeStream<Vec<StorageTag>>> {
        self.streams
            .lock()
            .storage
            .take()
            .map_or_else(|| unscripted("storage stream"), Ok)
    }

    async fn watch_leadership_settings(
        &self,
        _service: &ServiceTag,
    ) -> StoreResult<ChangeStream<()>> {
        self.streams
            .lock()
            .leader_settings
            .take()
            .map_or_else(|| unscripted("leader settings stream"), Ok)
    }

    async fn watch_relation_units(
        &self,
        key: &RelationKey,
        _unit: &UnitTag,
    ) -> StoreResult<ChangeStream<RelationUnitsDelta>> {
        self.streams
            .lock()
            .relation_units
            .remove(key)
            .map_or_else(|| unscripted("relation units stream"), Ok)
    }

    async fn watch_storage_attachment(
        &self,
        id: &StorageAttachmentId,
    ) -> StoreResult<ChangeStream<()>> {
        self.streams
            .lock()
            .attachments
            .remove(&id.storage)
            .map_or_else(|| unscripted("storage attachment stream"), Ok)
    }
}

/// Scriptable leadership tracker. Tickets the test queued are handed out in
/// order; anything unqueued stays pending forever (handles are parked so the
/// watcher never sees a dropped tracker).
pub(crate) struct StubTracker {
    claim: Mutex<Option<Ticket>>,
    wait_leader: Mutex<VecDeque<Ticket>>,
    wait_minion: Mutex<VecDeque<Ticket>>,
    parked: Mutex<Vec<TicketHandle>>,
    pub(crate) wait_leader_calls: AtomicUsize,
    pub(crate) wait_minion_calls: AtomicUsize,
}

impl StubTracker {
    /// A tracker whose initial claim settles immediately with `is_leader`.
    pub(crate) fn claiming(is_leader: bool) -> Arc<StubTracker> {
        Arc::new(StubTracker {
            claim: Mutex::new(Some(Ticket::settled(is_leader))),
            wait_leader: Mutex::new(VecDeque::new()),
            wait_minion: Mutex::new(VecDeque::new()),
            parked: Mutex::new(Vec::new()),
            wait_leader_calls: AtomicUsize::new(0),
            wait_minion_calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn queue_wait_leader(&self) -> TicketHandle {
        let (handle, ticket) = Ticket::pending();
        self.wait_leader.lock().push_back(ticket);
        handle
    }

    pub(crate) fn queue_wait_minion(&self) -> TicketHandle {
        let (handle, ticket) = Ticket::pending();
        self.wait_minion.lock().push_back(ticket);
        handle
    }

    fn pending_forever(&self) -> Ticket {
        let (handle, ticket) = Ticket::pending();
        self.parked.lock().push(handle);
        ticket
    }
}

impl LeadershipTracker for StubTracker {
    fn claim_leader(&self) -> Ticket {
        self.claim
            .lock()
            .take()
            .unwrap_or_else(|| self.pending_forever())
    }

    fn wait_leader(&self) -> Ticket {
        self.wait_leader_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_leader
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.pending_forever())
    }

    fn wait_minion(&self) -> Ticket {
        self.wait_minion_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_minion
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.pending_forever())
    }
}

/// Lets in-flight handlers drain before the test asserts.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub(crate) async fn expect_signal(watcher: &mut RemoteStateWatcher) {
    timeout(Duration::from_millis(500), watcher.changes().recv())
        .await
        .expect("timed out waiting for change signal")
        .expect("signal channel closed");
}

pub(crate) async fn expect_no_signal(watcher: &mut RemoteStateWatcher) {
    settle().await;
    assert!(
        watcher.changes().try_recv().is_err(),
        "unexpected change signal"
    );
}
