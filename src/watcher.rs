//! The remote state watcher.
//!
//! Collects unit, service, and service config information from separate
//! backing-store change streams into a single [`Snapshot`], and signals one
//! downstream consumer whenever something changed. Signals are coalesced:
//! the consumer is obliged to read the latest snapshot after each one, and
//! may see several changes folded into a single signal.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::Error;
use crate::LeadershipTracker;
use crate::RelationInfo;
use crate::RelationKey;
use crate::RelationSnapshot;
use crate::RelationUnitsEvent;
use crate::RelationUnitsWatcher;
use crate::ResolvedMode;
use crate::Result;
use crate::ServiceTag;
use crate::Snapshot;
use crate::StorageAttachmentEvent;
use crate::StorageAttachmentId;
use crate::StorageAttachmentWatcher;
use crate::StorageSnapshot;
use crate::StorageTag;
use crate::StoreError;
use crate::Supervisor;
use crate::Ticket;
use crate::UnitStateStore;
use crate::UnitTag;
use crate::WatchError;
use crate::WatcherConfig;

/// Handle to a running remote state watcher.
///
/// Cheap to move, single-owner: the signal channel has exactly one reader.
pub struct RemoteStateWatcher {
    shared: Arc<SharedState>,
    supervisor: Supervisor,
    out_rx: mpsc::Receiver<()>,
}

struct SharedState {
    current: Mutex<Snapshot>,
}

impl RemoteStateWatcher {
    /// Spawns the aggregator loop for `unit_tag` and returns its handle.
    ///
    /// An initial unit or service lookup that is not-found or unauthorized
    /// is reported through [`wait`](Self::wait) as [`Error::TerminateAgent`].
    pub fn start<S, L>(
        store: Arc<S>,
        tracker: Arc<L>,
        unit_tag: UnitTag,
        config: WatcherConfig,
    ) -> Self
    where
        S: UnitStateStore,
        L: LeadershipTracker,
    {
        let shared = Arc::new(SharedState {
            current: Mutex::new(Snapshot::default()),
        });
        let supervisor = Supervisor::new();
        let (out_tx, out_rx) = mpsc::channel(1);
        let (relation_units_tx, relation_units_rx) = mpsc::channel(config.aggregate_buffer);
        let (storage_events_tx, storage_events_rx) = mpsc::channel(config.aggregate_buffer);

        let service_tag = unit_tag.service();
        let watcher_loop = WatcherLoop {
            store,
            tracker,
            unit_tag,
            service_tag,
            shared: shared.clone(),
            supervisor: supervisor.clone(),
            out_tx,
            relations: HashMap::new(),
            relation_units_tx,
            storage_watchers: HashMap::new(),
            storage_events_tx,
        };

        let loop_supervisor = supervisor.clone();
        tokio::spawn(async move {
            let result = watcher_loop.run(relation_units_rx, storage_events_rx).await;
            match &result {
                Err(err) if *err != Error::Dying => {
                    error!(%err, "remote state watcher exited")
                }
                _ => debug!("remote state watcher stopped"),
            }
            loop_supervisor.mark_dead(result.err());
        });

        RemoteStateWatcher {
            shared,
            supervisor,
            out_rx,
        }
    }

    /// A deep copy of the current consolidated view; safe concurrent.
    pub fn snapshot(&self) -> Snapshot {
        self.shared.current.lock().clone()
    }

    /// Coalesced change signal. The first signal arrives only once every
    /// primary source has produced its initial event.
    pub fn changes(&mut self) -> &mut mpsc::Receiver<()> {
        &mut self.out_rx
    }

    /// Clears the resolved marker in place. Emits no signal.
    pub fn clear_resolved_mode(&self) {
        self.shared.current.lock().resolved_mode = ResolvedMode::None;
    }

    /// Requests shutdown without waiting for it.
    pub fn kill(&self) {
        self.supervisor.kill(None);
    }

    /// Blocks until the loop has unwound and reports how it ended.
    pub async fn wait(&self) -> Result<()> {
        self.supervisor.wait().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.kill();
        self.wait().await
    }

    /// Observed once the loop has returned and all sub-watchers stopped.
    pub fn dead(&self) -> watch::Receiver<bool> {
        self.supervisor.dead()
    }
}

/// Gates the external signal until every primary source has reported once.
#[derive(Default)]
struct InitialGate {
    required: usize,
    observed: usize,
}

impl InitialGate {
    fn require(&mut self) {
        self.required += 1;
    }

    fn observe(&mut self, seen: &mut bool) {
        if !*seen {
            *seen = true;
            self.observed += 1;
        }
    }

    fn is_open(&self) -> bool {
        self.observed == self.required
    }
}

/// Which leadership transition we are currently waiting on.
enum Armed {
    Leader(Ticket),
    Minion(Ticket),
}

impl Armed {
    async fn fired(&mut self) -> std::result::Result<bool, WatchError> {
        match self {
            Armed::Leader(ticket) => ticket.outcome().await.map(|_| true),
            Armed::Minion(ticket) => ticket.outcome().await.map(|_| false),
        }
    }
}

struct WatcherLoop<S, L>
where
    S: UnitStateStore,
    L: LeadershipTracker,
{
    store: Arc<S>,
    tracker: Arc<L>,
    unit_tag: UnitTag,
    service_tag: ServiceTag,
    shared: Arc<SharedState>,
    supervisor: Supervisor,
    out_tx: mpsc::Sender<()>,

    relations: HashMap<RelationKey, RelationUnitsWatcher>,
    relation_units_tx: mpsc::Sender<RelationUnitsEvent>,
    storage_watchers: HashMap<StorageTag, StorageAttachmentWatcher>,
    storage_events_tx: mpsc::Sender<StorageAttachmentEvent>,
}

impl<S, L> WatcherLoop<S, L>
where
    S: UnitStateStore,
    L: LeadershipTracker,
{
    async fn run(
        mut self,
        relation_units_rx: mpsc::Receiver<RelationUnitsEvent>,
        storage_events_rx: mpsc::Receiver<StorageAttachmentEvent>,
    ) -> Result<()> {
        let result = self.watch(relation_units_rx, storage_events_rx).await;
        self.stop_children().await;
        result
    }

    /// Existence check before any stream is subscribed. A unit or service
    /// that is already gone translates to the terminal sentinel.
    async fn init(&self) -> Result<()> {
        if let Err(err) = self.store.unit(&self.unit_tag).await {
            return Err(terminal_on_denied(err));
        }
        if let Err(err) = self.store.service(&self.service_tag).await {
            return Err(terminal_on_denied(err));
        }
        Ok(())
    }

    async fn watch(
        &mut self,
        mut relation_units_rx: mpsc::Receiver<RelationUnitsEvent>,
        mut storage_events_rx: mpsc::Receiver<StorageAttachmentEvent>,
    ) -> Result<()> {
        self.init().await?;

        let mut dying = self.supervisor.dying();
        let mut gate = InitialGate::default();

        let mut seen_unit = false;
        let mut unit_w = self.store.watch_unit(&self.unit_tag).await?;
        gate.require();

        let mut seen_service = false;
        let mut service_w = self.store.watch_service(&self.service_tag).await?;
        gate.require();

        let mut seen_config = false;
        let mut config_w = self.store.watch_config_settings(&self.unit_tag).await?;
        gate.require();

        let mut seen_relations = false;
        let mut relations_w = self.store.watch_service_relations(&self.service_tag).await?;
        gate.require();

        let mut seen_addresses = false;
        let mut addresses_w = self.store.watch_unit_addresses(&self.unit_tag).await?;
        gate.require();

        let mut seen_storage = false;
        let mut storage_w = self.store.watch_unit_storage(&self.unit_tag).await?;
        gate.require();

        let mut seen_leader_settings = false;
        let mut leader_settings_w = self.store.watch_leadership_settings(&self.service_tag).await?;
        gate.require();

        // No stream for leadership; the tracker settles one-shot tickets.
        let mut seen_leadership = false;
        gate.require();

        // Initial leadership status; afterwards we flip-flop between
        // wait-minion and wait-leader to learn about transitions.
        let mut claim = self.tracker.claim_leader();
        let outcome_fut = claim.outcome();
        tokio::pin!(outcome_fut);
        let mut armed = loop {
            if *dying.borrow() {
                return Err(Error::Dying);
            }
            tokio::select! {
                biased;

                r = dying.changed() => {
                    if r.is_err() {
                        return Err(Error::Dying);
                    }
                    continue;
                },

                outcome = &mut outcome_fut => {
                    let is_leader = outcome?;
                    debug!(is_leader, "leadership claim settled");
                    self.leadership_changed(is_leader);
                    gate.observe(&mut seen_leadership);
                    break if is_leader {
                        Armed::Minion(self.tracker.wait_minion())
                    } else {
                        Armed::Leader(self.tracker.wait_leader())
                    };
                }
            }
        };

        loop {
            if *dying.borrow() {
                return Err(Error::Dying);
            }
            tokio::select! {
                biased;

                r = dying.changed() => {
                    if r.is_err() {
                        return Err(Error::Dying);
                    }
                    continue;
                },

                change = unit_w.recv() => match change {
                    Some(()) => {
                        debug!("got unit change");
                        self.unit_changed().await?;
                        gate.observe(&mut seen_unit);
                    }
                    None => return Err(unit_w.error().into()),
                },

                change = service_w.recv() => match change {
                    Some(()) => {
                        debug!("got service change");
                        self.service_changed().await?;
                        gate.observe(&mut seen_service);
                    }
                    None => return Err(service_w.error().into()),
                },

                change = config_w.recv() => match change {
                    Some(()) => {
                        debug!("got config change");
                        self.config_changed();
                        gate.observe(&mut seen_config);
                    }
                    None => return Err(config_w.error().into()),
                },

                change = addresses_w.recv() => match change {
                    Some(()) => {
                        debug!("got address change");
                        self.config_changed();
                        gate.observe(&mut seen_addresses);
                    }
                    None => return Err(addresses_w.error().into()),
                },

                change = leader_settings_w.recv() => match change {
                    Some(()) => {
                        debug!("got leader settings change");
                        self.leader_settings_changed();
                        gate.observe(&mut seen_leader_settings);
                    }
                    None => return Err(leader_settings_w.error().into()),
                },

                change = relations_w.recv() => match change {
                    Some(keys) => {
                        debug!("got relations change");
                        self.relations_changed(keys).await?;
                        gate.observe(&mut seen_relations);
                    }
                    None => return Err(relations_w.error().into()),
                },

                change = storage_w.recv() => match change {
                    Some(keys) => {
                        debug!(?keys, "got storage change");
                        self.storage_changed(keys).await?;
                        gate.observe(&mut seen_storage);
                    }
                    None => return Err(storage_w.error().into()),
                },

                flipped = armed.fired() => {
                    let is_leader = flipped?;
                    debug!(is_leader, "got leadership change");
                    self.leadership_changed(is_leader);
                    armed = if is_leader {
                        Armed::Minion(self.tracker.wait_minion())
                    } else {
                        Armed::Leader(self.tracker.wait_leader())
                    };
                }

                Some(event) = storage_events_rx.recv() => {
                    debug!(?event, "got storage attachment event");
                    self.storage_attachment_changed(event);
                }

                Some(event) = relation_units_rx.recv() => {
                    debug!(relation_id = event.relation_id, "got relation units change");
                    self.relation_units_changed(event);
                }
            }

            // Something changed.
            self.fire(&gate);
        }
    }

    /// Non-blocking signal: a slow consumer coalesces any number of updates
    /// into the single pending token.
    fn fire(&self, gate: &InitialGate) {
        if !gate.is_open() {
            return;
        }
        let _ = self.out_tx.try_send(());
    }

    async fn unit_changed(&mut self) -> Result<()> {
        let unit = self.store.unit(&self.unit_tag).await?;
        let mut current = self.shared.current.lock();
        current.life = unit.life;
        current.resolved_mode = unit.resolved_mode;
        Ok(())
    }

    async fn service_changed(&mut self) -> Result<()> {
        let service = self.store.service(&self.service_tag).await?;
        let mut current = self.shared.current.lock();
        current.charm_url = service.charm_url;
        current.force_charm_upgrade = service.force_charm_upgrade;
        Ok(())
    }

    // Unit config and address changes invalidate the same derived
    // configuration downstream; both land here and bump one counter.
    fn config_changed(&mut self) {
        self.shared.current.lock().config_version += 1;
    }

    fn leader_settings_changed(&mut self) {
        self.shared.current.lock().leader_settings_version += 1;
    }

    fn leadership_changed(&mut self, is_leader: bool) {
        self.shared.current.lock().leader = is_leader;
    }

    async fn relations_changed(&mut self, keys: Vec<RelationKey>) -> Result<()> {
        for key in keys {
            match self.store.relation(&key).await {
                Err(err) if err.is_not_found_or_unauthorized() => {
                    // A relation that is gone cannot have been entered; this
                    // unit never needs to know about it. Bookkeeping is only
                    // dropped once its watcher has stopped cleanly.
                    if let Some(watcher) = self.relations.get_mut(&key) {
                        let relation_id = watcher.relation_id();
                        watcher.stop().await?;
                        self.relations.remove(&key);
                        self.shared.current.lock().relations.remove(&relation_id);
                    }
                }
                Err(err) => return Err(err.into()),
                Ok(info) => {
                    if self.relations.contains_key(&key) {
                        let mut current = self.shared.current.lock();
                        if let Some(snapshot) = current.relations.get_mut(&info.id) {
                            snapshot.life = info.life;
                        }
                        continue;
                    }
                    self.add_relation(key, info).await?;
                }
            }
        }
        Ok(())
    }

    /// Subscribes the relation's member stream and blocks on its initial
    /// event so the snapshot entry is seeded before it becomes visible.
    async fn add_relation(&mut self, key: RelationKey, info: RelationInfo) -> Result<()> {
        let mut stream = self.store.watch_relation_units(&key, &self.unit_tag).await?;
        let mut snapshot = RelationSnapshot {
            life: info.life,
            members: HashMap::new(),
        };

        let mut dying = self.supervisor.dying();
        loop {
            if *dying.borrow() {
                return Err(Error::Dying);
            }
            tokio::select! {
                biased;

                r = dying.changed() => {
                    if r.is_err() {
                        return Err(Error::Dying);
                    }
                    continue;
                },

                change = stream.recv() => {
                    match change {
                        Some(delta) => {
                            for (unit, version) in delta.changed {
                                snapshot.members.insert(unit, version);
                            }
                        }
                        None => return Err(stream.error().into()),
                    }
                    break;
                },
            }
        }

        self.shared.current.lock().relations.insert(info.id, snapshot);
        let watcher = RelationUnitsWatcher::spawn(
            info.id,
            stream,
            self.relation_units_tx.clone(),
            self.supervisor.dying(),
        );
        self.relations.insert(key, watcher);
        Ok(())
    }

    fn relation_units_changed(&mut self, event: RelationUnitsEvent) {
        let mut current = self.shared.current.lock();
        let Some(snapshot) = current.relations.get_mut(&event.relation_id) else {
            return;
        };
        for (unit, version) in event.delta.changed {
            snapshot.members.insert(unit, version);
        }
        for unit in event.delta.departed {
            snapshot.members.remove(&unit);
        }
    }

    async fn storage_changed(&mut self, keys: Vec<StorageTag>) -> Result<()> {
        let ids: Vec<StorageAttachmentId> = keys
            .into_iter()
            .map(|storage| StorageAttachmentId {
                storage,
                unit: self.unit_tag.clone(),
            })
            .collect();
        let results = self.store.storage_attachment_life(&ids).await?;

        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(life) => {
                    {
                        let mut current = self.shared.current.lock();
                        let entry = current
                            .storage
                            .entry(id.storage.clone())
                            .or_insert_with(|| StorageSnapshot::placeholder(id.storage.clone()));
                        entry.life = life;
                    }
                    self.start_storage_watcher(id).await?;
                }
                Err(err) if err.is_not_found() => {
                    self.shared.current.lock().storage.remove(&id.storage);
                    self.stop_storage_watcher(&id.storage).await?;
                }
                Err(err) => {
                    error!(storage = %id.storage, %err, "getting life of storage attachment");
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    fn storage_attachment_changed(&mut self, event: StorageAttachmentEvent) {
        let mut current = self.shared.current.lock();
        match event {
            StorageAttachmentEvent::Changed(snapshot) => {
                current.storage.insert(snapshot.tag.clone(), snapshot);
            }
            StorageAttachmentEvent::Removed(tag) => {
                current.storage.remove(&tag);
            }
        }
    }

    async fn start_storage_watcher(&mut self, id: StorageAttachmentId) -> Result<()> {
        if self.storage_watchers.contains_key(&id.storage) {
            return Ok(());
        }
        debug!(storage = %id.storage, "starting storage attachment watcher");
        let stream = self.store.watch_storage_attachment(&id).await?;
        let tag = id.storage.clone();
        let watcher = StorageAttachmentWatcher::spawn(
            self.store.clone(),
            id,
            stream,
            self.storage_events_tx.clone(),
            self.supervisor.dying(),
        );
        self.storage_watchers.insert(tag, watcher);
        Ok(())
    }

    async fn stop_storage_watcher(&mut self, tag: &StorageTag) -> Result<()> {
        if let Some(watcher) = self.storage_watchers.remove(tag) {
            debug!(storage = %tag, "stopping storage attachment watcher");
            watcher.stop().await?;
        }
        Ok(())
    }

    /// Deferred cleanup: every sub-watcher stops before the supervisor goes
    /// dead. Stop failures are recorded, first one wins.
    async fn stop_children(&mut self) {
        for (key, mut watcher) in self.relations.drain() {
            if let Err(err) = watcher.stop().await {
                warn!(relation = %key, %err, "stopping relation units watcher");
                self.supervisor.kill(Some(err));
            }
        }
        for (tag, watcher) in self.storage_watchers.drain() {
            if let Err(err) = watcher.stop().await {
                warn!(storage = %tag, %err, "stopping storage attachment watcher");
                self.supervisor.kill(Some(err));
            }
        }
    }
}

fn terminal_on_denied(err: StoreError) -> Error {
    if err.is_not_found_or_unauthorized() {
        Error::TerminateAgent
    } else {
        err.into()
    }
}
