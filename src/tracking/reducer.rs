use std::collections::HashMap;

use log::{error, info, warn};

use crate::db::{Database, TrackItemStore};
use crate::errors::EngineError;
use crate::models::{ActivityKind, Sample, TrackItem};

const MAX_BACKOFF_STEP: u32 = 6;

/// The one item per kind currently being extended. `id` stays `None`
/// while the initial insert is buffered against a failing backend.
#[derive(Debug, Clone)]
struct OpenSlot {
    id: Option<i64>,
    identity: String,
    color: Option<String>,
    begin_date: i64,
    end_date: i64,
    dirty: bool,
    ticks_since_flush: u32,
    backoff_ticks: u32,
    backoff_step: u32,
}

impl OpenSlot {
    fn new(identity: String, at_ms: i64) -> Self {
        Self {
            id: None,
            identity,
            color: None,
            begin_date: at_ms,
            end_date: at_ms,
            dirty: true,
            ticks_since_flush: 0,
            backoff_ticks: 0,
            backoff_step: 0,
        }
    }

    fn to_item(&self, kind: ActivityKind) -> TrackItem {
        TrackItem {
            id: self.id,
            kind,
            identity: self.identity.clone(),
            begin_date: self.begin_date,
            end_date: self.end_date,
            color: self.color.clone(),
        }
    }
}

/// A write that could not reach the store yet; replayed on later ticks so
/// a closing interval survives a temporarily unavailable backend.
#[derive(Debug, Clone)]
struct PendingWrite {
    id: Option<i64>,
    item: TrackItem,
}

enum Transition {
    Extended,
    Switched(String),
    Opened(String),
    Ignored,
}

/// Folds the sample stream into track items: extends the open item while
/// the identity matches, closes and reopens on change. Never edits a
/// closed item retroactively; corrections go through the store's explicit
/// update/delete calls.
pub struct IntervalReducer<S: TrackItemStore = Database> {
    db: S,
    flush_every_ticks: u32,
    open: HashMap<ActivityKind, OpenSlot>,
    pending: Vec<PendingWrite>,
    pending_backoff_ticks: u32,
    pending_backoff_step: u32,
}

impl<S: TrackItemStore> IntervalReducer<S> {
    pub fn new(db: S, flush_every_ticks: u32) -> Self {
        Self {
            db,
            flush_every_ticks: flush_every_ticks.max(1),
            open: HashMap::new(),
            pending: Vec::new(),
            pending_backoff_ticks: 0,
            pending_backoff_step: 0,
        }
    }

    pub fn open_item(&self, kind: ActivityKind) -> Option<TrackItem> {
        self.open.get(&kind).map(|slot| slot.to_item(kind))
    }

    pub fn open_end(&self, kind: ActivityKind) -> Option<i64> {
        self.open.get(&kind).map(|slot| slot.end_date)
    }

    pub fn has_open_items(&self) -> bool {
        !self.open.is_empty()
    }

    pub async fn ingest(&mut self, sample: &Sample) -> Result<(), EngineError> {
        self.drain_pending().await;

        let Some(identity) = sample.identity.as_deref() else {
            // Nothing trackable observed; whatever was open ends here.
            return self.close_kind(sample.kind, sample.timestamp_ms).await;
        };

        let transition = match self.open.get_mut(&sample.kind) {
            Some(slot) if slot.identity == identity => {
                if sample.timestamp_ms < slot.end_date {
                    warn!(
                        "out-of-order {} sample at {} behind open end {}; ignored",
                        sample.kind, sample.timestamp_ms, slot.end_date
                    );
                    Transition::Ignored
                } else {
                    // Equal timestamps extend too: the later arrival wins.
                    slot.end_date = sample.timestamp_ms;
                    slot.dirty = true;
                    slot.ticks_since_flush += 1;
                    Transition::Extended
                }
            }
            Some(_) => Transition::Switched(identity.to_string()),
            None => Transition::Opened(identity.to_string()),
        };

        match transition {
            Transition::Extended => self.maybe_flush(sample.kind).await,
            Transition::Switched(identity) => {
                // The outgoing item closes at the switching sample's
                // timestamp and the new one opens there: contiguous,
                // touching, never overlapping.
                self.close_kind(sample.kind, sample.timestamp_ms).await?;
                self.open_new(sample.kind, identity, sample.timestamp_ms)
                    .await
            }
            Transition::Opened(identity) => {
                self.open_new(sample.kind, identity, sample.timestamp_ms)
                    .await
            }
            Transition::Ignored => Ok(()),
        }
    }

    /// Close the open item of `kind` at `at_ms` and forget it. The final
    /// write is buffered for replay if the backend is unavailable.
    pub async fn close_kind(&mut self, kind: ActivityKind, at_ms: i64) -> Result<(), EngineError> {
        let Some(mut slot) = self.open.remove(&kind) else {
            return Ok(());
        };

        if at_ms > slot.end_date {
            slot.end_date = at_ms;
        }

        let item = slot.to_item(kind);
        let result = match slot.id {
            None => self.db.insert_item(&item).await.map(|_| ()),
            Some(id) => self.db.update_item(id, &item).await,
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() => {
                warn!("buffering close of {kind} item, store unavailable: {err}");
                self.pending.push(PendingWrite { id: slot.id, item });
                self.bump_pending_backoff();
                Ok(())
            }
            Err(err) => {
                error!("dropping close of {kind} item [{}, {}]: {err}", item.begin_date, item.end_date);
                Err(err)
            }
        }
    }

    /// Close every open item at `at_ms` (suspend, sampler stop).
    pub async fn close_all(&mut self, at_ms: i64) -> Result<(), EngineError> {
        let kinds: Vec<ActivityKind> = self.open.keys().copied().collect();
        for kind in kinds {
            self.close_kind(kind, at_ms).await?;
        }
        Ok(())
    }

    /// Close every open item at its own last-seen endDate; used when a
    /// timestamp jump reveals that sampling silently stopped a while ago.
    pub async fn close_all_in_place(&mut self) -> Result<(), EngineError> {
        let ends: Vec<(ActivityKind, i64)> = self
            .open
            .iter()
            .map(|(kind, slot)| (*kind, slot.end_date))
            .collect();
        for (kind, end) in ends {
            self.close_kind(kind, end).await?;
        }
        Ok(())
    }

    async fn open_new(
        &mut self,
        kind: ActivityKind,
        identity: String,
        at_ms: i64,
    ) -> Result<(), EngineError> {
        let mut slot = OpenSlot::new(identity, at_ms);

        match self.db.insert_item(&slot.to_item(kind)).await {
            Ok(id) => {
                slot.id = Some(id);
                slot.dirty = false;
            }
            Err(err) if err.is_retryable() => {
                warn!("buffering new open {kind} item, insert failed: {err}");
                slot.backoff_step = 1;
                slot.backoff_ticks = 2;
            }
            Err(err) => return Err(err),
        }

        self.open.insert(kind, slot);
        Ok(())
    }

    async fn maybe_flush(&mut self, kind: ActivityKind) -> Result<(), EngineError> {
        let due = match self.open.get_mut(&kind) {
            Some(slot) => {
                if slot.backoff_ticks > 0 {
                    slot.backoff_ticks -= 1;
                    false
                } else {
                    slot.dirty
                        && (slot.id.is_none() || slot.ticks_since_flush >= self.flush_every_ticks)
                }
            }
            None => false,
        };

        if due {
            self.flush_kind(kind).await?;
        }
        Ok(())
    }

    async fn flush_kind(&mut self, kind: ActivityKind) -> Result<(), EngineError> {
        let Some(slot) = self.open.get(&kind) else {
            return Ok(());
        };

        let item = slot.to_item(kind);
        let result = match slot.id {
            None => self.db.insert_item(&item).await.map(Some),
            Some(id) => self.db.update_item(id, &item).await.map(|_| None),
        };

        let Some(slot) = self.open.get_mut(&kind) else {
            return Ok(());
        };

        match result {
            Ok(assigned) => {
                if let Some(id) = assigned {
                    info!("recovered buffered open {kind} item as id {id}");
                    slot.id = Some(id);
                }
                slot.dirty = false;
                slot.ticks_since_flush = 0;
                slot.backoff_step = 0;
                Ok(())
            }
            Err(EngineError::NotFound(id)) => {
                // A caller deleted the row under us; drop the stale id and
                // let the next flush re-insert what is still open.
                error!("open {kind} item {id} vanished from store; will re-insert");
                slot.id = None;
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                slot.backoff_step = (slot.backoff_step + 1).min(MAX_BACKOFF_STEP);
                slot.backoff_ticks = 1 << slot.backoff_step;
                warn!(
                    "flush of open {kind} item failed, retrying in {} ticks: {err}",
                    slot.backoff_ticks
                );
                Ok(())
            }
            Err(err) => {
                error!("rejecting open {kind} item after failed flush: {err}");
                self.open.remove(&kind);
                Err(err)
            }
        }
    }

    async fn drain_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if self.pending_backoff_ticks > 0 {
            self.pending_backoff_ticks -= 1;
            return;
        }

        let writes = std::mem::take(&mut self.pending);
        for write in writes {
            let result = match write.id {
                None => self.db.insert_item(&write.item).await.map(|_| ()),
                Some(id) => self.db.update_item(id, &write.item).await,
            };

            match result {
                Ok(()) => {}
                Err(err) if err.is_retryable() => self.pending.push(write),
                Err(err) => error!(
                    "dropping buffered {} write [{}, {}]: {err}",
                    write.item.kind, write.item.begin_date, write.item.end_date
                ),
            }
        }

        if self.pending.is_empty() {
            self.pending_backoff_step = 0;
        } else {
            self.bump_pending_backoff();
        }
    }

    fn bump_pending_backoff(&mut self) {
        self.pending_backoff_step = (self.pending_backoff_step + 1).min(MAX_BACKOFF_STEP);
        self.pending_backoff_ticks = 1 << self.pending_backoff_step;
        warn!(
            "replaying buffered writes in {} ticks",
            self.pending_backoff_ticks
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn app(ts: i64, identity: &str) -> Sample {
        Sample::app(ts, identity)
    }

    /// Store double that fails writes on demand, counting attempts.
    #[derive(Clone)]
    struct FlakyStore {
        db: Database,
        failing: Arc<AtomicBool>,
        insert_attempts: Arc<AtomicU32>,
        update_attempts: Arc<AtomicU32>,
    }

    impl FlakyStore {
        fn new(db: Database) -> Self {
            Self {
                db,
                failing: Arc::new(AtomicBool::new(false)),
                insert_attempts: Arc::new(AtomicU32::new(0)),
                update_attempts: Arc::new(AtomicU32::new(0)),
            }
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn inserts(&self) -> u32 {
            self.insert_attempts.load(Ordering::SeqCst)
        }

        fn updates(&self) -> u32 {
            self.update_attempts.load(Ordering::SeqCst)
        }
    }

    impl TrackItemStore for FlakyStore {
        fn insert_item(
            &self,
            item: &TrackItem,
        ) -> impl std::future::Future<Output = Result<i64, EngineError>> + Send {
            async move {
                self.insert_attempts.fetch_add(1, Ordering::SeqCst);
                if self.failing.load(Ordering::SeqCst) {
                    return Err(EngineError::Backend("injected outage".into()));
                }
                self.db.insert_item(item).await
            }
        }

        fn update_item(
            &self,
            id: i64,
            item: &TrackItem,
        ) -> impl std::future::Future<Output = Result<(), EngineError>> + Send {
            async move {
                self.update_attempts.fetch_add(1, Ordering::SeqCst);
                if self.failing.load(Ordering::SeqCst) {
                    return Err(EngineError::Backend("injected outage".into()));
                }
                self.db.update_item(id, item).await
            }
        }
    }

    async fn items(db: &Database) -> Vec<TrackItem> {
        db.find_in_range(ActivityKind::App, 0, i64::MAX).await.unwrap()
    }

    #[tokio::test]
    async fn same_identity_stream_yields_one_extending_item() {
        let db = Database::in_memory().unwrap();
        let mut reducer = IntervalReducer::new(db.clone(), 1);

        for ts in [1_000, 4_000, 7_000, 10_000] {
            reducer.ingest(&app(ts, "editor")).await.unwrap();
        }

        let open = reducer.open_item(ActivityKind::App).unwrap();
        assert_eq!(open.begin_date, 1_000);
        assert_eq!(open.end_date, 10_000);

        let persisted = items(&db).await;
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].end_date, 10_000);
    }

    #[tokio::test]
    async fn identity_change_closes_at_switch_and_reopens_there() {
        let db = Database::in_memory().unwrap();
        let mut reducer = IntervalReducer::new(db.clone(), 1);

        reducer.ingest(&app(1_000, "editor")).await.unwrap();
        reducer.ingest(&app(4_000, "editor")).await.unwrap();
        reducer.ingest(&app(7_000, "browser")).await.unwrap();

        let persisted = items(&db).await;
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].identity, "editor");
        assert_eq!(persisted[0].end_date, 7_000);
        assert_eq!(persisted[1].identity, "browser");
        assert_eq!(persisted[1].begin_date, 7_000);

        // No gap and no overlap at the boundary.
        assert_eq!(persisted[0].end_date, persisted[1].begin_date);
    }

    #[tokio::test]
    async fn extensions_are_coalesced_until_the_flush_tick() {
        let db = Database::in_memory().unwrap();
        let mut reducer = IntervalReducer::new(db.clone(), 3);

        reducer.ingest(&app(1_000, "editor")).await.unwrap();
        reducer.ingest(&app(2_000, "editor")).await.unwrap();
        reducer.ingest(&app(3_000, "editor")).await.unwrap();

        // Two extends since the insert: below the cadence, still stale.
        assert_eq!(items(&db).await[0].end_date, 1_000);

        reducer.ingest(&app(4_000, "editor")).await.unwrap();
        assert_eq!(items(&db).await[0].end_date, 4_000);
    }

    #[tokio::test]
    async fn close_always_flushes_the_final_end_date() {
        let db = Database::in_memory().unwrap();
        let mut reducer = IntervalReducer::new(db.clone(), 100);

        reducer.ingest(&app(1_000, "editor")).await.unwrap();
        reducer.ingest(&app(2_000, "editor")).await.unwrap();
        reducer.close_all(5_000).await.unwrap();

        assert!(reducer.open_item(ActivityKind::App).is_none());
        assert!(!reducer.has_open_items());

        let persisted = items(&db).await;
        assert_eq!(persisted[0].end_date, 5_000);
    }

    #[tokio::test]
    async fn empty_identity_sample_closes_the_open_item() {
        let db = Database::in_memory().unwrap();
        let mut reducer = IntervalReducer::new(db.clone(), 1);

        reducer.ingest(&app(1_000, "editor")).await.unwrap();
        reducer
            .ingest(&Sample {
                timestamp_ms: 4_000,
                kind: ActivityKind::App,
                identity: None,
            })
            .await
            .unwrap();

        assert!(reducer.open_item(ActivityKind::App).is_none());
        assert_eq!(items(&db).await[0].end_date, 4_000);
    }

    #[tokio::test]
    async fn out_of_order_sample_is_ignored() {
        let db = Database::in_memory().unwrap();
        let mut reducer = IntervalReducer::new(db.clone(), 1);

        reducer.ingest(&app(5_000, "editor")).await.unwrap();
        reducer.ingest(&app(3_000, "editor")).await.unwrap();

        assert_eq!(reducer.open_end(ActivityKind::App), Some(5_000));
    }

    #[tokio::test]
    async fn equal_timestamp_extend_keeps_one_item() {
        let db = Database::in_memory().unwrap();
        let mut reducer = IntervalReducer::new(db.clone(), 1);

        reducer.ingest(&app(5_000, "editor")).await.unwrap();
        reducer.ingest(&app(5_000, "editor")).await.unwrap();

        assert_eq!(items(&db).await.len(), 1);
        assert_eq!(reducer.open_end(ActivityKind::App), Some(5_000));
    }

    #[tokio::test]
    async fn kinds_are_reduced_independently() {
        let db = Database::in_memory().unwrap();
        let mut reducer = IntervalReducer::new(db.clone(), 1);

        reducer.ingest(&app(1_000, "editor")).await.unwrap();
        reducer
            .ingest(&Sample::status(1_000, crate::models::Status::Online))
            .await
            .unwrap();

        assert!(reducer.open_item(ActivityKind::App).is_some());
        assert!(reducer.open_item(ActivityKind::Status).is_some());

        reducer.close_kind(ActivityKind::App, 2_000).await.unwrap();
        assert!(reducer.open_item(ActivityKind::App).is_none());
        assert!(reducer.open_item(ActivityKind::Status).is_some());
    }

    #[tokio::test]
    async fn close_all_in_place_uses_each_items_own_end() {
        let db = Database::in_memory().unwrap();
        let mut reducer = IntervalReducer::new(db.clone(), 1);

        reducer.ingest(&app(1_000, "editor")).await.unwrap();
        reducer.ingest(&app(4_000, "editor")).await.unwrap();
        reducer.close_all_in_place().await.unwrap();

        assert_eq!(items(&db).await[0].end_date, 4_000);
    }

    #[tokio::test]
    async fn buffered_open_item_survives_a_backend_outage() {
        let db = Database::in_memory().unwrap();
        let store = FlakyStore::new(db.clone());
        let mut reducer = IntervalReducer::new(store.clone(), 1);

        store.set_failing(true);
        reducer.ingest(&app(1_000, "editor")).await.unwrap();

        // The interval survives in memory, unpersisted and without an id.
        let open = reducer.open_item(ActivityKind::App).unwrap();
        assert_eq!(open.id, None);
        assert_eq!(open.begin_date, 1_000);
        assert!(items(&db).await.is_empty());

        // Two backoff ticks, then one failed re-insert at 4s.
        for ts in [2_000, 3_000, 4_000] {
            reducer.ingest(&app(ts, "editor")).await.unwrap();
        }
        assert_eq!(store.inserts(), 2);

        store.set_failing(false);
        for ts in [5_000, 6_000, 7_000, 8_000, 9_000] {
            reducer.ingest(&app(ts, "editor")).await.unwrap();
        }

        let persisted = items(&db).await;
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].begin_date, 1_000);
        assert_eq!(persisted[0].end_date, 9_000);
        assert_eq!(store.inserts(), 3);
        assert!(reducer.open_item(ActivityKind::App).unwrap().id.is_some());
    }

    #[tokio::test]
    async fn buffered_close_is_replayed_with_backoff() {
        let db = Database::in_memory().unwrap();
        let store = FlakyStore::new(db.clone());
        let mut reducer = IntervalReducer::new(store.clone(), 1);

        reducer.ingest(&app(1_000, "editor")).await.unwrap();
        store.set_failing(true);
        reducer.ingest(&app(2_000, "browser")).await.unwrap();
        store.set_failing(false);

        // The closing write sits buffered through two backoff ticks
        // instead of being replayed on every ingest.
        reducer.ingest(&app(3_000, "browser")).await.unwrap();
        reducer.ingest(&app(4_000, "browser")).await.unwrap();
        assert_eq!(store.updates(), 1);

        reducer.ingest(&app(5_000, "browser")).await.unwrap();

        let persisted = items(&db).await;
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].identity, "editor");
        assert_eq!(persisted[0].end_date, 2_000);
        assert_eq!(persisted[1].identity, "browser");
        assert_eq!(persisted[1].begin_date, 2_000);
        assert_eq!(persisted[1].end_date, 5_000);
        assert_eq!(store.updates(), 2);
    }
}
