use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::errors::EngineError;
use crate::models::{ActivityKind, QueryWindow, Sample, Segment, Status, TrackItem};
use crate::settings::{SettingsStore, TrackerSettings};
use crate::timeline;

use super::reducer::IntervalReducer;
use super::sampler::{sampling_loop, SampleSource};

struct EngineState {
    reducer: IntervalReducer,
    suspended_at: Option<i64>,
}

#[derive(Default)]
struct SamplerTask {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    source: Option<Arc<Mutex<Box<dyn SampleSource>>>>,
}

/// Facade over the interval engine: owns the reducer state, drives the
/// sampling task, serializes power notifications against it, and exposes
/// the query surface consumed by search/summary/export callers.
#[derive(Clone)]
pub struct TrackingController {
    db: Database,
    settings: TrackerSettings,
    state: Arc<Mutex<EngineState>>,
    sampler: Arc<Mutex<SamplerTask>>,
}

impl TrackingController {
    pub fn new(db: Database, settings: TrackerSettings) -> Self {
        let reducer = IntervalReducer::new(db.clone(), settings.flush_every_ticks);

        Self {
            db,
            settings,
            state: Arc::new(Mutex::new(EngineState {
                reducer,
                suspended_at: None,
            })),
            sampler: Arc::new(Mutex::new(SamplerTask::default())),
        }
    }

    /// Construct with the tracker section of the host's persisted
    /// settings file; the usual entry point for app shells.
    pub fn from_settings_store(db: Database, store: &SettingsStore) -> Self {
        Self::new(db, store.tracker())
    }

    /// Feed one sample through the reducer. Called by the sampling loop,
    /// and usable directly by hosts that deliver samples themselves.
    pub async fn ingest_sample(&self, sample: Sample) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;

        if state.suspended_at.is_some() {
            // A stale tick racing the suspend notification; samples are
            // not reduced while the machine is asleep.
            warn!(
                "dropping {} sample at {} while suspended",
                sample.kind, sample.timestamp_ms
            );
            return Ok(());
        }

        if let Some(open_end) = state.reducer.open_end(sample.kind) {
            let jump = sample.timestamp_ms - open_end;
            if jump > self.settings.gap_jump_threshold_ms {
                warn!(
                    "unexplained {jump}ms jump past open {} item; treating as missed sleep",
                    sample.kind
                );
                state.reducer.close_all_in_place().await?;
                self.insert_offline_gap(open_end, sample.timestamp_ms).await?;
            }
        }

        state.reducer.ingest(&sample).await
    }

    /// Install `source` and start the periodic sampling task.
    pub async fn spawn_sampler(
        &self,
        source: impl SampleSource,
    ) -> Result<(), EngineError> {
        let mut sampler = self.sampler.lock().await;
        if sampler.handle.is_some() {
            return Err(EngineError::SamplerActive);
        }

        let source: Arc<Mutex<Box<dyn SampleSource>>> = Arc::new(Mutex::new(Box::new(source)));
        sampler.source = Some(source.clone());
        self.start_task(&mut sampler, source);
        Ok(())
    }

    /// Stop sampling entirely and close all open items at `at_ms`.
    pub async fn stop_sampler(&self, at_ms: i64) -> Result<(), EngineError> {
        self.stop_task().await;
        self.sampler.lock().await.source = None;

        let mut state = self.state.lock().await;
        state.reducer.close_all(at_ms).await
    }

    /// Power notification: the system is going to sleep at `at_ms`. The
    /// sampling task is cancelled before state is touched, so no stale
    /// tick can reduce a sample after the close.
    pub async fn suspend(&self, at_ms: i64) -> Result<(), EngineError> {
        self.stop_task().await;

        let mut state = self.state.lock().await;
        if state.suspended_at.is_some() {
            warn!("suspend at {at_ms} ignored; already suspended");
            return Ok(());
        }

        state.reducer.close_all(at_ms).await?;
        state.suspended_at = Some(at_ms);
        info!("suspended at {at_ms}; open items closed");
        Ok(())
    }

    /// Power notification: the system woke at `at_ms`. Gaps above the
    /// configured minimum become a synthetic Offline item; the sampling
    /// task restarts if a source is installed.
    pub async fn resume(&self, at_ms: i64) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock().await;
            match state.suspended_at.take() {
                Some(suspended_at) => {
                    self.insert_offline_gap(suspended_at, at_ms).await?;
                }
                None => warn!("resume at {at_ms} without a matching suspend"),
            }
        }

        let mut sampler = self.sampler.lock().await;
        if sampler.handle.is_none() {
            if let Some(source) = sampler.source.clone() {
                self.start_task(&mut sampler, source);
                info!("sampling resumed at {at_ms}");
            }
        }
        Ok(())
    }

    pub async fn query_range(
        &self,
        kind: ActivityKind,
        from: i64,
        to: i64,
    ) -> Result<Vec<TrackItem>, EngineError> {
        self.db.find_in_range(kind, from, to).await
    }

    pub async fn search_range(
        &self,
        kind: ActivityKind,
        from: i64,
        to: i64,
        needle: impl Into<String>,
    ) -> Result<Vec<TrackItem>, EngineError> {
        self.db.search_in_range(kind, from, to, needle.into()).await
    }

    /// Clamped, gap-filled segment sequence for `[from, to]`; see the
    /// `timeline` module for the walk itself.
    pub async fn reconstruct_timeline(
        &self,
        kind: ActivityKind,
        from: i64,
        to: i64,
    ) -> Result<Vec<Segment>, EngineError> {
        let window = QueryWindow::new(from, to);
        window.validate()?;

        let items = self.db.find_in_range(kind, from, to).await?;
        timeline::reconstruct(window, &items)
    }

    pub async fn delete_items(&self, ids: Vec<i64>) -> Result<usize, EngineError> {
        self.db.delete_items(ids).await
    }

    /// Manual-edit path for user corrections: insert when `id` is absent,
    /// otherwise rewrite the identified item. Subject to the same
    /// validation and non-overlap rules as reducer writes.
    pub async fn manual_upsert(&self, mut item: TrackItem) -> Result<TrackItem, EngineError> {
        match item.id {
            Some(id) => self.db.update_item(id, &item).await?,
            None => {
                let id = self.db.insert_item(&item).await?;
                item.id = Some(id);
            }
        }
        Ok(item)
    }

    pub async fn find_first(&self, kind: ActivityKind) -> Result<Option<TrackItem>, EngineError> {
        self.db.find_first(kind).await
    }

    pub async fn update_color(
        &self,
        kind: ActivityKind,
        identity: impl Into<String>,
        color: Option<String>,
    ) -> Result<usize, EngineError> {
        self.db.update_color(kind, identity.into(), color).await
    }

    /// The item currently being extended for `kind`, if any. Answers
    /// "current activity since" queries without touching the store.
    pub async fn get_open_item(&self, kind: ActivityKind) -> Option<TrackItem> {
        self.state.lock().await.reducer.open_item(kind)
    }

    /// beginDate of the open Status item when the machine is online.
    pub async fn online_start_time(&self) -> Option<i64> {
        let open = self.get_open_item(ActivityKind::Status).await?;
        (open.identity == Status::Online.as_str()).then_some(open.begin_date)
    }

    fn start_task(
        &self,
        sampler: &mut SamplerTask,
        source: Arc<Mutex<Box<dyn SampleSource>>>,
    ) {
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(sampling_loop(
            self.clone(),
            source,
            self.settings.sampling_interval_ms,
            cancel_token.clone(),
        ));

        sampler.handle = Some(handle);
        sampler.cancel_token = Some(cancel_token);
    }

    async fn stop_task(&self) {
        let (handle, cancel_token) = {
            let mut sampler = self.sampler.lock().await;
            (sampler.handle.take(), sampler.cancel_token.take())
        };

        if let Some(token) = cancel_token {
            token.cancel();
        }
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!("sampling loop task failed to join: {err}");
            }
        }
    }

    async fn insert_offline_gap(&self, from: i64, to: i64) -> Result<(), EngineError> {
        if to - from < self.settings.min_sleep_gap_ms {
            debug!("gap of {}ms below minimum; no offline item", to - from);
            return Ok(());
        }

        let gap = TrackItem {
            id: None,
            kind: ActivityKind::Status,
            identity: Status::Offline.as_str().to_string(),
            begin_date: from,
            end_date: to,
            color: None,
        };

        match self.db.insert_item(&gap).await {
            Ok(id) => {
                info!("inserted offline gap item {id} spanning [{from}, {to}]");
                Ok(())
            }
            Err(EngineError::Overlap { .. }) => {
                // Something else recorded activity during the gap; the
                // synthetic item must not intersect it.
                warn!("offline gap [{from}, {to}] collides with existing items; skipped");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
