//! Deterministic doubles for tests: clock, sleeper, and scripted stand-ins
//! for the upstream API, content store, token source and notifier.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeDelta, Utc};
use mockable::Clock;
use serde_json::Value;

use crate::auth::BearerSource;
use crate::content::model::is_blank;
use crate::content::{ContentStore, RecordPayload};
use crate::error::SyncError;
use crate::esi::{Endpoint, UpstreamApi};
use crate::model::{EntityType, SourceId};
use crate::notify::{Notifier, OutbidAlert};
use crate::resilience::{BackoffJitter, Sleeper};

#[derive(Debug)]
pub struct MutableClock(Mutex<DateTime<Utc>>);

impl MutableClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn advance(&self, delta: Duration) {
        let delta = match TimeDelta::from_std(delta) {
            Ok(delta) => delta,
            Err(error) => panic!("failed to convert Duration to TimeDelta: {error}; delta={delta:?}"),
        };
        *self.lock_clock() += delta;
    }

    fn lock_clock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(_) => panic!("clock mutex"),
        }
    }
}

impl Clock for MutableClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.lock_clock()
    }
}

/// Records every requested sleep and returns immediately. When built with a
/// clock, sleeping advances that clock so time-based logic stays consistent.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
    clock: Option<Arc<MutableClock>>,
}

impl RecordingSleeper {
    pub fn with_clock(clock: Arc<MutableClock>) -> Self {
        Self {
            sleeps: Mutex::new(Vec::new()),
            clock: Some(clock),
        }
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("sleeper mutex").clone()
    }

    pub fn total(&self) -> Duration {
        self.recorded().into_iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().expect("sleeper mutex").push(duration);
        if let Some(clock) = &self.clock {
            clock.advance(duration);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl BackoffJitter for NoJitter {
    fn jittered(&self, base: Duration, _attempt: u32) -> Duration {
        base
    }
}

type Scripted = Result<Vec<Value>, SyncError>;

/// Upstream double keyed by endpoint path. One-shot responses are served
/// before the standing response; unknown paths answer 404.
#[derive(Debug, Default)]
pub struct ScriptedUpstream {
    standing: Mutex<HashMap<String, Scripted>>,
    once: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch sleeps this long, so concurrency can be observed.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn respond(&self, path: &str, records: Vec<Value>) {
        self.standing
            .lock()
            .expect("upstream mutex")
            .insert(path.to_string(), Ok(records));
    }

    pub fn fail(&self, path: &str, error: SyncError) {
        self.standing
            .lock()
            .expect("upstream mutex")
            .insert(path.to_string(), Err(error));
    }

    pub fn respond_once(&self, path: &str, result: Scripted) {
        self.once
            .lock()
            .expect("upstream mutex")
            .entry(path.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().expect("upstream mutex").clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls().iter().filter(|(p, _)| p == path).count()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamApi for ScriptedUpstream {
    async fn fetch(&self, endpoint: &Endpoint, bearer: Option<&str>) -> Scripted {
        self.calls
            .lock()
            .expect("upstream mutex")
            .push((endpoint.path.clone(), bearer.map(str::to_string)));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let queued = self
            .once
            .lock()
            .expect("upstream mutex")
            .get_mut(&endpoint.path)
            .and_then(VecDeque::pop_front);
        if let Some(result) = queued {
            return result;
        }
        self.standing
            .lock()
            .expect("upstream mutex")
            .get(&endpoint.path)
            .cloned()
            .unwrap_or_else(|| {
                Err(SyncError::UpstreamRejected {
                    status: 404,
                    message: format!("no script for {}", endpoint.path),
                })
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub entity: EntityType,
    pub external_id: i64,
    pub title: Option<String>,
    pub meta: HashMap<String, Value>,
}

/// Content store double with partial-update semantics: blank fields in an
/// update leave the stored value alone.
#[derive(Debug, Default)]
pub struct RecordingStore {
    records: Mutex<HashMap<String, StoredRecord>>,
    next_id: AtomicU64,
    creates: AtomicUsize,
    updates: Mutex<Vec<(String, RecordPayload)>>,
    failing: Mutex<HashMap<i64, SyncError>>,
    lost_replies: Mutex<HashSet<i64>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and updates for this external id fail with a store error.
    pub fn fail_for(&self, external_id: i64) {
        self.fail_with(
            external_id,
            SyncError::ContentStore(format!("scripted failure for {external_id}")),
        );
    }

    /// Creates and updates for this external id fail with `error`.
    pub fn fail_with(&self, external_id: i64, error: SyncError) {
        self.failing
            .lock()
            .expect("store mutex")
            .insert(external_id, error);
    }

    /// The next create for this external id is stored, but the caller sees
    /// a store error as if the reply had been lost.
    pub fn lose_create_reply_for(&self, external_id: i64) {
        self.lost_replies
            .lock()
            .expect("store mutex")
            .insert(external_id);
    }

    /// Seed a record as if it had been created by an earlier run.
    pub fn seed(&self, entity: EntityType, external_id: i64) -> String {
        let id = self.allocate();
        self.records.lock().expect("store mutex").insert(
            id.clone(),
            StoredRecord {
                entity,
                external_id,
                title: None,
                meta: HashMap::new(),
            },
        );
        id
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> Vec<(String, RecordPayload)> {
        self.updates.lock().expect("store mutex").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("store mutex").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, internal_id: &str) -> Option<StoredRecord> {
        self.records
            .lock()
            .expect("store mutex")
            .get(internal_id)
            .cloned()
    }

    pub fn find(&self, entity: EntityType, external_id: i64) -> Option<StoredRecord> {
        self.records
            .lock()
            .expect("store mutex")
            .values()
            .find(|r| r.entity == entity && r.external_id == external_id)
            .cloned()
    }

    fn allocate(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn check(&self, external_id: i64) -> Result<(), SyncError> {
        match self.failing.lock().expect("store mutex").get(&external_id) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn merge(record: &mut StoredRecord, payload: &RecordPayload) {
        if let Some(title) = payload.title.as_ref().filter(|t| !t.trim().is_empty()) {
            record.title = Some(title.clone());
        }
        for (key, value) in &payload.meta {
            if !is_blank(value) {
                record.meta.insert(key.clone(), value.clone());
            }
        }
        for key in &payload.cleared {
            record.meta.remove(key);
        }
    }
}

#[async_trait]
impl ContentStore for RecordingStore {
    async fn create_record(
        &self,
        entity: EntityType,
        external_id: i64,
        payload: &RecordPayload,
    ) -> Result<String, SyncError> {
        self.check(external_id)?;
        let id = self.allocate();
        let mut record = StoredRecord {
            entity,
            external_id,
            title: None,
            meta: HashMap::new(),
        };
        Self::merge(&mut record, payload);
        self.records
            .lock()
            .expect("store mutex")
            .insert(id.clone(), record);
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self
            .lost_replies
            .lock()
            .expect("store mutex")
            .remove(&external_id)
        {
            return Err(SyncError::ContentStore("operation timed out".into()));
        }
        Ok(id)
    }

    async fn update_record(
        &self,
        _entity: EntityType,
        internal_id: &str,
        payload: &RecordPayload,
    ) -> Result<(), SyncError> {
        let mut records = self.records.lock().expect("store mutex");
        let record = records
            .get_mut(internal_id)
            .ok_or_else(|| SyncError::Validation(format!("no record {internal_id}")))?;
        self.check(record.external_id)?;
        Self::merge(record, payload);
        self.updates
            .lock()
            .expect("store mutex")
            .push((internal_id.to_string(), payload.clone()));
        Ok(())
    }

    async fn find_by_external_id(
        &self,
        entity: EntityType,
        external_id: i64,
    ) -> Result<Option<String>, SyncError> {
        Ok(self
            .records
            .lock()
            .expect("store mutex")
            .iter()
            .find(|(_, r)| r.entity == entity && r.external_id == external_id)
            .map(|(id, _)| id.clone()))
    }

    async fn ping(&self) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Token source that hands out `token-N`, bumping N on every refresh.
#[derive(Debug, Default)]
pub struct StaticBearer {
    generation: AtomicUsize,
    refreshes: AtomicUsize,
}

impl StaticBearer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn current(&self) -> String {
        format!("token-{}", self.generation.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl BearerSource for StaticBearer {
    async fn bearer(&self) -> Result<String, SyncError> {
        Ok(self.current())
    }

    async fn refresh_after_rejection(&self, stale: &str) -> Result<String, SyncError> {
        if stale == self.current() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.refreshes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(self.current())
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<(SourceId, OutbidAlert)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<(SourceId, OutbidAlert)> {
        self.alerts.lock().expect("notifier mutex").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn outbid(&self, source: SourceId, alerts: &[OutbidAlert]) -> anyhow::Result<()> {
        self.alerts
            .lock()
            .expect("notifier mutex")
            .extend(alerts.iter().map(|a| (source, a.clone())));
        Ok(())
    }
}
