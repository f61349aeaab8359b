//! Runs entity syncs for many accounts under a concurrency cap and a
//! run-level deadline, and folds the results into a `RunReport`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::model::{EntityType, SourceId, SyncReport};
use crate::syncer::EntitySyncer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    /// Every source was attempted; individual sources may still have failed.
    Completed,
    /// Nothing ran.
    Aborted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: SourceId,
    pub entities: Vec<SyncReport>,
}

impl SourceReport {
    /// A source needs a rerun if any entity failed outright or lost records.
    pub fn is_failed(&self) -> bool {
        self.entities.iter().any(|r| r.is_failed() || r.failed > 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed_records: usize,
    pub failed_entities: usize,
    pub sources_ok: usize,
    pub sources_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub sources: Vec<SourceReport>,
    pub totals: Totals,
}

impl RunReport {
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            status: RunStatus::Aborted {
                reason: reason.into(),
            },
            started_at: Utc::now(),
            elapsed_ms: 0,
            sources: Vec::new(),
            totals: Totals::default(),
        }
    }

    fn completed(started_at: DateTime<Utc>, elapsed: Duration, reports: Vec<SyncReport>) -> Self {
        let mut by_source: BTreeMap<SourceId, Vec<SyncReport>> = BTreeMap::new();
        for report in reports {
            by_source.entry(report.source).or_default().push(report);
        }

        let mut totals = Totals::default();
        let sources: Vec<SourceReport> = by_source
            .into_iter()
            .map(|(source, mut entities)| {
                entities.sort_by_key(|r| r.entity_type);
                SourceReport { source, entities }
            })
            .collect();
        for source in &sources {
            for report in &source.entities {
                totals.created += report.created;
                totals.updated += report.updated;
                totals.skipped += report.skipped;
                totals.failed_records += report.failed;
                if report.is_failed() {
                    totals.failed_entities += 1;
                }
            }
            if source.is_failed() {
                totals.sources_failed += 1;
            } else {
                totals.sources_ok += 1;
            }
        }

        Self {
            run_id: Uuid::new_v4(),
            status: RunStatus::Completed,
            started_at,
            elapsed_ms: elapsed.as_millis() as u64,
            sources,
            totals,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.status, RunStatus::Aborted { .. })
    }

    /// Sources to pass to the next `--rerun-failed` run.
    pub fn failed_sources(&self) -> Vec<SourceId> {
        self.sources
            .iter()
            .filter(|s| s.is_failed())
            .map(|s| s.source)
            .collect()
    }

    pub async fn write(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self).context("serializing run report")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("renaming run report into {}", path.display()))?;
        Ok(())
    }

    /// `None` when no previous run left a report.
    pub async fn read(path: &Path) -> anyhow::Result<Option<Self>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let report = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(report))
    }
}

pub struct Orchestrator {
    syncer: Arc<EntitySyncer>,
    max_concurrency: usize,
    run_timeout: Duration,
    entities: Vec<EntityType>,
}

impl Orchestrator {
    pub fn new(syncer: Arc<EntitySyncer>, max_concurrency: usize, run_timeout: Duration) -> Self {
        Self {
            syncer,
            max_concurrency: max_concurrency.max(1),
            run_timeout,
            entities: EntityType::ALL.to_vec(),
        }
    }

    pub fn with_entities(mut self, entities: Vec<EntityType>) -> Self {
        self.entities = entities;
        self
    }

    /// One task per (source, entity). At most `max_concurrency` run at once;
    /// tasks still pending at the deadline are reported as timed out.
    pub async fn run(&self, sources: &[SourceId]) -> RunReport {
        let started_at = Utc::now();
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.run_timeout;
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let sources: BTreeSet<SourceId> = sources.iter().copied().collect();
        info!(
            sources = sources.len(),
            entities = self.entities.len(),
            max_concurrency = self.max_concurrency,
            "starting run"
        );

        let mut keys = Vec::new();
        let mut handles = Vec::new();
        for &source in &sources {
            for &entity in &self.entities {
                let syncer = self.syncer.clone();
                let semaphore = semaphore.clone();
                handles.push(tokio::spawn(async move {
                    let work = async {
                        let _permit = semaphore.acquire_owned().await.ok();
                        syncer.sync(entity, source).await
                    };
                    match tokio::time::timeout_at(deadline, work).await {
                        Ok(report) => report,
                        Err(_) => {
                            warn!(%source, %entity, "run deadline reached");
                            SyncReport::failed_with(entity, source, SyncError::Timeout.to_string())
                        }
                    }
                }));
                keys.push((source, entity));
            }
        }

        let reports: Vec<SyncReport> = join_all(handles)
            .await
            .into_iter()
            .zip(keys)
            .map(|(joined, (source, entity))| match joined {
                Ok(report) => report,
                Err(err) => {
                    error!(%source, %entity, error = %err, "sync task crashed");
                    SyncReport::failed_with(entity, source, format!("sync task crashed: {err}"))
                }
            })
            .collect();

        let report = RunReport::completed(started_at, started.elapsed(), reports);
        info!(
            run_id = %report.run_id,
            created = report.totals.created,
            updated = report.totals.updated,
            skipped = report.totals.skipped,
            failed_records = report.totals.failed_records,
            sources_failed = report.totals.sources_failed,
            elapsed_ms = report.elapsed_ms,
            "run finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(source: i64, entity: EntityType, failed: usize, error: Option<&str>) -> SyncReport {
        let mut r = SyncReport::new(entity, SourceId(source));
        r.created = 2;
        r.failed = failed;
        r.error = error.map(str::to_string);
        r
    }

    #[test]
    fn totals_and_failed_sources() {
        let run = RunReport::completed(
            Utc::now(),
            Duration::from_millis(1500),
            vec![
                report(2, EntityType::Planet, 0, None),
                report(1, EntityType::Blueprint, 1, None),
                report(2, EntityType::Character, 0, None),
                report(3, EntityType::Contract, 0, Some("upstream circuit is open")),
            ],
        );
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.elapsed_ms, 1500);
        assert_eq!(run.totals.created, 8);
        assert_eq!(run.totals.failed_records, 1);
        assert_eq!(run.totals.failed_entities, 1);
        assert_eq!(run.totals.sources_ok, 1);
        assert_eq!(run.failed_sources(), vec![SourceId(1), SourceId(3)]);
        assert_eq!(run.sources[1].entities[0].entity_type, EntityType::Character);
    }

    #[tokio::test]
    async fn report_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_run.json");
        assert!(RunReport::read(&path).await.unwrap().is_none());

        let run = RunReport::aborted("no credentials for character 5");
        run.write(&path).await.unwrap();
        let back = RunReport::read(&path).await.unwrap().unwrap();
        assert_eq!(back, run);
        assert!(back.is_aborted());
    }
}
