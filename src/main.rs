use anyhow::{bail, Result};
use clap::Parser;
use mockable::{Clock, DefaultClock};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use esi_sync::auth::{SsoClient, TokenManager, TokenRefresher};
use esi_sync::cache::CacheSet;
use esi_sync::competition::{ContractCompetitionAnalyzer, UndercutPolicy};
use esi_sync::config::{self, Account, Config};
use esi_sync::content::{ContentStore, WordPressClient};
use esi_sync::db::{self, Pool};
use esi_sync::error::Domain;
use esi_sync::esi::{EsiClient, RateBudget};
use esi_sync::model::{EntityType, SourceId};
use esi_sync::orchestrator::{Orchestrator, RunReport, RunStatus};
use esi_sync::resilience::{CircuitBreaker, Guard, RetryRuntime};
use esi_sync::syncer::{EntitySyncer, SyncTtls};

#[derive(Debug, Parser)]
#[command(author, version, about = "Sync ESI account data into the content store")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only sync these character ids (comma separated)
    #[arg(long, value_delimiter = ',')]
    only: Vec<i64>,

    /// Only sync the sources that failed in the previous run
    #[arg(long)]
    rerun_failed: bool,

    /// Restrict the run to these entity types (comma separated)
    #[arg(long, value_delimiter = ',')]
    entities: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let entities = parse_entities(&args.entities)?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let clock: Arc<dyn Clock> = Arc::new(DefaultClock);
    let caches = CacheSet::open(&cfg, clock.clone()).await?;
    let flushers = caches.spawn_flushers(Duration::from_millis(cfg.cache.flush_interval_ms));

    let outcome = execute(&cfg, &args, entities, pool, caches.clone(), clock).await;

    // Staged cache writes must reach disk whatever happened above.
    for flusher in flushers {
        flusher.abort();
    }
    if !caches.flush_all().await {
        warn!("some cache namespaces could not be flushed");
    }
    caches.log_stats();

    let report = outcome?;
    report.write(&cfg.last_run_path()).await?;
    match &report.status {
        RunStatus::Aborted { reason } => bail!("run aborted: {reason}"),
        RunStatus::Completed => {
            let failed = report.failed_sources();
            if failed.is_empty() {
                info!(run_id = %report.run_id, "all sources synced");
            } else {
                warn!(
                    run_id = %report.run_id,
                    failed = ?failed,
                    "some sources failed; rerun with --rerun-failed"
                );
            }
        }
    }
    Ok(())
}

fn parse_entities(raw: &[String]) -> Result<Vec<EntityType>> {
    if raw.is_empty() {
        return Ok(EntityType::ALL.to_vec());
    }
    raw.iter()
        .map(|name| {
            EntityType::parse(name.trim())
                .ok_or_else(|| anyhow::anyhow!("unknown entity type: {name}"))
        })
        .collect()
}

async fn select_accounts(cfg: &Config, args: &Args) -> Result<Vec<Account>> {
    let mut accounts = cfg.accounts.clone();
    if !args.only.is_empty() {
        let known: BTreeSet<i64> = accounts.iter().map(|a| a.character_id).collect();
        if let Some(unknown) = args.only.iter().find(|id| !known.contains(id)) {
            bail!("character {unknown} is not configured under accounts");
        }
        accounts.retain(|a| args.only.contains(&a.character_id));
    }
    if args.rerun_failed {
        match RunReport::read(&cfg.last_run_path()).await? {
            Some(previous) => {
                let failed: BTreeSet<SourceId> = previous.failed_sources().into_iter().collect();
                accounts.retain(|a| failed.contains(&SourceId(a.character_id)));
                info!(previous_run = %previous.run_id, sources = accounts.len(), "rerunning failed sources");
            }
            None => warn!("no previous run report, syncing every selected source"),
        }
    }
    Ok(accounts)
}

async fn execute(
    cfg: &Config,
    args: &Args,
    entities: Vec<EntityType>,
    pool: Pool,
    caches: CacheSet,
    clock: Arc<dyn Clock>,
) -> Result<RunReport> {
    let accounts = select_accounts(cfg, args).await?;
    if accounts.is_empty() {
        info!("no sources selected");
    }

    let runtime = RetryRuntime::default();
    let upstream_breaker = Arc::new(CircuitBreaker::new(
        Domain::Upstream,
        cfg.upstream_breaker(),
        clock.clone(),
    ));
    let store_breaker = Arc::new(CircuitBreaker::new(
        Domain::ContentStore,
        cfg.content_store_breaker(),
        clock.clone(),
    ));

    let budget = Arc::new(RateBudget::new(
        cfg.esi.low_water_mark,
        clock.clone(),
        runtime.sleeper.clone(),
    ));
    let esi = EsiClient::new(
        cfg,
        budget,
        Some(Guard::new(upstream_breaker.clone(), cfg.esi.retry.policy(), runtime.clone())),
    )?;
    let store = WordPressClient::new(
        cfg,
        Some(Guard::new(store_breaker.clone(), cfg.content_store.retry.policy(), runtime)),
    )?;

    if let Err(err) = store.ping().await {
        return Ok(RunReport::aborted(format!("content store check failed: {err}")));
    }

    let sso: Arc<dyn TokenRefresher> = Arc::new(SsoClient::new(cfg)?);
    let mut syncer = EntitySyncer::new(
        Arc::new(esi),
        Arc::new(store),
        pool.clone(),
        caches,
        SyncTtls::from(&cfg.cache.ttl_secs),
    )
    .with_analyzer(ContractCompetitionAnalyzer::new(UndercutPolicy::from(&cfg.competition)));

    let mut sources = Vec::with_capacity(accounts.len());
    for account in &accounts {
        let manager = match TokenManager::load(
            pool.clone(),
            account.character_id,
            account.refresh_token.as_deref(),
            sso.clone(),
            clock.clone(),
        )
        .await
        {
            Ok(manager) => manager,
            Err(err) => return Ok(RunReport::aborted(format!("{err:#}"))),
        };
        let source = SourceId(account.character_id);
        syncer = syncer.with_token(source, Arc::new(manager));
        sources.push(source);
    }

    let orchestrator = Orchestrator::new(
        Arc::new(syncer),
        cfg.app.max_concurrency,
        cfg.run_timeout(),
    )
    .with_entities(entities);
    let report = orchestrator.run(&sources).await;

    for breaker in [&upstream_breaker, &store_breaker] {
        let snapshot = breaker.snapshot();
        info!(
            domain = %breaker.domain(),
            state = ?snapshot.state,
            consecutive_failures = snapshot.consecutive_failures,
            "breaker state"
        );
    }
    Ok(report)
}
