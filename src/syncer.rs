//! Per-entity sync pipeline: fetch, validate, diff, upsert.
//!
//! Records are processed in fetch order. A bad record is charged to the
//! report and the loop moves on; only errors that make the rest of the batch
//! pointless (open breaker, dead credentials) stop it early.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::auth::BearerSource;
use crate::cache::{CacheSet, TtlCache};
use crate::competition::{CompetitionResult, ContractCompetitionAnalyzer};
use crate::config::CacheTtls;
use crate::content::ContentStore;
use crate::db::{self, Pool};
use crate::error::SyncError;
use crate::esi::{Endpoint, UpstreamApi};
use crate::locations::RegionResolver;
use crate::locks::KeyLocks;
use crate::model::{EntityType, SourceId, SyncReport, UpsertOutcome};
use crate::notify::{LogNotifier, Notifier, OutbidAlert};
use crate::records::{
    self, BlueprintRecord, CharacterRecord, ContractItem, ContractRecord, ContractType,
    CorporationRecord, EsiRecord, PlanetRecord, Prepared,
};

/// Cache lifetimes per namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTtls {
    pub esi: Duration,
    pub public_contracts: Duration,
    pub locations: Duration,
    pub structures: Duration,
    pub contract_items: Duration,
}

impl Default for SyncTtls {
    fn default() -> Self {
        Self {
            esi: Duration::from_secs(3600),
            public_contracts: Duration::from_secs(300),
            locations: Duration::from_secs(30 * 86_400),
            structures: Duration::from_secs(7 * 86_400),
            contract_items: Duration::from_secs(30 * 86_400),
        }
    }
}

impl From<&CacheTtls> for SyncTtls {
    fn from(cfg: &CacheTtls) -> Self {
        Self {
            esi: Duration::from_secs(cfg.esi),
            public_contracts: Duration::from_secs(cfg.public_contracts),
            locations: Duration::from_secs(cfg.locations),
            structures: Duration::from_secs(cfg.structures),
            contract_items: Duration::from_secs(cfg.contract_items),
        }
    }
}

pub struct EntitySyncer {
    upstream: Arc<dyn UpstreamApi>,
    store: Arc<dyn ContentStore>,
    pool: Pool,
    caches: CacheSet,
    ttls: SyncTtls,
    regions: RegionResolver,
    tokens: HashMap<SourceId, Arc<dyn BearerSource>>,
    analyzer: ContractCompetitionAnalyzer,
    notifier: Arc<dyn Notifier>,
    locks: KeyLocks<(EntityType, i64)>,
}

impl EntitySyncer {
    pub fn new(
        upstream: Arc<dyn UpstreamApi>,
        store: Arc<dyn ContentStore>,
        pool: Pool,
        caches: CacheSet,
        ttls: SyncTtls,
    ) -> Self {
        let regions = RegionResolver::new(
            upstream.clone(),
            caches.locations.clone(),
            caches.structures.clone(),
            ttls.locations,
            ttls.structures,
        );
        Self {
            upstream,
            store,
            pool,
            caches,
            ttls,
            regions,
            tokens: HashMap::new(),
            analyzer: ContractCompetitionAnalyzer::default(),
            notifier: Arc::new(LogNotifier),
            locks: KeyLocks::new(),
        }
    }

    pub fn with_token(mut self, source: SourceId, tokens: Arc<dyn BearerSource>) -> Self {
        self.tokens.insert(source, tokens);
        self
    }

    pub fn with_analyzer(mut self, analyzer: ContractCompetitionAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Sync one entity type for one account. Never fails: errors end up in
    /// the returned report.
    #[instrument(skip_all, fields(source = %source, entity = %entity))]
    pub async fn sync(&self, entity: EntityType, source: SourceId) -> SyncReport {
        let started = Instant::now();
        let result = match entity {
            EntityType::Character => self.sync_character(source).await,
            EntityType::Corporation => self.sync_corporation(source).await,
            EntityType::Blueprint => self.sync_blueprints(source).await,
            EntityType::Planet => self.sync_planets(source).await,
            EntityType::Contract => self.sync_contracts(source).await,
        };
        match result {
            Ok(report) => {
                info!(
                    created = report.created,
                    updated = report.updated,
                    skipped = report.skipped,
                    failed = report.failed,
                    from_cache = report.from_cache,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "entity synced"
                );
                report
            }
            Err(err) => {
                warn!(error = %err, "entity sync failed");
                SyncReport::failed_with(entity, source, err.to_string())
            }
        }
    }

    async fn sync_character(&self, source: SourceId) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new(EntityType::Character, source);
        let (raw, cached) = self
            .fetch_reference(EntityType::Character, &Endpoint::character(source.0))
            .await?;
        report.from_cache = cached;
        let raw = inject_id(raw, "character_id", source.0);
        let batch = decode_batch::<CharacterRecord>(&raw, "character_id", &mut report);
        self.upsert_batch(&mut report, batch).await;
        Ok(report)
    }

    async fn sync_corporation(&self, source: SourceId) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new(EntityType::Corporation, source);
        let (character, _) = self
            .fetch_reference(EntityType::Character, &Endpoint::character(source.0))
            .await?;
        let corporation_id = character
            .first()
            .and_then(|c| c.get("corporation_id"))
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                SyncError::Validation(format!("character {source} has no corporation_id"))
            })?;

        let (raw, cached) = self
            .fetch_reference(EntityType::Corporation, &Endpoint::corporation(corporation_id))
            .await?;
        report.from_cache = cached;
        let raw = inject_id(raw, "corporation_id", corporation_id);
        let batch = decode_batch::<CorporationRecord>(&raw, "corporation_id", &mut report);
        self.upsert_batch(&mut report, batch).await;
        Ok(report)
    }

    async fn sync_blueprints(&self, source: SourceId) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new(EntityType::Blueprint, source);
        let raw = self.fetch_authed(source, &Endpoint::blueprints(source.0)).await?;
        let batch = decode_batch::<BlueprintRecord>(&raw, "item_id", &mut report);
        self.upsert_batch(&mut report, batch).await;
        Ok(report)
    }

    async fn sync_planets(&self, source: SourceId) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new(EntityType::Planet, source);
        let raw = self.fetch_authed(source, &Endpoint::planets(source.0)).await?;
        let raw = inject_id(raw, "owner_id", source.0);
        let batch = decode_batch::<PlanetRecord>(&raw, "planet_id", &mut report);
        self.upsert_batch(&mut report, batch).await;
        Ok(report)
    }

    async fn sync_contracts(&self, source: SourceId) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new(EntityType::Contract, source);
        let raw = self.fetch_authed(source, &Endpoint::contracts(source.0)).await?;
        let decoded: Vec<(usize, ContractRecord)> = raw
            .iter()
            .enumerate()
            .filter_map(|(index, value)| match records::decode::<ContractRecord>(value, "contract_id") {
                Ok(contract) => Some((index, contract)),
                Err((id, reason)) => {
                    warn!(index, external_id = ?id, %reason, "dropping invalid record");
                    report.record_failure(index, id, reason);
                    None
                }
            })
            .collect();
        let (indices, mut own): (Vec<usize>, Vec<ContractRecord>) = decoded.into_iter().unzip();

        self.enrich_own(source, &mut own).await?;
        let rivals = self.public_rivals(&own).await?;

        let own_len = own.len();
        let mut candidates = own;
        candidates.extend(rivals);
        let results = self.analyzer.analyze(&candidates);
        candidates.truncate(own_len);

        let mut alerts = Vec::new();
        let mut batch = Vec::with_capacity(own_len);
        for ((index, contract), result) in indices.into_iter().zip(&candidates).zip(&results) {
            if let Some(alert) = outbid_alert(contract, result) {
                alerts.push(alert);
            }
            batch.push((index, prepare_contract(contract, result)));
        }

        if !alerts.is_empty() {
            info!(outbid = alerts.len(), "outbid contracts found");
            if let Err(err) = self.notifier.outbid(source, &alerts).await {
                let reason = format!("{err:#}");
                warn!(error = %reason, "outbid notification failed");
            }
        }

        self.upsert_batch(&mut report, batch).await;
        Ok(report)
    }

    /// Item lists and regions for our outstanding item-exchange contracts.
    async fn enrich_own(&self, source: SourceId, own: &mut [ContractRecord]) -> Result<(), SyncError> {
        for contract in own.iter_mut().filter(|c| is_comparable(c)) {
            let key = format!("own:{}", contract.contract_id);
            contract.items = match self.caches.contract_items.get::<Vec<ContractItem>>(&key) {
                Some(items) => items,
                None => {
                    let endpoint = Endpoint::contract_items(source.0, contract.contract_id);
                    match self.fetch_authed(source, &endpoint).await {
                        Ok(raw) => {
                            let items = decode_items(&raw);
                            self.cache_put(&self.caches.contract_items, &key, &items, self.ttls.contract_items)
                                .await;
                            items
                        }
                        Err(err) if err.is_source_fatal() => return Err(err),
                        Err(err) => {
                            warn!(contract_id = contract.contract_id, error = %err, "contract items unavailable");
                            Vec::new()
                        }
                    }
                }
            };

            let Some(location_id) = contract.start_location_id else {
                continue;
            };
            let bearer = match self.tokens.get(&source) {
                Some(tokens) => Some(tokens.bearer().await?),
                None => None,
            };
            contract.region_id = match self.regions.region_for(location_id, bearer.as_deref()).await {
                Ok(region) => region,
                Err(err) if err.is_source_fatal() => return Err(err),
                Err(err) => {
                    warn!(contract_id = contract.contract_id, location_id, error = %err, "region lookup failed");
                    None
                }
            };
        }
        Ok(())
    }

    /// Public contracts that could undercut one of ours: same regions, and
    /// cheaper than our dearest contract there.
    async fn public_rivals(&self, own: &[ContractRecord]) -> Result<Vec<ContractRecord>, SyncError> {
        let mut ceilings: HashMap<i64, f64> = HashMap::new();
        for contract in own.iter().filter(|c| is_comparable(c) && !c.items.is_empty()) {
            if let Some(region) = contract.region_id {
                let ceiling = ceilings.entry(region).or_insert(0.0);
                *ceiling = ceiling.max(contract.price());
            }
        }
        let own_ids: BTreeSet<i64> = own.iter().map(|c| c.contract_id).collect();

        let mut rivals = Vec::new();
        let mut regions: Vec<_> = ceilings.into_iter().collect();
        regions.sort_by_key(|(region, _)| *region);
        for (region_id, ceiling) in regions {
            let endpoint = Endpoint::public_contracts(region_id);
            let raw = match self
                .fetch_cached(&self.caches.esi, &endpoint, self.ttls.public_contracts)
                .await
            {
                Ok((raw, _)) => raw,
                Err(err) if err.is_source_fatal() => return Err(err),
                Err(err) => {
                    warn!(region_id, error = %err, "public contracts unavailable");
                    continue;
                }
            };

            for value in &raw {
                let Ok(mut contract) = records::decode::<ContractRecord>(value, "contract_id") else {
                    continue;
                };
                if contract.kind != ContractType::ItemExchange
                    || own_ids.contains(&contract.contract_id)
                    || contract.price() >= ceiling
                {
                    continue;
                }
                contract.region_id = Some(region_id);
                let key = format!("public:{}", contract.contract_id);
                contract.items = match self.caches.contract_items.get::<Vec<ContractItem>>(&key) {
                    Some(items) => items,
                    None => {
                        let endpoint = Endpoint::public_contract_items(contract.contract_id);
                        match self.upstream.fetch(&endpoint, None).await {
                            Ok(raw) => {
                                let items = decode_items(&raw);
                                self.cache_put(&self.caches.contract_items, &key, &items, self.ttls.contract_items)
                                    .await;
                                items
                            }
                            Err(err) if err.is_source_fatal() => return Err(err),
                            Err(err) => {
                                debug!(contract_id = contract.contract_id, error = %err, "skipping public contract");
                                continue;
                            }
                        }
                    }
                };
                rivals.push(contract);
            }
        }
        debug!(rivals = rivals.len(), "public rivals loaded");
        Ok(rivals)
    }

    /// Reference data goes through the response cache.
    async fn fetch_reference(
        &self,
        entity: EntityType,
        endpoint: &Endpoint,
    ) -> Result<(Vec<Value>, bool), SyncError> {
        if !entity.is_cache_eligible() {
            return Ok((self.upstream.fetch(endpoint, None).await?, false));
        }
        self.fetch_cached(&self.caches.esi, endpoint, self.ttls.esi).await
    }

    async fn fetch_cached(
        &self,
        cache: &TtlCache,
        endpoint: &Endpoint,
        ttl: Duration,
    ) -> Result<(Vec<Value>, bool), SyncError> {
        let key = endpoint.cache_key();
        if let Some(records) = cache.get::<Vec<Value>>(&key) {
            debug!(%key, "served from cache");
            return Ok((records, true));
        }
        let records = self.upstream.fetch(endpoint, None).await?;
        self.cache_put(cache, &key, &records, ttl).await;
        Ok((records, false))
    }

    async fn cache_put<T: serde::Serialize + ?Sized>(
        &self,
        cache: &TtlCache,
        key: &str,
        value: &T,
        ttl: Duration,
    ) {
        if let Err(err) = cache.put(key, value, ttl).await {
            warn!(namespace = cache.namespace(), key, error = %err, "cache write failed");
        }
    }

    /// Authenticated fetch. A 401 triggers one refresh and one retry.
    async fn fetch_authed(&self, source: SourceId, endpoint: &Endpoint) -> Result<Vec<Value>, SyncError> {
        let tokens = self
            .tokens
            .get(&source)
            .ok_or_else(|| SyncError::CredentialRefresh(format!("no credentials for character {source}")))?;
        let bearer = tokens.bearer().await?;
        match self.upstream.fetch(endpoint, Some(&bearer)).await {
            Err(SyncError::AuthExpired) => {
                let fresh = tokens.refresh_after_rejection(&bearer).await?;
                self.upstream.fetch(endpoint, Some(&fresh)).await
            }
            other => other,
        }
    }

    async fn upsert_batch(&self, report: &mut SyncReport, batch: Vec<(usize, Prepared)>) {
        let entity = report.entity_type;
        let mut items = batch.into_iter();
        while let Some((index, item)) = items.next() {
            match self.upsert(entity, &item).await {
                Ok(outcome) => report.record(outcome),
                Err(err) if err.is_source_fatal() => {
                    warn!(index, external_id = item.external_id, error = %err, "aborting batch");
                    let reason = err.to_string();
                    report.record_failure(index, Some(item.external_id), reason.clone());
                    // Records never attempted are charged the same reason.
                    for (index, rest) in items.by_ref() {
                        report.record_failure(index, Some(rest.external_id), reason.clone());
                    }
                    report.error = Some(reason);
                    break;
                }
                Err(err) => {
                    warn!(index, external_id = item.external_id, error = %err, "record upsert failed");
                    report.record_failure(index, Some(item.external_id), err.to_string());
                }
            }
        }
    }

    /// Idempotent upsert of one record, serialized per (entity, external id).
    pub async fn upsert(&self, entity: EntityType, item: &Prepared) -> Result<UpsertOutcome, SyncError> {
        let _guard = self.locks.lock(&(entity, item.external_id)).await;

        if let Some(mapping) = db::get_mapping(&self.pool, entity, item.external_id).await? {
            if mapping.version == item.version {
                return Ok(UpsertOutcome::Skipped);
            }
            self.store
                .update_record(entity, &mapping.internal_id, &item.payload)
                .await?;
            db::update_mapping_version(&self.pool, entity, item.external_id, &item.version).await?;
            return Ok(UpsertOutcome::Updated);
        }

        // A record may exist without a mapping if the table was lost.
        if let Some(internal_id) = self.store.find_by_external_id(entity, item.external_id).await? {
            info!(%entity, external_id = item.external_id, %internal_id, "adopting existing record");
            self.store.update_record(entity, &internal_id, &item.payload).await?;
            db::save_mapping(&self.pool, entity, item.external_id, &internal_id, &item.version).await?;
            return Ok(UpsertOutcome::Updated);
        }

        let internal_id = match self
            .store
            .create_record(entity, item.external_id, &item.payload)
            .await
        {
            Ok(internal_id) => internal_id,
            Err(err) if outcome_unknown(&err) => {
                // The store may have committed before the response was lost.
                match self.store.find_by_external_id(entity, item.external_id).await? {
                    Some(internal_id) => {
                        warn!(
                            %entity,
                            external_id = item.external_id,
                            %internal_id,
                            error = %err,
                            "create reply lost, adopting stored record"
                        );
                        internal_id
                    }
                    None => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };
        db::save_mapping(&self.pool, entity, item.external_id, &internal_id, &item.version).await?;
        debug!(%entity, external_id = item.external_id, %internal_id, "record created");
        Ok(UpsertOutcome::Created)
    }
}

/// Single-object routes omit the id they were addressed by.
fn inject_id(mut raw: Vec<Value>, field: &str, id: i64) -> Vec<Value> {
    for value in &mut raw {
        if let Some(object) = value.as_object_mut() {
            object.entry(field).or_insert(Value::from(id));
        }
    }
    raw
}

fn decode_batch<R: EsiRecord>(
    raw: &[Value],
    id_field: &str,
    report: &mut SyncReport,
) -> Vec<(usize, Prepared)> {
    raw.iter()
        .enumerate()
        .filter_map(|(index, value)| match records::decode::<R>(value, id_field) {
            Ok(record) => Some((index, Prepared::from_record(&record))),
            Err((id, reason)) => {
                warn!(index, external_id = ?id, %reason, "dropping invalid record");
                report.record_failure(index, id, reason);
                None
            }
        })
        .collect()
}

fn decode_items(raw: &[Value]) -> Vec<ContractItem> {
    raw.iter()
        .filter_map(|v| serde_json::from_value::<ContractItem>(v.clone()).ok())
        .collect()
}

/// Transport failures and 5xx replies leave a write's effect unknown.
fn outcome_unknown(err: &SyncError) -> bool {
    matches!(err, SyncError::TransientNetwork(_) | SyncError::ContentStore(_))
}

fn is_comparable(contract: &ContractRecord) -> bool {
    contract.kind == ContractType::ItemExchange && contract.is_outstanding()
}

fn prepare_contract(contract: &ContractRecord, result: &CompetitionResult) -> Prepared {
    let mut payload = contract.payload();
    payload.set("is_outbid", result.is_outbid);
    payload.set_or_clear("suggested_price", result.suggested_price);
    payload.set_or_clear("competitor_contract_id", result.competitor_contract_id);
    payload.set_or_clear("competitor_price", result.competitor_price);
    Prepared {
        external_id: contract.contract_id,
        version: records::payload_hash(&payload),
        payload,
    }
}

fn outbid_alert(contract: &ContractRecord, result: &CompetitionResult) -> Option<OutbidAlert> {
    if !result.is_outbid {
        return None;
    }
    Some(OutbidAlert {
        contract_id: contract.contract_id,
        title: contract
            .title
            .clone()
            .unwrap_or_else(|| format!("Contract {}", contract.contract_id)),
        price: contract.price(),
        competitor_contract_id: result.competitor_contract_id?,
        competitor_price: result.competitor_price?,
        suggested_price: result.suggested_price?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inject_id_keeps_existing_value() {
        let raw = inject_id(vec![json!({"name": "a"}), json!({"character_id": 5})], "character_id", 9);
        assert_eq!(raw[0]["character_id"], json!(9));
        assert_eq!(raw[1]["character_id"], json!(5));
    }

    #[test]
    fn contract_payload_carries_competition() {
        let contract: ContractRecord = serde_json::from_value(json!({
            "contract_id": 7,
            "issuer_id": 1,
            "issuer_corporation_id": 2,
            "type": "item_exchange",
            "date_issued": "2026-03-01T00:00:00Z",
            "date_expired": "2026-03-15T00:00:00Z",
            "price": 100.0
        }))
        .unwrap();
        let outbid = CompetitionResult {
            contract_id: 7,
            is_outbid: true,
            suggested_price: Some(89.0),
            competitor_contract_id: Some(8),
            competitor_price: Some(90.0),
        };
        let prepared = prepare_contract(&contract, &outbid);
        assert_eq!(prepared.payload.meta["is_outbid"], json!(true));
        assert_eq!(prepared.payload.meta["suggested_price"], json!(89.0));

        let calm = CompetitionResult {
            is_outbid: false,
            suggested_price: None,
            ..outbid.clone()
        };
        let calm_prepared = prepare_contract(&contract, &calm);
        assert_ne!(calm_prepared.version, prepared.version);
        assert!(!calm_prepared.payload.meta.contains_key("suggested_price"));
        assert!(calm_prepared.payload.cleared.contains("suggested_price"));
        assert!(outbid_alert(&contract, &calm).is_none());
        let alert = outbid_alert(&contract, &outbid).unwrap();
        assert_eq!(alert.title, "Contract 7");
        assert_eq!(alert.suggested_price, 89.0);
    }
}
