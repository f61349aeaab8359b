//! Location -> region resolution for contract grouping.
//!
//! Stations and structures resolve to a solar system, systems to a
//! constellation, constellations to a region. Every hop is cached; the chain
//! rarely changes so the namespaces carry long TTLs.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::cache::TtlCache;
use crate::error::SyncError;
use crate::esi::{Endpoint, UpstreamApi};

const STATION_IDS: std::ops::Range<i64> = 60_000_000..64_000_000;
const SYSTEM_IDS: std::ops::Range<i64> = 30_000_000..33_000_000;
/// Player structures use ids far above every static range.
const STRUCTURE_ID_FLOOR: i64 = 1_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    Station,
    Structure,
    SolarSystem,
    Unknown,
}

pub fn classify(location_id: i64) -> LocationKind {
    if STATION_IDS.contains(&location_id) {
        LocationKind::Station
    } else if SYSTEM_IDS.contains(&location_id) {
        LocationKind::SolarSystem
    } else if location_id >= STRUCTURE_ID_FLOOR {
        LocationKind::Structure
    } else {
        LocationKind::Unknown
    }
}

pub struct RegionResolver {
    upstream: Arc<dyn UpstreamApi>,
    locations: Arc<TtlCache>,
    structures: Arc<TtlCache>,
    locations_ttl: Duration,
    structures_ttl: Duration,
}

impl RegionResolver {
    pub fn new(
        upstream: Arc<dyn UpstreamApi>,
        locations: Arc<TtlCache>,
        structures: Arc<TtlCache>,
        locations_ttl: Duration,
        structures_ttl: Duration,
    ) -> Self {
        Self {
            upstream,
            locations,
            structures,
            locations_ttl,
            structures_ttl,
        }
    }

    /// Region for a station, structure or system id. `Ok(None)` when the
    /// location cannot be resolved (unknown range, no structure access).
    pub async fn region_for(
        &self,
        location_id: i64,
        bearer: Option<&str>,
    ) -> Result<Option<i64>, SyncError> {
        let system_id = match classify(location_id) {
            LocationKind::SolarSystem => Some(location_id),
            LocationKind::Station => {
                self.hop(
                    &self.locations,
                    self.locations_ttl,
                    &format!("station:{location_id}"),
                    Endpoint::station(location_id),
                    "system_id",
                    None,
                )
                .await?
            }
            LocationKind::Structure => {
                let Some(token) = bearer else {
                    return Ok(None);
                };
                match self
                    .hop(
                        &self.structures,
                        self.structures_ttl,
                        &format!("structure:{location_id}"),
                        Endpoint::structure(location_id),
                        "solar_system_id",
                        Some(token),
                    )
                    .await
                {
                    // No docking rights on this structure.
                    Err(SyncError::UpstreamRejected { status, .. }) => {
                        debug!(location_id, status, "structure not resolvable");
                        None
                    }
                    other => other?,
                }
            }
            LocationKind::Unknown => None,
        };
        let Some(system_id) = system_id else {
            return Ok(None);
        };

        let Some(constellation_id) = self
            .hop(
                &self.locations,
                self.locations_ttl,
                &format!("system:{system_id}"),
                Endpoint::system(system_id),
                "constellation_id",
                None,
            )
            .await?
        else {
            return Ok(None);
        };
        self.hop(
            &self.locations,
            self.locations_ttl,
            &format!("constellation:{constellation_id}"),
            Endpoint::constellation(constellation_id),
            "region_id",
            None,
        )
        .await
    }

    async fn hop(
        &self,
        cache: &TtlCache,
        ttl: Duration,
        key: &str,
        endpoint: Endpoint,
        field: &str,
        bearer: Option<&str>,
    ) -> Result<Option<i64>, SyncError> {
        if let Some(id) = cache.get::<i64>(key) {
            return Ok(Some(id));
        }
        let records = self.upstream.fetch(&endpoint, bearer).await?;
        let id = records
            .first()
            .and_then(|r| r.get(field))
            .and_then(Value::as_i64);
        if let Some(id) = id {
            if let Err(e) = cache.put(key, &id, ttl).await {
                debug!(key, error = %e, "location cache write failed");
            }
        }
        Ok(id)
    }
}
