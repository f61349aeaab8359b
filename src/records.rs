//! Typed upstream records.
//!
//! Raw JSON is decoded into these structs at the ingestion boundary. Missing
//! required fields or wrong types fail decoding; `validate` adds the range
//! checks serde cannot express. Every record knows its external id, the
//! content-store payload it maps to, and its version indicator.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::content::RecordPayload;
use crate::model::EntityType;

pub trait EsiRecord: DeserializeOwned {
    const ENTITY: EntityType;

    fn external_id(&self) -> i64;

    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    fn payload(&self) -> RecordPayload;

    /// Changes whenever the stored record would change.
    fn version(&self) -> String {
        payload_hash(&self.payload())
    }
}

/// A decoded, validated record ready for upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub external_id: i64,
    pub version: String,
    pub payload: RecordPayload,
}

impl Prepared {
    pub fn from_record<R: EsiRecord>(record: &R) -> Self {
        Self {
            external_id: record.external_id(),
            version: record.version(),
            payload: record.payload(),
        }
    }
}

/// Decode and validate one raw record. On failure returns whatever id could
/// be read so the failure can be reported against it.
pub fn decode<R: EsiRecord>(raw: &Value, id_field: &str) -> Result<R, (Option<i64>, String)> {
    let record: R = serde_json::from_value(raw.clone())
        .map_err(|e| (raw.get(id_field).and_then(Value::as_i64), e.to_string()))?;
    record
        .validate()
        .map_err(|reason| (Some(record.external_id()), reason))?;
    Ok(record)
}

pub fn payload_hash(payload: &RecordPayload) -> String {
    let mut hasher = Sha256::new();
    if let Some(title) = &payload.title {
        hasher.update(title.as_bytes());
    }
    hasher.update([0u8]);
    // BTreeMap keeps the serialization order stable.
    if let Ok(meta) = serde_json::to_vec(&payload.meta) {
        hasher.update(meta);
    }
    for key in &payload.cleared {
        hasher.update([1u8]);
        hasher.update(key.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn require_positive(name: &str, value: i64) -> Result<(), String> {
    if value > 0 {
        Ok(())
    } else {
        Err(format!("{name} must be positive, got {value}"))
    }
}

fn require_text(name: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{name} must not be empty"))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CharacterRecord {
    pub character_id: i64,
    pub name: String,
    pub corporation_id: i64,
    pub birthday: DateTime<Utc>,
    #[serde(default)]
    pub alliance_id: Option<i64>,
    #[serde(default)]
    pub security_status: Option<f64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl EsiRecord for CharacterRecord {
    const ENTITY: EntityType = EntityType::Character;

    fn external_id(&self) -> i64 {
        self.character_id
    }

    fn validate(&self) -> Result<(), String> {
        require_positive("character_id", self.character_id)?;
        require_positive("corporation_id", self.corporation_id)?;
        require_text("name", &self.name)
    }

    fn payload(&self) -> RecordPayload {
        RecordPayload::titled(self.name.clone())
            .with("corporation_id", self.corporation_id)
            .with("birthday", self.birthday.to_rfc3339())
            .with("alliance_id", self.alliance_id)
            .with("security_status", self.security_status)
            .with("title", self.title.clone())
            .with("description", self.description.clone())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CorporationRecord {
    pub corporation_id: i64,
    pub name: String,
    pub ticker: String,
    pub member_count: i64,
    pub ceo_id: i64,
    #[serde(default)]
    pub tax_rate: Option<f64>,
    #[serde(default)]
    pub alliance_id: Option<i64>,
    #[serde(default)]
    pub home_station_id: Option<i64>,
    #[serde(default)]
    pub date_founded: Option<DateTime<Utc>>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl EsiRecord for CorporationRecord {
    const ENTITY: EntityType = EntityType::Corporation;

    fn external_id(&self) -> i64 {
        self.corporation_id
    }

    fn validate(&self) -> Result<(), String> {
        require_positive("corporation_id", self.corporation_id)?;
        require_text("name", &self.name)?;
        require_text("ticker", &self.ticker)?;
        if self.member_count < 0 {
            return Err(format!("member_count must not be negative, got {}", self.member_count));
        }
        Ok(())
    }

    fn payload(&self) -> RecordPayload {
        RecordPayload::titled(self.name.clone())
            .with("ticker", self.ticker.clone())
            .with("member_count", self.member_count)
            .with("ceo_id", self.ceo_id)
            .with("tax_rate", self.tax_rate)
            .with("alliance_id", self.alliance_id)
            .with("home_station_id", self.home_station_id)
            .with("date_founded", self.date_founded.map(|d| d.to_rfc3339()))
            .with("url", self.url.clone())
            .with("description", self.description.clone())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BlueprintRecord {
    pub item_id: i64,
    pub type_id: i64,
    pub location_id: i64,
    pub location_flag: String,
    /// -1 for an original, -2 for a copy, otherwise the stack size.
    pub quantity: i64,
    pub material_efficiency: i64,
    pub time_efficiency: i64,
    /// -1 for an original.
    pub runs: i64,
}

impl EsiRecord for BlueprintRecord {
    const ENTITY: EntityType = EntityType::Blueprint;

    fn external_id(&self) -> i64 {
        self.item_id
    }

    fn validate(&self) -> Result<(), String> {
        require_positive("item_id", self.item_id)?;
        require_positive("type_id", self.type_id)?;
        if !(0..=10).contains(&self.material_efficiency) {
            return Err(format!("material_efficiency out of range: {}", self.material_efficiency));
        }
        if !(0..=20).contains(&self.time_efficiency) {
            return Err(format!("time_efficiency out of range: {}", self.time_efficiency));
        }
        if self.runs < -1 {
            return Err(format!("runs out of range: {}", self.runs));
        }
        Ok(())
    }

    fn payload(&self) -> RecordPayload {
        let kind = if self.quantity == -2 { "copy" } else { "original" };
        RecordPayload::titled(format!("Blueprint {} ({kind})", self.type_id))
            .with("type_id", self.type_id)
            .with("location_id", self.location_id)
            .with("location_flag", self.location_flag.clone())
            .with("quantity", self.quantity)
            .with("material_efficiency", self.material_efficiency)
            .with("time_efficiency", self.time_efficiency)
            .with("runs", self.runs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PlanetRecord {
    pub planet_id: i64,
    pub solar_system_id: i64,
    pub planet_type: String,
    pub owner_id: i64,
    pub last_update: DateTime<Utc>,
    pub upgrade_level: i64,
    pub num_pins: i64,
}

impl EsiRecord for PlanetRecord {
    const ENTITY: EntityType = EntityType::Planet;

    fn external_id(&self) -> i64 {
        self.planet_id
    }

    fn validate(&self) -> Result<(), String> {
        require_positive("planet_id", self.planet_id)?;
        require_text("planet_type", &self.planet_type)?;
        if !(0..=5).contains(&self.upgrade_level) {
            return Err(format!("upgrade_level out of range: {}", self.upgrade_level));
        }
        Ok(())
    }

    fn payload(&self) -> RecordPayload {
        RecordPayload::titled(format!("{} planet {}", self.planet_type, self.planet_id))
            .with("solar_system_id", self.solar_system_id)
            .with("planet_type", self.planet_type.clone())
            .with("owner_id", self.owner_id)
            .with("last_update", self.last_update.to_rfc3339())
            .with("upgrade_level", self.upgrade_level)
            .with("num_pins", self.num_pins)
    }

    fn version(&self) -> String {
        self.last_update.to_rfc3339()
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    ItemExchange,
    Auction,
    Courier,
    Loan,
    #[serde(other)]
    Unknown,
}

impl ContractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractType::ItemExchange => "item_exchange",
            ContractType::Auction => "auction",
            ContractType::Courier => "courier",
            ContractType::Loan => "loan",
            ContractType::Unknown => "unknown",
        }
    }
}

/// Public region contracts carry no status; they are outstanding by
/// definition.
fn outstanding() -> String {
    "outstanding".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ContractItem {
    pub type_id: i64,
    pub quantity: i64,
    #[serde(default = "default_included")]
    pub is_included: bool,
}

fn default_included() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ContractRecord {
    pub contract_id: i64,
    pub issuer_id: i64,
    pub issuer_corporation_id: i64,
    #[serde(rename = "type")]
    pub kind: ContractType,
    #[serde(default = "outstanding")]
    pub status: String,
    pub date_issued: DateTime<Utc>,
    pub date_expired: DateTime<Utc>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub start_location_id: Option<i64>,
    #[serde(default)]
    pub for_corporation: bool,
    /// Filled from the items endpoint for item-exchange contracts.
    #[serde(default)]
    pub items: Vec<ContractItem>,
    /// Filled by location resolution.
    #[serde(default)]
    pub region_id: Option<i64>,
}

impl ContractRecord {
    pub fn is_outstanding(&self) -> bool {
        self.status == "outstanding"
    }

    pub fn price(&self) -> f64 {
        self.price.unwrap_or(0.0)
    }
}

impl EsiRecord for ContractRecord {
    const ENTITY: EntityType = EntityType::Contract;

    fn external_id(&self) -> i64 {
        self.contract_id
    }

    fn validate(&self) -> Result<(), String> {
        require_positive("contract_id", self.contract_id)?;
        require_positive("issuer_id", self.issuer_id)?;
        if let Some(price) = self.price {
            if !price.is_finite() || price < 0.0 {
                return Err(format!("price must be a non-negative number, got {price}"));
            }
        }
        if self.date_expired < self.date_issued {
            return Err("date_expired precedes date_issued".into());
        }
        Ok(())
    }

    fn payload(&self) -> RecordPayload {
        let title = self
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("Contract {}", self.contract_id));
        let items: Vec<Value> = self
            .items
            .iter()
            .filter(|i| i.is_included)
            .map(|i| serde_json::json!({ "type_id": i.type_id, "quantity": i.quantity }))
            .collect();
        RecordPayload::titled(title)
            .with("type", self.kind.as_str())
            .with("status", self.status.clone())
            .with("issuer_id", self.issuer_id)
            .with("issuer_corporation_id", self.issuer_corporation_id)
            .with("price", self.price)
            .with("volume", self.volume)
            .with("date_issued", self.date_issued.to_rfc3339())
            .with("date_expired", self.date_expired.to_rfc3339())
            .with("start_location_id", self.start_location_id)
            .with("region_id", self.region_id)
            .with("items", items)
    }
}
