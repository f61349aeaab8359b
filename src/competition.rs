//! Contract competition: which of our contracts has a cheaper rival.
//!
//! Contracts are grouped by (type, region, item signature). Inside a group a
//! contract is outbid when a contract from a different issuer and a
//! different issuer corporation is strictly cheaper. Equal prices do not
//! count.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::Competition;
use crate::records::{ContractItem, ContractRecord, ContractType};

/// How the suggested price is derived from the cheapest competitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UndercutPolicy {
    pub step: f64,
    pub decimals: u32,
}

impl Default for UndercutPolicy {
    fn default() -> Self {
        Self {
            step: 1.0,
            decimals: 2,
        }
    }
}

impl From<&Competition> for UndercutPolicy {
    fn from(cfg: &Competition) -> Self {
        Self {
            step: cfg.undercut_step,
            decimals: cfg.price_decimals,
        }
    }
}

impl UndercutPolicy {
    /// `min_competitor - step`, rounded down to `decimals`, never below one
    /// minimal unit.
    pub fn suggest(&self, min_competitor: f64) -> f64 {
        let scale = 10f64.powi(self.decimals as i32);
        let unit = 1.0 / scale;
        // The epsilon keeps 89.0 * 100 from flooring to 8899.
        let rounded = ((min_competitor - self.step) * scale + 1e-6).floor() / scale;
        rounded.max(unit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitionResult {
    pub contract_id: i64,
    pub is_outbid: bool,
    pub suggested_price: Option<f64>,
    /// Cheapest eligible competitor; lowest contract id wins a price tie.
    pub competitor_contract_id: Option<i64>,
    pub competitor_price: Option<f64>,
}

impl CompetitionResult {
    fn uncontested(contract_id: i64) -> Self {
        Self {
            contract_id,
            is_outbid: false,
            suggested_price: None,
            competitor_contract_id: None,
            competitor_price: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    kind: ContractType,
    region_id: i64,
    signature: Vec<(i64, i64)>,
}

/// Sorted `(type_id, quantity)` pairs of included items, quantities of the
/// same type summed.
pub fn item_signature(items: &[ContractItem]) -> Vec<(i64, i64)> {
    let mut totals: HashMap<i64, i64> = HashMap::new();
    for item in items.iter().filter(|i| i.is_included) {
        *totals.entry(item.type_id).or_default() += item.quantity;
    }
    let mut signature: Vec<(i64, i64)> = totals.into_iter().collect();
    signature.sort_unstable();
    signature
}

fn group_key(contract: &ContractRecord) -> Option<GroupKey> {
    if !contract.is_outstanding() {
        return None;
    }
    let region_id = contract.region_id?;
    let signature = item_signature(&contract.items);
    if signature.is_empty() {
        return None;
    }
    Some(GroupKey {
        kind: contract.kind,
        region_id,
        signature,
    })
}

fn is_competitor(subject: &ContractRecord, other: &ContractRecord) -> bool {
    other.contract_id != subject.contract_id
        && other.issuer_id != subject.issuer_id
        && other.issuer_corporation_id != subject.issuer_corporation_id
}

#[derive(Debug, Clone, Default)]
pub struct ContractCompetitionAnalyzer {
    policy: UndercutPolicy,
}

impl ContractCompetitionAnalyzer {
    pub fn new(policy: UndercutPolicy) -> Self {
        Self { policy }
    }

    /// One result per input contract, in input order.
    pub fn analyze(&self, contracts: &[ContractRecord]) -> Vec<CompetitionResult> {
        let mut groups: HashMap<GroupKey, Vec<&ContractRecord>> = HashMap::new();
        let keys: Vec<Option<GroupKey>> = contracts.iter().map(group_key).collect();
        for (contract, key) in contracts.iter().zip(&keys) {
            if let Some(key) = key {
                groups.entry(key.clone()).or_default().push(contract);
            }
        }

        contracts
            .iter()
            .zip(&keys)
            .map(|(subject, key)| {
                let Some(members) = key.as_ref().and_then(|k| groups.get(k)) else {
                    return CompetitionResult::uncontested(subject.contract_id);
                };
                self.evaluate(subject, members)
            })
            .collect()
    }

    fn evaluate(&self, subject: &ContractRecord, members: &[&ContractRecord]) -> CompetitionResult {
        let cheapest = members
            .iter()
            .filter(|other| is_competitor(subject, other))
            .min_by(|a, b| {
                a.price()
                    .total_cmp(&b.price())
                    .then(a.contract_id.cmp(&b.contract_id))
            });
        let Some(cheapest) = cheapest else {
            return CompetitionResult::uncontested(subject.contract_id);
        };

        let is_outbid = cheapest.price() < subject.price();
        CompetitionResult {
            contract_id: subject.contract_id,
            is_outbid,
            suggested_price: is_outbid.then(|| self.policy.suggest(cheapest.price())),
            competitor_contract_id: Some(cheapest.contract_id),
            competitor_price: Some(cheapest.price()),
        }
    }
}
