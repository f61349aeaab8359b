//! Outbid alerts. Delivery transports live outside this crate; the default
//! notifier writes alerts to the log.

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::model::SourceId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutbidAlert {
    pub contract_id: i64,
    pub title: String,
    pub price: f64,
    pub competitor_contract_id: i64,
    pub competitor_price: f64,
    pub suggested_price: f64,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn outbid(&self, source: SourceId, alerts: &[OutbidAlert]) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn outbid(&self, source: SourceId, alerts: &[OutbidAlert]) -> anyhow::Result<()> {
        for alert in alerts {
            warn!(
                %source,
                contract_id = alert.contract_id,
                title = %alert.title,
                price = alert.price,
                competitor = alert.competitor_contract_id,
                competitor_price = alert.competitor_price,
                suggested = alert.suggested_price,
                "contract outbid"
            );
        }
        Ok(())
    }
}
