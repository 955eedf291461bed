//! Usage telemetry: token counts and cost per provider/model/feature.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::generation::request::TokenUsage;

/// USD per million tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPrice {
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn cost(&self, usage: TokenUsage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_million
            + usage.output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

/// Prices keyed by `(provider, model)`. Unknown models cost zero.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    prices: HashMap<(String, String), ModelPrice>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider_id: &str, model_id: &str, price: ModelPrice) {
        self.prices
            .insert((provider_id.to_string(), model_id.to_string()), price);
    }

    pub fn price(&self, provider_id: &str, model_id: &str) -> Option<ModelPrice> {
        self.prices
            .get(&(provider_id.to_string(), model_id.to_string()))
            .copied()
    }

    pub fn cost(&self, provider_id: &str, model_id: &str, usage: TokenUsage) -> f64 {
        self.price(provider_id, model_id)
            .map(|p| p.cost(usage))
            .unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

/// One recorded generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub provider_id: String,
    pub model_id: String,
    pub feature: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Sink for usage records.
pub trait UsageRecorder: Send + Sync {
    fn record(&self, record: UsageRecord);
}

/// Aggregated totals for one feature tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureTotals {
    pub calls: u64,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

/// In-memory usage recorder.
#[derive(Debug, Default)]
pub struct UsageLedger {
    records: Mutex<Vec<UsageRecord>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn totals_by_feature(&self) -> BTreeMap<String, FeatureTotals> {
        let mut totals: BTreeMap<String, FeatureTotals> = BTreeMap::new();
        for record in self.records() {
            let entry = totals.entry(record.feature.clone()).or_default();
            entry.calls += 1;
            entry.usage.add(record.usage);
            entry.cost_usd += record.cost_usd;
        }
        totals
    }

    pub fn total_cost(&self) -> f64 {
        self.records().iter().map(|r| r.cost_usd).sum()
    }
}

impl UsageRecorder for UsageLedger {
    fn record(&self, record: UsageRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}
