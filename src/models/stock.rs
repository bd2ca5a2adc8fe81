use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single correcting movement sent to the inventory store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjustment {
    pub canonical_name: String,
    /// Units to add back; always positive.
    pub quantity: i64,
    pub checkout_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentError {
    pub canonical_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockProcessingReport {
    pub checkout_id: i64,
    pub added_back: BTreeMap<String, i64>,
    pub tracked_used: BTreeMap<String, i64>,
    pub errors: Vec<AdjustmentError>,
}
