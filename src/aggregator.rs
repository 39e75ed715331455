//! Result aggregation and ranking

use crate::models::{RunSummary, ServiceRecord, SpeedResult, Stage};
use crate::optimizer::FinalizedResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which config produced a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub operator: String,
    pub region: String,
    pub stream_address: String,
    pub stage: Stage,
    /// Produced by the run's own default config
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedEntry {
    /// 1-based
    pub rank: usize,
    pub result: SpeedResult,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResult {
    pub entries: Vec<RankedEntry>,
    /// Every relay that passed validation, discovery order
    pub services: Vec<ServiceRecord>,
    pub summary: RunSummary,
}

impl RunResult {
    pub fn speeds(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.result.speed_mbps).collect()
    }
}

/// Rank finalized results.
///
/// Keeps the fastest successful result per relay address, drops anything under
/// `floor_mbps` (which also drops the no-signal placeholder at any sensible
/// floor), then sorts by speed descending. The sort is stable, so equal speeds
/// keep discovery order.
pub fn rank(results: &[FinalizedResult], floor_mbps: f64) -> Vec<RankedEntry> {
    let mut best: Vec<&FinalizedResult> = Vec::new();
    let mut by_address: HashMap<String, usize> = HashMap::new();

    for item in results.iter().filter(|r| r.result.success) {
        let address = item.result.service_record.address();
        match by_address.get(&address) {
            Some(&i) => {
                if item.result.speed_mbps > best[i].result.speed_mbps {
                    best[i] = item;
                }
            }
            None => {
                by_address.insert(address, best.len());
                best.push(item);
            }
        }
    }

    best.retain(|r| r.result.speed_mbps.is_finite() && r.result.speed_mbps >= floor_mbps);
    best.sort_by(|a, b| {
        b.result
            .speed_mbps
            .partial_cmp(&a.result.speed_mbps)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    best.into_iter()
        .enumerate()
        .map(|(i, item)| RankedEntry {
            rank: i + 1,
            provenance: Provenance {
                operator: item.result.config_used.operator_tag.clone(),
                region: item.result.config_used.region_tag.clone(),
                stream_address: item.result.config_used.stream_address.clone(),
                stage: item.stage,
                is_default: item.stage == Stage::Stage1,
            },
            result: item.result.clone(),
        })
        .collect()
}
