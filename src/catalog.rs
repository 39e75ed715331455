//! Stream config catalog
//!
//! One default config for the run's region/operator plus the ordered fallback
//! list used by Stage 2. Province list files look like
//! `Region City udp/239.45.3.146:5140`, one file per operator.

use crate::logging::{debug_log, info_log};
use crate::models::StreamConfig;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Operators with a well known province list file, in fallback priority order
pub const KNOWN_OPERATORS: [&str; 3] = ["Telecom", "Unicom", "Mobile"];

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no province list found in {}", .0.display())]
    Empty(PathBuf),
    #[error("no stream config for region '{region}' operator '{operator}'")]
    NoDefault { region: String, operator: String },
}

/// Telecom > Unicom > Mobile > anything else
pub fn operator_rank(operator: &str) -> u8 {
    match operator.trim().to_ascii_lowercase().as_str() {
        "telecom" | "电信" => 3,
        "unicom" | "联通" => 2,
        "mobile" | "移动" => 1,
        _ => 0,
    }
}

/// `rtp://g:p` → `rtp/g:p`, `udp://g:p` → `udp/g:p`, leading '/' dropped
pub fn normalize_stream_address(raw: &str) -> String {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let converted = if lower.starts_with("rtp://") {
        format!("rtp/{}", &trimmed[6..])
    } else if lower.starts_with("udp://") {
        format!("udp/{}", &trimmed[6..])
    } else {
        trimmed.to_string()
    };
    converted.trim_start_matches('/').to_string()
}

/// Parse one `{operator}_province_list.txt`
///
/// Lines with fewer than three fields are skipped; the middle field (city)
/// is informational only.
pub fn parse_province_list(text: &str, operator: &str) -> Vec<StreamConfig> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                return None;
            }
            let stream = normalize_stream_address(parts[2]);
            if stream.is_empty() {
                return None;
            }
            Some(StreamConfig::new(operator, parts[0], stream))
        })
        .collect()
}

pub fn province_list_path(dir: &Path, operator: &str) -> PathBuf {
    dir.join(format!("{}_province_list.txt", operator))
}

#[derive(Debug, Clone)]
pub struct StreamCatalog {
    default: StreamConfig,
    fallbacks: Vec<StreamConfig>,
}

impl StreamCatalog {
    /// Build from an ordered catalog: the first entry matching region/operator
    /// is the default, everything else becomes a fallback.
    pub fn new(
        entries: Vec<StreamConfig>,
        region: &str,
        operator: &str,
    ) -> Result<Self, CatalogError> {
        let default_idx = entries
            .iter()
            .position(|c| c.matches(region, operator))
            .ok_or_else(|| CatalogError::NoDefault {
                region: region.to_string(),
                operator: operator.to_string(),
            })?;

        let mut entries = entries;
        let default = entries.remove(default_idx);
        let fallbacks = order_fallbacks(entries, &default, region);

        debug_log!(
            "默认配置 {} -> {}，备选 {} 个",
            default.label(),
            default.stream_address,
            fallbacks.len()
        );

        Ok(Self { default, fallbacks })
    }

    /// Read every known operator's province list under `dir`
    pub fn load_dir(dir: &Path, region: &str, operator: &str) -> Result<Self, CatalogError> {
        let mut operators: Vec<String> = vec![operator.trim().to_string()];
        for known in KNOWN_OPERATORS {
            if !known.eq_ignore_ascii_case(operator.trim()) {
                operators.push(known.to_string());
            }
        }

        let mut entries = Vec::new();
        let mut files = 0usize;
        for op in &operators {
            let path = province_list_path(dir, op);
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(&path).map_err(|source| CatalogError::Io {
                path: path.clone(),
                source,
            })?;
            let parsed = parse_province_list(&text, op);
            debug_log!("{}: {} 条配置", path.display(), parsed.len());
            entries.extend(parsed);
            files += 1;
        }

        if files == 0 {
            return Err(CatalogError::Empty(dir.to_path_buf()));
        }

        let catalog = Self::new(entries, region, operator)?;
        info_log!(
            "加载配置目录 {}: 默认 {} ({})，备选 {} 个",
            dir.display(),
            catalog.default.label(),
            catalog.default.stream_address,
            catalog.fallbacks.len()
        );
        Ok(catalog)
    }

    pub fn default_config(&self) -> &StreamConfig {
        &self.default
    }

    /// Fallbacks Stage 2 may try for one record; `0` means no bound
    pub fn stage2_configs(&self, max_attempts: usize) -> &[StreamConfig] {
        if max_attempts == 0 || max_attempts >= self.fallbacks.len() {
            &self.fallbacks
        } else {
            &self.fallbacks[..max_attempts]
        }
    }
}

/// Same region first, then other regions in first-seen order; within a
/// region by operator rank. Duplicate stream addresses are dropped.
fn order_fallbacks(
    entries: Vec<StreamConfig>,
    default: &StreamConfig,
    region: &str,
) -> Vec<StreamConfig> {
    let target_region = region.trim().to_lowercase();
    let mut region_order: HashMap<String, usize> = HashMap::new();
    region_order.insert(target_region, 0);
    for entry in &entries {
        let next = region_order.len();
        region_order
            .entry(entry.region_tag.trim().to_lowercase())
            .or_insert(next);
    }

    let mut keyed: Vec<(usize, u8, usize, StreamConfig)> = entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| {
            let region_idx = region_order
                .get(&entry.region_tag.trim().to_lowercase())
                .copied()
                .unwrap_or(usize::MAX);
            (region_idx, operator_rank(&entry.operator_tag), i, entry)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));

    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(default.stream_address.clone());
    keyed
        .into_iter()
        .map(|(_, _, _, entry)| entry)
        .filter(|entry| seen.insert(entry.stream_address.clone()))
        .collect()
}
