//! Candidate normalization and deduplication
//!
//! Turns raw inventory tokens into a unique, first-seen ordered candidate list.
//! Exact `(host, port)` duplicates merge their source tags. Collapsing of
//! candidates that share an IPv4 /24 and a port is a policy switch and is off
//! unless explicitly enabled, since it can discard a working endpoint in favour
//! of a dead one that happened to be listed first.

use crate::logging::{debug_log, warn_log};
use crate::models::Candidate;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("invalid address format: {0}")]
    InvalidAddressFormat(String),
}

/// A token as delivered by an inventory source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCandidate {
    pub token: String,
    pub source: String,
}

impl RawCandidate {
    pub fn new(token: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupPolicy {
    /// Keep only the first candidate per (IPv4 /24, port)
    pub collapse_subnets: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub candidates: Vec<Candidate>,
    pub rejected: Vec<NormalizeError>,
    /// Candidates dropped by subnet collapsing
    pub collapsed: usize,
}

fn invalid(token: &str) -> NormalizeError {
    NormalizeError::InvalidAddressFormat(token.to_string())
}

fn parse_port(raw: &str, token: &str) -> Result<u16, NormalizeError> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid(token)),
        Ok(port) => Ok(port),
    }
}

/// Hostname rules: alphanumeric, '-', '.', '_'; dotted-numeric must be a real IPv4
fn validate_host(host: &str, token: &str) -> Result<String, NormalizeError> {
    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    {
        return Err(invalid(token));
    }
    if host.chars().all(|c| c.is_ascii_digit() || c == '.') && host.parse::<Ipv4Addr>().is_err() {
        return Err(invalid(token));
    }
    Ok(host.to_ascii_lowercase())
}

/// Parse one token into `(host, port)`
///
/// Accepted: `host:port`, `[v6]:port`, `http://host:port/any/path`, `a.b.c.d_port`.
pub fn parse_endpoint(token: &str) -> Result<(String, u16), NormalizeError> {
    let trimmed = token.trim();
    let lower = trimmed.to_ascii_lowercase();
    let without_scheme = if lower.starts_with("http://") {
        &trimmed[7..]
    } else if lower.starts_with("https://") {
        &trimmed[8..]
    } else {
        trimmed
    };
    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();

    if authority.is_empty() {
        return Err(invalid(token));
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(|| invalid(token))?;
        let v6: Ipv6Addr = host.parse().map_err(|_| invalid(token))?;
        let port = after.strip_prefix(':').ok_or_else(|| invalid(token))?;
        return Ok((v6.to_string(), parse_port(port, token)?));
    }

    if let Some((host, port)) = authority.rsplit_once(':') {
        if host.contains(':') {
            // bare IPv6 without brackets is ambiguous
            return Err(invalid(token));
        }
        return Ok((validate_host(host, token)?, parse_port(port, token)?));
    }

    // search-result export form: 1.2.3.4_8080
    if let Some((host, port)) = authority.rsplit_once('_') {
        if let Ok(v4) = host.parse::<Ipv4Addr>() {
            return Ok((v4.to_string(), parse_port(port, token)?));
        }
    }

    Err(invalid(token))
}

fn normalize_entries<I>(entries: I, policy: DedupPolicy) -> Normalized
where
    I: IntoIterator<Item = (String, Vec<String>)>,
{
    let mut out = Normalized::default();
    let mut index: HashMap<(String, u16), usize> = HashMap::new();
    let mut subnets: HashSet<([u8; 3], u16)> = HashSet::new();

    for (token, tags) in entries {
        let (host, port) = match parse_endpoint(&token) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn_log!("丢弃无法解析的地址: {:?}", token);
                out.rejected.push(e);
                continue;
            }
        };

        let tags = tags.into_iter().filter(|t| !t.is_empty());

        if let Some(&i) = index.get(&(host.clone(), port)) {
            out.candidates[i].source_tags.extend(tags);
            continue;
        }

        if policy.collapse_subnets {
            if let Ok(v4) = host.parse::<Ipv4Addr>() {
                let o = v4.octets();
                if !subnets.insert(([o[0], o[1], o[2]], port)) {
                    debug_log!("同网段同端口合并，丢弃 {}:{}", host, port);
                    out.collapsed += 1;
                    continue;
                }
            }
        }

        index.insert((host.clone(), port), out.candidates.len());
        out.candidates.push(Candidate {
            host,
            port,
            source_tags: tags.collect::<BTreeSet<_>>(),
        });
    }

    out
}

/// Deduplicate raw inventory tokens
pub fn normalize<I>(raw: I, policy: DedupPolicy) -> Normalized
where
    I: IntoIterator<Item = RawCandidate>,
{
    normalize_entries(raw.into_iter().map(|r| (r.token, vec![r.source])), policy)
}

/// Run already-built candidates through the same rules
pub fn renormalize(candidates: &[Candidate], policy: DedupPolicy) -> Normalized {
    normalize_entries(
        candidates
            .iter()
            .map(|c| (c.address(), c.source_tags.iter().cloned().collect())),
        policy,
    )
}

/// Split inventory text into tokens: whitespace/comma separated, `#` starts a comment
pub fn parse_candidate_text(text: &str, source: &str) -> Vec<RawCandidate> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .flat_map(|line| line.split([',', ' ', '\t', ';']))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| RawCandidate::new(t, source))
        .collect()
}

pub fn read_candidate_file(path: &Path, source: &str) -> std::io::Result<Vec<RawCandidate>> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_candidate_text(&text, source))
}
