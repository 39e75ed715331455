//! Service validator
//!
//! Fetches the status page of every reachable candidate and decides whether it
//! is a udpxy relay. There is no discovery handshake, so identification is a
//! match against a fixed list of known response signatures. Active connection
//! count and bound address are scraped from the status table when present.

use crate::logging::{debug_log, info_log};
use crate::models::{AppConfig, Candidate, ServiceRecord};
use crate::pool::run_bounded;
use regex_lite::Regex;
use reqwest::{redirect, Client};
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Status pages are small; anything past this is ignored
pub const STATUS_READ_LIMIT: usize = 8 * 1024;

/// One known way a relay identifies itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    /// `Server:` header contains the marker
    ServerHeader(&'static str),
    /// Marker anywhere in status line, headers or body
    BodyMarker(&'static str),
    /// Every marker must be present
    AllOf(&'static [&'static str]),
    /// Product name plus one of its version tags
    VersionBanner {
        product: &'static str,
        versions: &'static [&'static str],
    },
}

/// Checked in order; the first hit wins. New relay builds get a new entry here.
pub const KNOWN_SIGNATURES: &[Signature] = &[
    Signature::ServerHeader("udpxy"),
    Signature::AllOf(&["udpxy", "unrecognized request"]),
    Signature::VersionBanner {
        product: "udpxy",
        versions: &["1.0-", "0.", "prod", "standard"],
    },
    Signature::AllOf(&["400", "unrecognized request", "server:"]),
    Signature::BodyMarker("udpxy status"),
    Signature::BodyMarker("udpxy"),
];

/// Lowercased view of one HTTP response
#[derive(Debug, Clone, Default)]
pub struct StatusPage {
    pub status: u16,
    pub server: String,
    pub body: String,
    haystack: String,
}

impl StatusPage {
    pub fn new(status: u16, server: Option<&str>, body: &str) -> Self {
        let server = server.unwrap_or_default().to_lowercase();
        let body = body.to_lowercase();
        let mut haystack = format!("http/1.1 {}\n", status);
        if !server.is_empty() {
            haystack.push_str(&format!("server: {}\n", server));
        }
        haystack.push_str(&body);

        Self {
            status,
            server,
            body,
            haystack,
        }
    }

    pub fn text(&self) -> &str {
        &self.haystack
    }
}

impl Signature {
    pub fn matches(&self, page: &StatusPage) -> bool {
        match self {
            Signature::ServerHeader(marker) => page.server.contains(marker),
            Signature::BodyMarker(marker) => page.text().contains(marker),
            Signature::AllOf(markers) => markers.iter().all(|m| page.text().contains(m)),
            Signature::VersionBanner { product, versions } => {
                page.text().contains(product) && versions.iter().any(|v| page.text().contains(v))
            }
        }
    }
}

/// First known signature the page matches
pub fn classify(page: &StatusPage) -> Option<&'static Signature> {
    KNOWN_SIGNATURES.iter().find(|sig| sig.matches(page))
}

fn status_table_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<table[^>]*cellspacing\s*=\s*["']?0["']?[^>]*>(.*?)(?:</table>|$)"#).ok()
    })
    .as_ref()
}

fn cell_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<td[^>]*>(.*?)</td>").ok())
        .as_ref()
}

fn tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").ok()).as_ref()
}

/// Scrape `(active_connections, bound_address)` from the udpxy status table
///
/// The third cell holds the bound address and the fourth the active client
/// count. Missing or malformed fields fall back to `(0, "")`.
pub fn extract_status(body: &str) -> (i64, String) {
    let (Some(table_re), Some(cell_re), Some(tag_re)) =
        (status_table_regex(), cell_regex(), tag_regex())
    else {
        return (0, String::new());
    };

    let Some(table) = table_re.captures(body).and_then(|c| c.get(1)) else {
        return (0, String::new());
    };

    let cells: Vec<String> = cell_re
        .captures_iter(table.as_str())
        .filter_map(|c| c.get(1))
        .map(|m| tag_re.replace_all(m.as_str(), "").trim().to_string())
        .collect();

    if cells.len() < 4 {
        return (0, String::new());
    }

    let active = cells[3].parse::<i64>().unwrap_or(0);
    (active, cells[2].clone())
}

#[derive(Clone)]
pub struct ServiceValidator {
    client: Client,
    timeout: Duration,
    concurrency: usize,
    status_path: String,
}

impl ServiceValidator {
    pub fn new(
        timeout: Duration,
        concurrency: usize,
        status_path: &str,
        user_agent: &str,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(user_agent)
            .no_proxy()
            .redirect(redirect::Policy::none())
            .pool_max_idle_per_host(0)
            .connect_timeout(timeout)
            .build()?;

        let status_path = if status_path.starts_with('/') {
            status_path.to_string()
        } else {
            format!("/{}", status_path)
        };

        Ok(Self {
            client,
            timeout,
            concurrency: concurrency.max(1),
            status_path,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, reqwest::Error> {
        Self::new(
            config.validate_timeout(),
            config.validate_concurrency,
            &config.status_path,
            &config.user_agent,
        )
    }

    /// One record per input candidate, in input order
    pub async fn validate_all(
        &self,
        candidates: Vec<Candidate>,
        cancel: &CancellationToken,
    ) -> Vec<ServiceRecord> {
        info_log!("服务识别: {} 个可达地址", candidates.len());

        let slots = run_bounded(
            "validate",
            candidates.clone(),
            self.concurrency,
            cancel,
            |c| {
                let validator = self.clone();
                async move { validator.validate(c).await }
            },
        )
        .await;

        let records: Vec<ServiceRecord> = slots
            .into_iter()
            .zip(candidates)
            .map(|(slot, candidate)| slot.unwrap_or_else(|| ServiceRecord::mismatch(candidate)))
            .collect();

        let matched = records.iter().filter(|r| r.is_target_service).count();
        info_log!("服务识别完成: {}/{} 为 udpxy", matched, records.len());
        records
    }

    pub async fn validate(&self, candidate: Candidate) -> ServiceRecord {
        let page = match self.fetch_status(&candidate).await {
            Ok(page) => page,
            Err(e) => {
                debug_log!("  {} 状态页请求失败: {}", candidate, e);
                return ServiceRecord::mismatch(candidate);
            }
        };

        match classify(&page) {
            Some(sig) => {
                let (active, bound) = extract_status(&page.body);
                debug_log!(
                    "  {} 识别为 udpxy ({:?})，活跃连接 {}，地址 {:?}",
                    candidate,
                    sig,
                    active,
                    bound
                );
                ServiceRecord::matched(candidate, active, bound)
            }
            None => {
                debug_log!("  {} 非 udpxy 服务 (HTTP {})", candidate, page.status);
                ServiceRecord::mismatch(candidate)
            }
        }
    }

    fn status_url(&self, candidate: &Candidate) -> Result<Url, String> {
        Url::parse(&format!("http://{}{}", candidate.address(), self.status_path))
            .map_err(|e| format!("URL: {}", e))
    }

    /// Non-2xx responses are kept: a 400 page can still carry the relay banner.
    /// One deadline covers headers and body; a body cut short by the deadline
    /// is classified as far as it got.
    async fn fetch_status(&self, candidate: &Candidate) -> Result<StatusPage, String> {
        let url = self.status_url(candidate)?;
        let deadline = tokio::time::Instant::now() + self.timeout;
        let send = self.client.get(url).send();
        let mut resp = match tokio::time::timeout_at(deadline, send).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(format!("HTTP: {}", e)),
            Err(_) => return Err("timeout".to_string()),
        };

        let status = resp.status().as_u16();
        let server = resp
            .headers()
            .get(reqwest::header::SERVER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body: Vec<u8> = Vec::new();
        while body.len() < STATUS_READ_LIMIT {
            match tokio::time::timeout_at(deadline, resp.chunk()).await {
                Ok(Ok(Some(chunk))) => body.extend_from_slice(&chunk),
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    if body.is_empty() && server.is_none() {
                        return Err(format!("Read: {}", e));
                    }
                    break;
                }
                Err(_) => {
                    debug_log!("  {} 状态页读取超时，已收到 {} 字节", candidate, body.len());
                    break;
                }
            }
        }
        body.truncate(STATUS_READ_LIMIT);

        Ok(StatusPage::new(
            status,
            server.as_deref(),
            &String::from_utf8_lossy(&body),
        ))
    }
}
