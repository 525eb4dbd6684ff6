/// TrailWatch — Odds Feed Client
///
/// B365 relay API (token v query):
///   A) /v1/bet365/upcoming  — discovery zápasů na dnešek + zítřek
///   B) /v3/bet365/prematch  — pre-match moneyline (favorit)
///   C) /v1/event/view       — live skóre, timer, stav
///
/// Přechodné chyby (timeout, 5xx, 429, rozbitý JSON) → retry s backoffem,
/// po vyčerpání pokusů se zápas/sport v tomhle cyklu přeskočí.

pub mod parse;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use sports_core::{MatchSeed, MoneylineOdds, OddsSnapshot, RetryPolicy, Sport};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.b365api.com";

// prematch dotazy paralelně, ale ne víc než tolik najednou
const PREMATCH_CONCURRENCY: usize = 4;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FeedError {
    #[error("transient feed error: {0}")]
    Transient(String),
    #[error("feed rejected request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed data for match {match_id}: {reason}")]
    Malformed { match_id: String, reason: String },
}

impl FeedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FeedError::Transient(_))
    }
}

/// Výsledek discovery pro jeden sport
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpcomingBatch {
    pub seeds:     Vec<MatchSeed>,
    /// (match_id, důvod), registry je označí jako abandoned
    pub malformed: Vec<(String, String)>,
    /// Zápasy, kde prematch dotaz přechodně selhal, zkusí se příští cyklus
    pub skipped:   usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveFetch {
    Snapshot(OddsSnapshot),
    /// Feed zápas nezná (404 / prázdné results)
    NotFound,
}

#[async_trait]
pub trait OddsFeed: Send + Sync {
    async fn fetch_upcoming(&self, sport: Sport) -> Result<UpcomingBatch, FeedError>;
    async fn fetch_live(&self, match_id: &str, sport: Sport) -> Result<LiveFetch, FeedError>;
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub base_url:       String,
    pub token:          String,
    pub timeout:        Duration,
    pub retry:          RetryPolicy,
    /// Max zápasů na sport a cyklus discovery
    pub upcoming_limit: usize,
    /// 1 = jen dnešek, 2 = dnešek + zítřek
    pub lookahead_days: u32,
}

impl FeedConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            base_url:       DEFAULT_BASE_URL.to_string(),
            token:          token.into(),
            timeout:        Duration::from_secs(10),
            retry:          RetryPolicy::default(),
            upcoming_limit: 20,
            lookahead_days: 2,
        }
    }
}

// ── B365 envelope ───────────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct Envelope {
    #[serde(default)]
    success: Option<Value>,
    #[serde(default)]
    error:   Option<String>,
    #[serde(default)]
    results: Option<Value>,
}

fn snippet(raw: &str) -> String {
    raw.chars().take(200).collect()
}

pub struct B365Feed {
    client: reqwest::Client,
    cfg:    FeedConfig,
}

impl B365Feed {
    pub fn new(cfg: FeedConfig) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| FeedError::Transient(format!("http client build failed: {e}")))?;
        Ok(Self { client, cfg })
    }

    /// GET + retry. `Ok(None)` = 404 nebo prázdné results.
    async fn get_results(&self, path: &str, params: Vec<(&'static str, String)>) -> Result<Option<Value>, FeedError> {
        let url = format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path);
        self.cfg
            .retry
            .run(path, || self.get_results_once(&url, &params), FeedError::is_transient)
            .await
    }

    async fn get_results_once(&self, url: &str, params: &[(&'static str, String)]) -> Result<Option<Value>, FeedError> {
        let resp = self
            .client
            .get(url)
            .query(&[("token", self.cfg.token.as_str())])
            .query(params)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| FeedError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let raw = resp
            .text()
            .await
            .map_err(|e| FeedError::Transient(format!("body read failed: {e}")))?;

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FeedError::Transient(format!("HTTP {status}: {}", snippet(&raw))));
        }
        if !status.is_success() {
            return Err(FeedError::Rejected { status: status.as_u16(), body: snippet(&raw) });
        }

        let env: Envelope = serde_json::from_str(&raw)
            .map_err(|e| FeedError::Transient(format!("JSON parse failed: {e} | {}", snippet(&raw))))?;

        // B365 hlásí chyby jako 200 + success: 0
        let ok = env.success.as_ref().map_or(true, |s| {
            matches!(s, Value::Bool(true)) || s.as_u64() == Some(1) || s.as_str() == Some("1")
        });
        if !ok {
            let msg = env.error.unwrap_or_else(|| "unknown error".to_string());
            if msg.to_uppercase().contains("TOO_MANY") {
                return Err(FeedError::Transient(msg));
            }
            return Err(FeedError::Rejected { status: status.as_u16(), body: msg });
        }

        match env.results {
            Some(Value::Array(a)) if a.is_empty() => Ok(None),
            Some(Value::Null) | None => Err(FeedError::Transient(format!("response without results: {}", snippet(&raw)))),
            Some(results) => Ok(Some(results)),
        }
    }

    async fn fetch_prematch(&self, match_id: &str, sport: Sport) -> Result<Option<MoneylineOdds>, FeedError> {
        let results = self
            .get_results("/v3/bet365/prematch", vec![("FI", match_id.to_string())])
            .await?;
        match results {
            None => Ok(None),
            Some(r) => parse::parse_prematch_odds(sport, &r).map_err(|reason| FeedError::Malformed {
                match_id: match_id.to_string(),
                reason,
            }),
        }
    }
}

#[async_trait]
impl OddsFeed for B365Feed {
    async fn fetch_upcoming(&self, sport: Sport) -> Result<UpcomingBatch, FeedError> {
        let mut batch = UpcomingBatch::default();
        let mut events = Vec::new();
        let today = Utc::now().date_naive();

        let mut failed_days = 0;
        let mut last_err = None;

        for offset in 0..self.cfg.lookahead_days.max(1) {
            let day = (today + chrono::Duration::days(i64::from(offset))).format("%Y%m%d").to_string();
            let results = match self
                .get_results(
                    "/v1/bet365/upcoming",
                    vec![("sport_id", sport.feed_id().to_string()), ("day", day.clone())],
                )
                .await
            {
                Ok(results) => results,
                Err(e) => {
                    warn!("{sport}: upcoming for {day} failed, keeping other days: {e}");
                    failed_days += 1;
                    last_err = Some(e);
                    continue;
                }
            };
            let Some(results) = results else { continue };

            for item in parse::parse_upcoming(&results) {
                match item {
                    Ok(ev) => events.push(ev),
                    Err((id, reason)) => {
                        warn!("{sport}: malformed upcoming {id}: {reason}");
                        batch.malformed.push((id, reason));
                    }
                }
            }
        }

        // všechny dny selhaly → chyba pro celý sport, discovery se zkusí příště
        if failed_days == self.cfg.lookahead_days.max(1) {
            if let Some(e) = last_err {
                return Err(e);
            }
        }

        let mut seen = HashSet::new();
        events.retain(|e| seen.insert(e.id.clone()));
        events.sort_by_key(|e| e.scheduled_start);
        events.truncate(self.cfg.upcoming_limit);

        let with_odds: Vec<_> = stream::iter(events)
            .map(|ev| async move {
                let odds = self.fetch_prematch(&ev.id, sport).await;
                (ev, odds)
            })
            .buffer_unordered(PREMATCH_CONCURRENCY)
            .collect()
            .await;

        for (ev, odds) in with_odds {
            match odds {
                Ok(odds) => batch.seeds.push(ev.into_seed(sport, odds)),
                Err(FeedError::Malformed { match_id, reason }) => {
                    warn!("{sport}: malformed prematch {match_id}: {reason}");
                    batch.malformed.push((match_id, reason));
                }
                Err(e) => {
                    debug!("{sport}: prematch {} skipped: {e}", ev.id);
                    batch.skipped += 1;
                }
            }
        }

        info!(
            "{sport}: {} upcoming ({} malformed, {} skipped)",
            batch.seeds.len(), batch.malformed.len(), batch.skipped
        );
        Ok(batch)
    }

    async fn fetch_live(&self, match_id: &str, sport: Sport) -> Result<LiveFetch, FeedError> {
        let results = self
            .get_results("/v1/event/view", vec![("event_id", match_id.to_string())])
            .await?;
        let Some(results) = results else {
            return Ok(LiveFetch::NotFound);
        };

        match parse::parse_event_view(sport, &results, Utc::now()) {
            Ok(Some(snapshot)) => Ok(LiveFetch::Snapshot(snapshot)),
            Ok(None) => Ok(LiveFetch::NotFound),
            Err(reason) => Err(FeedError::Malformed { match_id: match_id.to_string(), reason }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retried() {
        assert!(FeedError::Transient("timeout".into()).is_transient());
        assert!(!FeedError::Rejected { status: 401, body: "bad token".into() }.is_transient());
        assert!(!FeedError::Malformed { match_id: "1".into(), reason: "x".into() }.is_transient());
    }

    #[test]
    fn envelope_tolerates_missing_fields() {
        let env: Envelope = serde_json::from_str(r#"{"success":1,"results":[{"id":"1"}]}"#).unwrap();
        assert!(env.error.is_none());
        assert!(env.results.unwrap().is_array());

        let env: Envelope = serde_json::from_str(r#"{"success":0,"error":"PERMISSION_DENIED"}"#).unwrap();
        assert_eq!(env.error.as_deref(), Some("PERMISSION_DENIED"));
    }

    #[test]
    fn snippet_is_char_safe() {
        let raw = "č".repeat(300);
        assert_eq!(snippet(&raw).chars().count(), 200);
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let mut cfg = FeedConfig::new("t");
        cfg.base_url = "http://127.0.0.1:9".to_string();
        cfg.timeout = Duration::from_millis(200);
        cfg.retry = RetryPolicy::new(2, Duration::from_millis(1));
        let feed = B365Feed::new(cfg).unwrap();
        let err = feed.fetch_live("1", Sport::Tennis).await.unwrap_err();
        assert!(err.is_transient());
    }

    const UPCOMING_DAY_ONE: &str = r#"{"success":1,"results":[{"id":"101","time":"1893456000","home":{"name":"Kiel"},"away":{"name":"Veszprem"},"league":{"name":"EHF CL"}}]}"#;

    /// Lokální HTTP stub: upcoming pro `ok_day` odpoví zápasem, ostatní dny 503,
    /// prematch vždy prázdné results.
    async fn stub_feed(ok_day: Option<String>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let ok_day = ok_day.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut n = 0;
                    while n < buf.len() {
                        let read = sock.read(&mut buf[n..]).await.unwrap_or(0);
                        if read == 0 {
                            break;
                        }
                        n += read;
                        if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let head = String::from_utf8_lossy(&buf[..n]).to_string();
                    let line = head.lines().next().unwrap_or_default().to_string();
                    let (status, body) = if line.contains("/v1/bet365/upcoming") {
                        match &ok_day {
                            Some(day) if line.contains(&format!("day={day}")) => ("200 OK", UPCOMING_DAY_ONE),
                            _ => ("503 Service Unavailable", "{}"),
                        }
                    } else {
                        ("200 OK", r#"{"success":1,"results":[]}"#)
                    };
                    let resp = format!(
                        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    fn stub_config(base_url: String) -> FeedConfig {
        let mut cfg = FeedConfig::new("t");
        cfg.base_url = base_url;
        cfg.timeout = Duration::from_secs(2);
        cfg.retry = RetryPolicy::new(1, Duration::from_millis(1));
        cfg
    }

    #[tokio::test]
    async fn failed_second_day_keeps_first_day_events() {
        let today = Utc::now().date_naive().format("%Y%m%d").to_string();
        let feed = B365Feed::new(stub_config(stub_feed(Some(today)).await)).unwrap();

        let batch = feed.fetch_upcoming(Sport::Handball).await.unwrap();
        assert_eq!(batch.seeds.len(), 1);
        assert_eq!(batch.seeds[0].id, "101");
        assert_eq!(batch.seeds[0].home, "Kiel");
        assert!(batch.seeds[0].odds.is_none());
    }

    #[tokio::test]
    async fn all_days_failing_is_a_transient_error() {
        let feed = B365Feed::new(stub_config(stub_feed(None).await)).unwrap();
        let err = feed.fetch_upcoming(Sport::Handball).await.unwrap_err();
        assert!(err.is_transient());
    }
}
