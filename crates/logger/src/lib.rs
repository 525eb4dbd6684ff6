/// TrailWatch — Logger
/// JSONL event stream (logs/YYYY-MM-DD.jsonl), jeden řádek = jedna událost

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

pub struct EventLogger {
    log_dir: PathBuf,
}

impl EventLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let dir = log_dir.into();
        fs::create_dir_all(&dir).ok();
        Self { log_dir: dir }
    }

    pub fn log<T: Serialize>(&self, event: &T) -> Result<()> {
        let date  = Utc::now().format("%Y-%m-%d").to_string();
        let path  = self.log_dir.join(format!("{date}.jsonl"));
        let line  = serde_json::to_string(event)?;
        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }

    /// Chyba zápisu logu nesmí shodit pipeline
    pub fn log_quiet<T: Serialize>(&self, event: &T) {
        if let Err(e) = self.log(event) {
            tracing::warn!("event log write failed: {e}");
        }
    }
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

// ── Event typy ────────────────────────────────────────────────────────────────

#[derive(Serialize, Debug)]
pub struct MatchTrackedEvent {
    pub ts:        String,
    pub event:     &'static str,   // "MATCH_TRACKED"
    pub match_id:  String,
    pub sport:     String,
    pub league:    String,
    pub home:      String,
    pub away:      String,
    pub starts_at: String,
    pub favorite:  Option<String>, // "home" | "away" | "unknown"
    pub fav_odds:  Option<f64>,
}

#[derive(Serialize, Debug)]
pub struct MatchStatusEvent {
    pub ts:       String,
    pub event:    &'static str,    // "MATCH_STATUS"
    pub match_id: String,
    pub from:     String,
    pub to:       String,
    pub reason:   Option<String>,
}

#[derive(Serialize, Debug)]
pub struct AlertFiredEvent {
    pub ts:        String,
    pub event:     &'static str,   // "ALERT_FIRED"
    pub match_id:  String,
    pub rule:      String,         // "match_start" | "favorite_trailing"
    pub surface:   String,         // "free" | "premium"
    pub sport:     String,
    pub detail:    String,
    pub delivered: usize,
    pub failed:    usize,
}

#[derive(Serialize, Debug)]
pub struct DeliveryEvent {
    pub ts:       String,
    pub event:    &'static str,    // "DELIVERY"
    pub match_id: String,
    pub rule:     String,
    pub target:   String,          // chat id kanálu / uživatele
    pub ok:       bool,
    pub error:    Option<String>,
}

#[derive(Serialize, Debug)]
pub struct FeedStatusEvent {
    pub ts:      String,
    pub event:   &'static str,     // "FEED_STATUS"
    pub sport:   String,
    pub stage:   String,           // "upcoming" | "live"
    pub ok:      bool,
    pub items:   usize,
    pub error:   Option<String>,
}

#[derive(Serialize, Debug)]
pub struct CycleHeartbeatEvent {
    pub ts:          String,
    pub event:       &'static str, // "CYCLE_HEARTBEAT"
    pub cycle:       u64,
    pub tracked:     usize,
    pub live:        usize,
    pub polled:      usize,
    pub skipped:     usize,
    pub alerts:      usize,
    pub duration_ms: u64,
}
