//! Konfigurace z env (+ .env přes dotenv v main)

use anyhow::{bail, Context, Result};
use sports_core::Sport;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    /// B365 relay token (API_TOKEN)
    pub api_token:            String,
    pub feed_base_url:        String,
    pub telegram_bot_token:   String,
    pub premium_channel_id:   Option<String>,
    pub free_channel_id:      Option<String>,
    /// Posílat i do soukromých chatů předplatitelů (PER_USER_DELIVERY)
    pub per_user_delivery:    bool,
    pub db_path:              String,
    pub log_dir:              String,
    pub sports:               Vec<Sport>,
    pub poll_interval_secs:   u64,
    /// Discovery každých N live cyklů (10 × 30s = 5 min)
    pub discovery_every:      u32,
    pub summary_every:        u32,
    pub cycle_budget_secs:    u64,
    pub http_timeout_secs:    u64,
    pub feed_retry_attempts:  u32,
    pub upcoming_limit:       usize,
    pub start_lead_mins:      i64,
    pub never_live_grace_mins: i64,
    pub stale_after_mins:     i64,
    pub retention_hours:      i64,
    pub max_missed_polls:     u32,
}

fn var_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn required(key: &str) -> Result<String> {
    optional(key).with_context(|| format!("{key} is not set"))
}

fn flag(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// "tennis,basketball" → [Tennis, Basketball]. Prázdné = všechny sporty.
pub fn parse_sports(raw: &str) -> Result<Vec<Sport>> {
    let mut sports = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let sport: Sport = part.parse().with_context(|| format!("MONITORED_SPORTS: '{part}'"))?;
        if !sports.contains(&sport) {
            sports.push(sport);
        }
    }
    if sports.is_empty() {
        sports = Sport::ALL.to_vec();
    }
    Ok(sports)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let cfg = Self {
            api_token:             required("API_TOKEN")?,
            feed_base_url:         optional("FEED_BASE_URL").unwrap_or_else(|| odds_feed::DEFAULT_BASE_URL.to_string()),
            telegram_bot_token:    required("TELEGRAM_BOT_TOKEN")?,
            premium_channel_id:    optional("PREMIUM_CHANNEL_ID"),
            free_channel_id:       optional("FREE_CHANNEL_ID"),
            per_user_delivery:     flag("PER_USER_DELIVERY"),
            db_path:               optional("TRAILWATCH_DB_PATH").unwrap_or_else(|| "data/trailwatch.db".to_string()),
            log_dir:               optional("LOG_DIR").unwrap_or_else(|| "logs".to_string()),
            sports:                parse_sports(&env::var("MONITORED_SPORTS").unwrap_or_default())?,
            poll_interval_secs:    var_or("POLL_INTERVAL_SECS", 30),
            discovery_every:       var_or("DISCOVERY_EVERY_CYCLES", 10),
            summary_every:         var_or("SUMMARY_EVERY_CYCLES", 10),
            cycle_budget_secs:     var_or("CYCLE_BUDGET_SECS", 25),
            http_timeout_secs:     var_or("HTTP_TIMEOUT_SECS", 10),
            feed_retry_attempts:   var_or("FEED_RETRY_ATTEMPTS", 3),
            upcoming_limit:        var_or("UPCOMING_LIMIT", 20),
            start_lead_mins:       var_or("START_LEAD_MINS", 5),
            never_live_grace_mins: var_or("NEVER_LIVE_GRACE_MINS", 180),
            stale_after_mins:      var_or("STALE_AFTER_MINS", 360),
            retention_hours:       var_or("RETENTION_HOURS", 24),
            max_missed_polls:      var_or("MAX_MISSED_POLLS", 3),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 || self.discovery_every == 0 || self.summary_every == 0 {
            bail!("POLL_INTERVAL_SECS, DISCOVERY_EVERY_CYCLES and SUMMARY_EVERY_CYCLES must be > 0");
        }
        if self.cycle_budget_secs == 0 || self.cycle_budget_secs > self.poll_interval_secs {
            bail!("CYCLE_BUDGET_SECS must be in 1..=POLL_INTERVAL_SECS");
        }
        if self.premium_channel_id.is_none() && self.free_channel_id.is_none() && !self.per_user_delivery {
            bail!("no delivery target: set PREMIUM_CHANNEL_ID / FREE_CHANNEL_ID or PER_USER_DELIVERY=1");
        }
        if self.max_missed_polls == 0 {
            bail!("MAX_MISSED_POLLS must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sports_default_to_all_and_dedupe() {
        assert_eq!(parse_sports("").unwrap(), Sport::ALL.to_vec());
        assert_eq!(parse_sports(" Tennis, handball ,tennis").unwrap(), vec![Sport::Tennis, Sport::Handball]);
        assert!(parse_sports("tennis,curling").is_err());
    }

    #[test]
    fn validation_catches_bad_budget_and_missing_targets() {
        let mut cfg = Config {
            api_token:             "t".into(),
            feed_base_url:         "http://localhost".into(),
            telegram_bot_token:    "b".into(),
            premium_channel_id:    Some("@p".into()),
            free_channel_id:       None,
            per_user_delivery:     false,
            db_path:               "x.db".into(),
            log_dir:               "logs".into(),
            sports:                Sport::ALL.to_vec(),
            poll_interval_secs:    30,
            discovery_every:       10,
            summary_every:         10,
            cycle_budget_secs:     25,
            http_timeout_secs:     10,
            feed_retry_attempts:   3,
            upcoming_limit:        20,
            start_lead_mins:       5,
            never_live_grace_mins: 180,
            stale_after_mins:      360,
            retention_hours:       24,
            max_missed_polls:      3,
        };
        assert!(cfg.validate().is_ok());

        cfg.cycle_budget_secs = 40;
        assert!(cfg.validate().is_err());
        cfg.cycle_budget_secs = 25;

        cfg.premium_channel_id = None;
        assert!(cfg.validate().is_err());
        cfg.per_user_delivery = true;
        assert!(cfg.validate().is_ok());
    }
}
