/// TrailWatch — Favorite Trailing Alerts
///
/// Co dělá:
///   1. Každých ~5 min stáhne nadcházející zápasy (tenis, basketbal, házená) + pre-match kurzy
///   2. Z kurzů určí favorita (jednou, nikdy se nepřepisuje)
///   3. Každých 30s polluje live stav běžících zápasů
///   4. Favorit prohrál 1. set / prohrává v poločase → premium Telegram alert (jednou na zápas)
///   5. Start zápasu → free Telegram notifikace
///
/// Stav (zápasy, odeslané notifikace) přežije restart přes SQLite.
///
/// Spuštění:
///   cargo run --bin trailwatch

mod config;
mod feed_db;
mod tracker;

use alert_dispatcher::{DeliveryAttempt, DeliveryLog, Dispatcher, RoutingConfig, SubscriptionRouter, TelegramSender};
use anyhow::Result;
use chrono::Utc;
use config::Config;
use dotenv::dotenv;
use feed_db::{load_state, open_db, spawn_db_writer, DbConfig, DbHeartbeatRow, DbJournal, DbMsg, SqliteSubscriptions};
use logger::{now_iso, CycleHeartbeatEvent, DeliveryEvent, EventLogger};
use match_registry::{MatchRegistry, SweepConfig};
use odds_feed::{B365Feed, FeedConfig, OddsFeed};
use sports_core::RetryPolicy;
use std::env;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use tracker::{Tracker, TrackerSettings};

/// Každé doručení → `notification_deliveries` + JSONL
struct DeliveryAudit {
    journal: Arc<DbJournal>,
    events:  Arc<EventLogger>,
}

impl DeliveryLog for DeliveryAudit {
    fn delivery(&self, attempt: &DeliveryAttempt) {
        self.journal.delivery(attempt);
        self.events.log_quiet(&DeliveryEvent {
            ts:       now_iso(),
            event:    "DELIVERY",
            match_id: attempt.match_id.clone(),
            rule:     attempt.rule.as_str().to_string(),
            target:   attempt.target.clone(),
            ok:       attempt.ok,
            error:    attempt.error.clone(),
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    info!("=== TrailWatch — favorite trailing alerts ===");

    // Single instance lock (dvě instance = dvojité alerty)
    let lock_file_path = env::temp_dir().join("trailwatch.lock");
    let lock_file = match File::create(&lock_file_path) {
        Ok(f) => f,
        Err(e) => {
            warn!("Failed to create lock file at {:?}: {}", lock_file_path, e);
            return Ok(());
        }
    };

    let mut lock = fd_lock::RwLock::new(lock_file);
    let _write_guard = match lock.try_write() {
        Ok(guard) => {
            info!("Acquired single-instance lock.");
            guard
        }
        Err(_) => {
            warn!("Another instance of trailwatch is already running! Exiting.");
            return Ok(());
        }
    };

    let cfg = Config::from_env()?;
    let sports: Vec<&str> = cfg.sports.iter().map(|s| s.as_str()).collect();
    info!("Sports: {}", sports.join(", "));
    info!(
        "Poll every {}s (budget {}s), discovery every {} cycles, DB {}, logs ./{}/",
        cfg.poll_interval_secs, cfg.cycle_budget_secs, cfg.discovery_every, cfg.db_path, cfg.log_dir
    );

    // ── Persistence ──
    let sweep = SweepConfig {
        never_live_after: chrono::Duration::minutes(cfg.never_live_grace_mins),
        stale_after:      chrono::Duration::minutes(cfg.stale_after_mins),
        retention:        chrono::Duration::hours(cfg.retention_hours),
        ..SweepConfig::default()
    };

    let (db_tx, db_handle) = spawn_db_writer(DbConfig { path: cfg.db_path.clone() });
    let journal = Arc::new(DbJournal::new(db_tx));
    let registry = Arc::new(MatchRegistry::new(journal.clone()));

    match open_db(Path::new(&cfg.db_path)).and_then(|conn| load_state(&conn, Utc::now(), sweep.archive_ttl)) {
        Ok((matches, records)) => {
            let n_records = records.len();
            let n = registry.rehydrate(matches, records, Utc::now()).await;
            info!("Restored {n} matches, {n_records} notification records");
        }
        Err(e) => warn!("State restore skipped, starting empty: {e:#}"),
    }

    // ── Feed + delivery ──
    let http_timeout = Duration::from_secs(cfg.http_timeout_secs);
    let mut feed_cfg = FeedConfig::new(cfg.api_token.clone());
    feed_cfg.base_url = cfg.feed_base_url.clone();
    feed_cfg.timeout = http_timeout;
    feed_cfg.retry = RetryPolicy::new(cfg.feed_retry_attempts, Duration::from_millis(500));
    feed_cfg.upcoming_limit = cfg.upcoming_limit;
    let feed: Arc<dyn OddsFeed> = Arc::new(B365Feed::new(feed_cfg)?);

    let sender = Arc::new(TelegramSender::new(cfg.telegram_bot_token.clone(), http_timeout)?);
    let router = SubscriptionRouter::new(RoutingConfig {
        premium_channel: cfg.premium_channel_id.clone(),
        free_channel:    cfg.free_channel_id.clone(),
        per_user:        cfg.per_user_delivery,
    });
    let subscriptions = Arc::new(SqliteSubscriptions::new(cfg.db_path.clone()));
    let events = Arc::new(EventLogger::new(cfg.log_dir.clone()));
    let audit = Arc::new(DeliveryAudit { journal: journal.clone(), events: events.clone() });
    let dispatcher = Arc::new(
        Dispatcher::new(registry.clone(), router, subscriptions, sender)
            .with_delivery_log(audit),
    );

    let tracker = Tracker::new(
        feed,
        registry.clone(),
        dispatcher,
        events.clone(),
        TrackerSettings {
            sports:           cfg.sports.clone(),
            discovery_every:  cfg.discovery_every,
            cycle_budget:     Duration::from_secs(cfg.cycle_budget_secs),
            start_lead:       chrono::Duration::minutes(cfg.start_lead_mins),
            max_missed_polls: cfg.max_missed_polls,
            sweep,
        },
    );

    info!("🚀 READY: starting tracking loop.");

    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.poll_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut cycle: u64 = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, finishing.");
                break;
            }
            _ = ticker.tick() => {}
        }

        cycle += 1;
        let report = tracker.run_cycle(cycle).await;
        let stats = registry.stats().await;
        let live = stats.live + stats.checkpoint_reached;
        let skipped = report.in_flight_skipped + report.timed_out;

        info!(
            "--- cycle {cycle}: polled {} ({} failed, {} skipped), alerts {}, {}ms ---",
            report.polled, report.failed, skipped, report.alerts, report.duration_ms
        );
        if report.duration_ms > cfg.poll_interval_secs * 1000 {
            warn!("cycle {cycle} took {}ms, longer than poll interval", report.duration_ms);
        }

        journal.send(DbMsg::Heartbeat(DbHeartbeatRow {
            ts:          Utc::now(),
            cycle:       cycle as i64,
            tracked:     stats.total as i64,
            live:        live as i64,
            polled:      report.polled as i64,
            skipped:     skipped as i64,
            alerts:      report.alerts as i64,
            duration_ms: report.duration_ms as i64,
        }));
        events.log_quiet(&CycleHeartbeatEvent {
            ts:          now_iso(),
            event:       "CYCLE_HEARTBEAT",
            cycle,
            tracked:     stats.total,
            live,
            polled:      report.polled,
            skipped,
            alerts:      report.alerts,
            duration_ms: report.duration_ms,
        });

        if cycle % u64::from(cfg.summary_every) == 0 {
            tracker.log_summary().await;
        }
    }

    // Writer skončí, až zmizí poslední Sender. Běžící poll tasky ho můžou chvíli držet.
    drop(tracker);
    drop(registry);
    drop(journal);
    match tokio::time::timeout(Duration::from_secs(10), tokio::task::spawn_blocking(move || db_handle.join())).await {
        Ok(_) => info!("DB writer flushed."),
        Err(_) => warn!("DB writer still busy after 10s, exiting anyway."),
    }

    Ok(())
}
