//! SQLite persistence: writer thread (mpsc → rusqlite), načtení stavu po restartu,
//! čtení předplatných. Zápisy nikdy nezastaví pipeline.

use alert_dispatcher::{DeliveryAttempt, DeliveryLog, SourceError, Subscription, SubscriptionSource, Tier};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use match_registry::{Journal, Match};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use sports_core::{Favorite, MoneylineOdds, NotificationRecord, OddsSnapshot, Side, Sport};
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct DbMatchRow {
    pub ts:              DateTime<Utc>,
    pub match_id:        String,
    pub sport:           String,
    pub league:          String,
    pub home:            String,
    pub away:            String,
    pub scheduled_start: DateTime<Utc>,
    pub status:          String,
    pub pre_home:        Option<f64>,
    pub pre_away:        Option<f64>,
    pub pre_draw:        Option<f64>,
    pub favorite:        Option<String>,
    pub first_seen:      DateTime<Utc>,
    pub last_seen:       DateTime<Utc>,
    pub closed_at:       Option<DateTime<Utc>>,
    pub adopted_live:    bool,
}

impl DbMatchRow {
    pub fn from_match(m: &Match) -> Self {
        Self {
            ts:              Utc::now(),
            match_id:        m.id.clone(),
            sport:           m.sport.as_str().to_string(),
            league:          m.league.clone(),
            home:            m.home.clone(),
            away:            m.away.clone(),
            scheduled_start: m.scheduled_start,
            status:          m.status.as_str().to_string(),
            pre_home:        m.pre_match_odds.map(|o| o.home),
            pre_away:        m.pre_match_odds.map(|o| o.away),
            pre_draw:        m.pre_match_odds.and_then(|o| o.draw),
            favorite:        m.favorite.map(|f| f.as_str().to_string()),
            first_seen:      m.first_seen,
            last_seen:       m.last_seen,
            closed_at:       m.closed_at,
            adopted_live:    m.adopted_live,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbSnapshotRow {
    pub match_id:     String,
    pub fetched_at:   DateTime<Utc>,
    pub phase:        String,
    pub score_home:   i64,
    pub score_away:   i64,
    pub period:       i64,
    pub in_break:     bool,
    pub payload_json: String,
}

#[derive(Debug, Clone)]
pub struct DbHeartbeatRow {
    pub ts:          DateTime<Utc>,
    pub cycle:       i64,
    pub tracked:     i64,
    pub live:        i64,
    pub polled:      i64,
    pub skipped:     i64,
    pub alerts:      i64,
    pub duration_ms: i64,
}

#[derive(Debug)]
pub enum DbMsg {
    MatchUpsert(DbMatchRow),
    Snapshot(DbSnapshotRow),
    Notification(NotificationRecord),
    Delivery(DeliveryAttempt),
    Evict(String),
    Heartbeat(DbHeartbeatRow),
}

pub fn spawn_db_writer(cfg: DbConfig) -> (mpsc::Sender<DbMsg>, std::thread::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<DbMsg>(10_000);

    let handle = std::thread::spawn(move || {
        let result: Result<()> = (|| {
            let conn = open_db(Path::new(&cfg.path))?;

            while let Some(msg) = rx.blocking_recv() {
                if let Err(e) = apply_msg(&conn, msg) {
                    // DB nesmí shodit tracking
                    warn!("[trailwatch-db] write failed: {e}");
                }
            }

            Ok(())
        })();

        if let Err(e) = result {
            warn!("[trailwatch-db] fatal: {e:#}");
        }
    });

    (tx, handle)
}

pub fn open_db(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let conn = Connection::open(db_path).context("open sqlite db")?;
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS matches (
            match_id TEXT PRIMARY KEY,
            ts TEXT NOT NULL,
            sport TEXT NOT NULL,
            league TEXT NOT NULL,
            home TEXT NOT NULL,
            away TEXT NOT NULL,
            scheduled_start TEXT NOT NULL,
            status TEXT NOT NULL,
            pre_home REAL,
            pre_away REAL,
            pre_draw REAL,
            favorite TEXT,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            closed_at TEXT,
            adopted_live INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_matches_status ON matches(status);

        CREATE TABLE IF NOT EXISTS odds_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            match_id TEXT NOT NULL,
            fetched_at TEXT NOT NULL,
            phase TEXT NOT NULL,
            score_home INTEGER NOT NULL,
            score_away INTEGER NOT NULL,
            period INTEGER NOT NULL,
            in_break INTEGER NOT NULL,
            payload_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_snapshots_match ON odds_snapshots(match_id, fetched_at);

        CREATE TABLE IF NOT EXISTS notification_records (
            match_id TEXT NOT NULL,
            rule TEXT NOT NULL,
            fired_at TEXT NOT NULL,
            surface TEXT NOT NULL,
            PRIMARY KEY (match_id, rule)
        );

        CREATE TABLE IF NOT EXISTS notification_deliveries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL,
            match_id TEXT NOT NULL,
            rule TEXT NOT NULL,
            target TEXT NOT NULL,
            ok INTEGER NOT NULL,
            error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_deliveries_match ON notification_deliveries(match_id);

        CREATE TABLE IF NOT EXISTS subscriptions (
            subscriber_id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            tier TEXT NOT NULL,
            sports TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 0,
            active_until TEXT
        );

        CREATE TABLE IF NOT EXISTS cycle_heartbeat (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL,
            cycle INTEGER NOT NULL,
            tracked INTEGER NOT NULL,
            live INTEGER NOT NULL,
            polled INTEGER NOT NULL,
            skipped INTEGER NOT NULL,
            alerts INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_hb_ts ON cycle_heartbeat(ts);
        "#,
    ).context("init schema")?;

    Ok(())
}

pub fn apply_msg(conn: &Connection, msg: DbMsg) -> Result<()> {
    match msg {
        DbMsg::MatchUpsert(r) => {
            conn.execute(
                r#"
                INSERT INTO matches(match_id, ts, sport, league, home, away, scheduled_start, status,
                                    pre_home, pre_away, pre_draw, favorite, first_seen, last_seen, closed_at, adopted_live)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                ON CONFLICT(match_id) DO UPDATE SET
                    ts=excluded.ts,
                    scheduled_start=excluded.scheduled_start,
                    status=excluded.status,
                    pre_home=excluded.pre_home,
                    pre_away=excluded.pre_away,
                    pre_draw=excluded.pre_draw,
                    favorite=excluded.favorite,
                    last_seen=excluded.last_seen,
                    closed_at=excluded.closed_at,
                    adopted_live=excluded.adopted_live
                "#,
                params![
                    r.match_id,
                    r.ts.to_rfc3339(),
                    r.sport,
                    r.league,
                    r.home,
                    r.away,
                    r.scheduled_start.to_rfc3339(),
                    r.status,
                    r.pre_home,
                    r.pre_away,
                    r.pre_draw,
                    r.favorite,
                    r.first_seen.to_rfc3339(),
                    r.last_seen.to_rfc3339(),
                    r.closed_at.map(|t| t.to_rfc3339()),
                    r.adopted_live,
                ],
            )?;
        }
        DbMsg::Snapshot(r) => {
            conn.execute(
                "INSERT INTO odds_snapshots(match_id, fetched_at, phase, score_home, score_away, period, in_break, payload_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    r.match_id,
                    r.fetched_at.to_rfc3339(),
                    r.phase,
                    r.score_home,
                    r.score_away,
                    r.period,
                    r.in_break,
                    r.payload_json,
                ],
            )?;
        }
        DbMsg::Notification(r) => {
            conn.execute(
                "INSERT OR IGNORE INTO notification_records(match_id, rule, fired_at, surface) VALUES (?1, ?2, ?3, ?4)",
                params![r.match_id, r.rule.as_str(), r.fired_at.to_rfc3339(), r.surface.as_str()],
            )?;
        }
        DbMsg::Delivery(d) => {
            conn.execute(
                "INSERT INTO notification_deliveries(ts, match_id, rule, target, ok, error) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![d.at.to_rfc3339(), d.match_id, d.rule.as_str(), d.target, d.ok, d.error],
            )?;
        }
        DbMsg::Evict(match_id) => {
            // notification_records zůstávají, hlídají re-fire po restartu
            conn.execute("DELETE FROM odds_snapshots WHERE match_id = ?1", params![match_id])?;
            conn.execute("DELETE FROM matches WHERE match_id = ?1", params![match_id])?;
        }
        DbMsg::Heartbeat(r) => {
            conn.execute(
                "INSERT INTO cycle_heartbeat(ts, cycle, tracked, live, polled, skipped, alerts, duration_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![r.ts.to_rfc3339(), r.cycle, r.tracked, r.live, r.polled, r.skipped, r.alerts, r.duration_ms],
            )?;
        }
    }

    Ok(())
}

// ── Journal → writer ────────────────────────────────────────────────────────

/// Registry i dispatcher zapisují přes tenhle handle. Plný kanál = zahozený řádek + warn,
/// kromě záznamů o notifikacích: ty jsou jediný trvalý dedup a počkají na místo.
#[derive(Clone)]
pub struct DbJournal {
    tx: mpsc::Sender<DbMsg>,
}

impl DbJournal {
    pub fn new(tx: mpsc::Sender<DbMsg>) -> Self {
        Self { tx }
    }

    pub fn send(&self, msg: DbMsg) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg @ DbMsg::Notification(_))) => self.send_when_free(msg),
            Err(e) => warn!("[trailwatch-db] dropped write: {e}"),
        }
    }

    fn send_when_free(&self, msg: DbMsg) {
        let tx = self.tx.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                debug!("[trailwatch-db] queue full, notification record waits");
                rt.spawn(async move {
                    if tx.send(msg).await.is_err() {
                        warn!("[trailwatch-db] writer gone, notification record lost");
                    }
                });
            }
            Err(_) => {
                if tx.blocking_send(msg).is_err() {
                    warn!("[trailwatch-db] writer gone, notification record lost");
                }
            }
        }
    }
}

impl Journal for DbJournal {
    fn match_upserted(&self, m: &Match) {
        self.send(DbMsg::MatchUpsert(DbMatchRow::from_match(m)));
    }

    fn snapshot_recorded(&self, match_id: &str, s: &OddsSnapshot) {
        let payload_json = match serde_json::to_string(s) {
            Ok(json) => json,
            Err(e) => {
                warn!("[trailwatch-db] snapshot encode failed for {match_id}: {e}");
                return;
            }
        };
        self.send(DbMsg::Snapshot(DbSnapshotRow {
            match_id:   match_id.to_string(),
            fetched_at: s.fetched_at,
            phase:      s.phase.as_str().to_string(),
            score_home: i64::from(s.score.home),
            score_away: i64::from(s.score.away),
            period:     i64::from(s.period.period),
            in_break:   s.period.in_break,
            payload_json,
        }));
    }

    fn notification_recorded(&self, record: &NotificationRecord) {
        self.send(DbMsg::Notification(record.clone()));
    }

    fn match_evicted(&self, match_id: &str) {
        self.send(DbMsg::Evict(match_id.to_string()));
    }
}

impl DeliveryLog for DbJournal {
    fn delivery(&self, attempt: &DeliveryAttempt) {
        self.send(DbMsg::Delivery(attempt.clone()));
    }
}

// ── Rehydratace ─────────────────────────────────────────────────────────────

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp '{raw}'"))?
        .with_timezone(&Utc))
}

fn parse_favorite(raw: &str) -> Option<Favorite> {
    match raw {
        "home"    => Some(Favorite::Side(Side::Home)),
        "away"    => Some(Favorite::Side(Side::Away)),
        "unknown" => Some(Favorite::Unknown),
        _         => None,
    }
}

/// Stav pro `MatchRegistry::rehydrate`: zápasy (+ poslední snapshot) a záznamy notifikací.
/// Záznamy k už vyhozeným zápasům jen za posledních `archive_ttl`.
pub fn load_state(conn: &Connection, now: DateTime<Utc>, archive_ttl: Duration) -> Result<(Vec<Match>, Vec<NotificationRecord>)> {
    let mut stmt = conn.prepare(
        "SELECT match_id, sport, league, home, away, scheduled_start, status, pre_home, pre_away, pre_draw,
                favorite, first_seen, last_seen, closed_at, adopted_live
         FROM matches",
    )?;
    type Raw = (
        String, String, String, String, String, String, String,
        Option<f64>, Option<f64>, Option<f64>, Option<String>,
        String, String, Option<String>, bool,
    );
    let rows: Vec<Raw> = stmt
        .query_map([], |r| {
            Ok((
                r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?,
                r.get(7)?, r.get(8)?, r.get(9)?, r.get(10)?,
                r.get(11)?, r.get(12)?, r.get(13)?, r.get(14)?,
            ))
        })?
        .collect::<rusqlite::Result<_>>()?;

    let mut matches = Vec::with_capacity(rows.len());
    for (id, sport, league, home, away, start, status, pre_home, pre_away, pre_draw, favorite, first_seen, last_seen, closed_at, adopted_live) in rows {
        let parsed: Result<Match> = (|| {
            let pre_match_odds = match (pre_home, pre_away) {
                (Some(home), Some(away)) => Some(MoneylineOdds { home, away, draw: pre_draw }),
                _ => None,
            };
            Ok(Match {
                sport: sport.parse::<Sport>()?,
                league,
                home,
                away,
                scheduled_start: parse_ts(&start)?,
                status: status.parse()?,
                pre_match_odds,
                favorite: favorite.as_deref().and_then(parse_favorite),
                snapshots: latest_snapshot(conn, &id)?.into_iter().collect::<VecDeque<_>>(),
                fired: BTreeSet::new(),
                first_seen: parse_ts(&first_seen)?,
                last_seen: parse_ts(&last_seen)?,
                closed_at: closed_at.as_deref().map(parse_ts).transpose()?,
                missed_polls: 0,
                adopted_live,
                id: id.clone(),
            })
        })();
        match parsed {
            Ok(m) => matches.push(m),
            Err(e) => warn!("[trailwatch-db] skipping match {id}: {e:#}"),
        }
    }

    let cutoff = (now - archive_ttl).to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT match_id, rule, fired_at, surface FROM notification_records
         WHERE match_id IN (SELECT match_id FROM matches) OR fired_at >= ?1",
    )?;
    let raw: Vec<(String, String, String, String)> = stmt
        .query_map(params![cutoff], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let mut records = Vec::with_capacity(raw.len());
    for (match_id, rule, fired_at, surface) in raw {
        let parsed: Result<NotificationRecord> = (|| {
            Ok(NotificationRecord {
                rule: rule.parse()?,
                fired_at: parse_ts(&fired_at)?,
                surface: surface.parse()?,
                match_id: match_id.clone(),
            })
        })();
        match parsed {
            Ok(r) => records.push(r),
            Err(e) => warn!("[trailwatch-db] skipping record {match_id}/{rule}: {e:#}"),
        }
    }

    debug!("[trailwatch-db] loaded {} matches, {} records", matches.len(), records.len());
    Ok((matches, records))
}

fn latest_snapshot(conn: &Connection, match_id: &str) -> Result<Option<OddsSnapshot>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT payload_json FROM odds_snapshots WHERE match_id = ?1 ORDER BY fetched_at DESC, id DESC LIMIT 1",
            params![match_id],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(json) => Ok(Some(serde_json::from_str(&json).context("decode snapshot")?)),
        None => Ok(None),
    }
}

// ── Předplatná (jen čtení) ──────────────────────────────────────────────────

pub fn read_subscriptions(conn: &Connection) -> Result<Vec<Subscription>> {
    let mut stmt = conn.prepare(
        "SELECT subscriber_id, chat_id, tier, sports, active, active_until FROM subscriptions",
    )?;
    let raw: Vec<(String, String, String, String, bool, Option<String>)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let mut subs = Vec::with_capacity(raw.len());
    for (subscriber_id, chat_id, tier, sports, active, active_until) in raw {
        let tier: Tier = match tier.parse() {
            Ok(t) => t,
            Err(e) => {
                warn!("subscription {subscriber_id}: {e}");
                continue;
            }
        };
        let sports: BTreeSet<Sport> = sports
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .take(tier.sport_allowance())
            .collect();
        let active_until = match active_until.as_deref().map(parse_ts).transpose() {
            Ok(t) => t,
            Err(e) => {
                warn!("subscription {subscriber_id}: {e:#}");
                None
            }
        };
        subs.push(Subscription { subscriber_id, chat_id, tier, sports, active, active_until });
    }
    Ok(subs)
}

/// `SubscriptionSource` nad tabulkou `subscriptions`. Každý dotaz = nové read-only spojení.
pub struct SqliteSubscriptions {
    path: PathBuf,
}

impl SqliteSubscriptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SubscriptionSource for SqliteSubscriptions {
    async fn snapshot(&self) -> Result<Vec<Subscription>, SourceError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Subscription>> {
            let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .with_context(|| format!("open {}", path.display()))?;
            read_subscriptions(&conn)
        })
        .await
        .map_err(|e| SourceError(e.to_string()))?
        .map_err(|e| SourceError(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sports_core::{FeedPhase, MatchSeed, MatchStatus, PeriodMarker, RuleId, Score, Surface};

    fn mem() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn tracked(id: &str) -> Match {
        let now = Utc::now();
        let mut m = Match::from_seed(
            MatchSeed {
                id:              id.to_string(),
                sport:           Sport::Handball,
                league:          "EHF CL".into(),
                home:            "Kiel".into(),
                away:            "Veszprem".into(),
                scheduled_start: now + Duration::hours(1),
                odds:            Some(MoneylineOdds { home: 1.7, away: 2.3, draw: Some(9.0) }),
            },
            now,
        );
        m.favorite = Some(Favorite::Side(Side::Home));
        m
    }

    fn record(id: &str, rule: RuleId, at: DateTime<Utc>) -> NotificationRecord {
        NotificationRecord { match_id: id.into(), rule, fired_at: at, surface: rule.surface() }
    }

    #[test]
    fn notification_records_insert_or_ignore() {
        let conn = mem();
        let now = Utc::now();
        apply_msg(&conn, DbMsg::Notification(record("m1", RuleId::FavoriteTrailing, now))).unwrap();
        apply_msg(&conn, DbMsg::Notification(record("m1", RuleId::FavoriteTrailing, now + Duration::minutes(1)))).unwrap();
        apply_msg(&conn, DbMsg::Notification(record("m1", RuleId::MatchStart, now))).unwrap();

        let count: i64 = conn.query_row("SELECT COUNT(1) FROM notification_records", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn state_round_trips_through_db() {
        let conn = mem();
        let now = Utc::now();
        let mut m = tracked("m1");
        apply_msg(&conn, DbMsg::MatchUpsert(DbMatchRow::from_match(&m))).unwrap();
        m.status = MatchStatus::Live;
        apply_msg(&conn, DbMsg::MatchUpsert(DbMatchRow::from_match(&m))).unwrap();

        let journal_snapshot = OddsSnapshot {
            fetched_at:      now,
            phase:           FeedPhase::InPlay,
            score:           Score::new(14, 12),
            set_scores:      vec![],
            period:          PeriodMarker::new(1, true),
            elapsed_minutes: 30,
            live_odds:       None,
        };
        let payload_json = serde_json::to_string(&journal_snapshot).unwrap();
        apply_msg(&conn, DbMsg::Snapshot(DbSnapshotRow {
            match_id: "m1".into(),
            fetched_at: now,
            phase: "in_play".into(),
            score_home: 14,
            score_away: 12,
            period: 1,
            in_break: true,
            payload_json,
        })).unwrap();
        apply_msg(&conn, DbMsg::Notification(record("m1", RuleId::MatchStart, now))).unwrap();

        let (matches, records) = load_state(&conn, now, Duration::days(7)).unwrap();
        assert_eq!(matches.len(), 1);
        let loaded = &matches[0];
        assert_eq!(loaded.status, MatchStatus::Live);
        assert_eq!(loaded.favorite, Some(Favorite::Side(Side::Home)));
        assert_eq!(loaded.pre_match_odds.and_then(|o| o.draw), Some(9.0));
        assert_eq!(loaded.latest_snapshot(), Some(&journal_snapshot));
        assert_eq!(records, vec![record("m1", RuleId::MatchStart, records[0].fired_at)]);
    }

    #[test]
    fn evicted_match_keeps_recent_records_only() {
        let conn = mem();
        let now = Utc::now();
        apply_msg(&conn, DbMsg::MatchUpsert(DbMatchRow::from_match(&tracked("old")))).unwrap();
        apply_msg(&conn, DbMsg::Notification(record("old", RuleId::FavoriteTrailing, now - Duration::days(1)))).unwrap();
        apply_msg(&conn, DbMsg::Notification(record("ancient", RuleId::FavoriteTrailing, now - Duration::days(30)))).unwrap();
        apply_msg(&conn, DbMsg::Evict("old".into())).unwrap();

        let (matches, records) = load_state(&conn, now, Duration::days(7)).unwrap();
        assert!(matches.is_empty());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].match_id, "old");
        assert_eq!(records[0].surface, Surface::Premium);
    }

    #[test]
    fn subscriptions_are_parsed_and_capped_by_tier() {
        let conn = mem();
        let until = (Utc::now() + Duration::days(10)).to_rfc3339();
        conn.execute(
            "INSERT INTO subscriptions VALUES ('u1', '111', 'single', 'tennis,basketball', 1, ?1)",
            params![until],
        ).unwrap();
        conn.execute("INSERT INTO subscriptions VALUES ('u2', '@bob', 'free', '', 1, NULL)", []).unwrap();
        conn.execute("INSERT INTO subscriptions VALUES ('u3', '333', 'platinum', '', 1, NULL)", []).unwrap();

        let subs = read_subscriptions(&conn).unwrap();
        assert_eq!(subs.len(), 2);
        let single = subs.iter().find(|s| s.subscriber_id == "u1").unwrap();
        assert_eq!(single.tier, Tier::Single);
        assert_eq!(single.sports.len(), 1);
        assert!(single.active_until.is_some());
    }

    #[tokio::test]
    async fn writer_thread_drains_on_drop() {
        let path = std::env::temp_dir().join(format!("trailwatch_writer_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let (tx, handle) = spawn_db_writer(DbConfig { path: path.to_string_lossy().to_string() });
        let journal = DbJournal::new(tx);

        journal.match_upserted(&tracked("m1"));
        journal.notification_recorded(&record("m1", RuleId::MatchStart, Utc::now()));
        drop(journal);
        handle.join().unwrap();

        let conn = Connection::open(&path).unwrap();
        let (matches, records) = load_state(&conn, Utc::now(), Duration::days(7)).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(records.len(), 1);

        let subs = SqliteSubscriptions::new(&path).snapshot().await.unwrap();
        assert!(subs.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn full_queue_drops_bulk_rows_but_keeps_notification_records() {
        let (tx, mut rx) = mpsc::channel(1);
        let journal = DbJournal::new(tx);

        journal.send(DbMsg::Evict("first".into()));
        journal.send(DbMsg::Evict("dropped".into()));
        journal.notification_recorded(&record("m1", RuleId::FavoriteTrailing, Utc::now()));

        assert!(matches!(rx.recv().await, Some(DbMsg::Evict(id)) if id == "first"));
        let next = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(matches!(next, Some(DbMsg::Notification(r)) if r.match_id == "m1" && r.rule == RuleId::FavoriteTrailing));

        drop(journal);
        let end = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(end.is_none());
    }
}
