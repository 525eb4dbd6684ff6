/// TrailWatch — Match Registry
///
/// Jediný zdroj pravdy o sledovaných zápasech: stav, favorit, snapshoty,
/// a hlavně `fired`: které notifikace už odešly. `mark_rule_fired` je
/// atomický check-and-set pod zámkem zápasu, takže dvě souběžné cesty
/// nikdy neodpálí stejné pravidlo dvakrát.
///
/// Persistence jde přes `Journal` (SQLite writer v binárce, `NullJournal` v testech).

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sports_core::{
    Favorite, MatchSeed, MatchStatus, MoneylineOdds, NotificationRecord, OddsSnapshot, RuleId, Sport,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Kolik posledních snapshotů si držíme na zápas
pub const SNAPSHOT_HISTORY: usize = 32;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("unknown match {0}")]
    UnknownMatch(String),
    #[error("match {match_id}: status cannot go from {from} to {to}")]
    StatusRegression { match_id: String, from: MatchStatus, to: MatchStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub id:              String,
    pub sport:           Sport,
    pub league:          String,
    pub home:            String,
    pub away:            String,
    pub scheduled_start: DateTime<Utc>,
    pub status:          MatchStatus,
    pub pre_match_odds:  Option<MoneylineOdds>,
    /// Nastaví se jednou, z prvních pre-match kurzů
    pub favorite:        Option<Favorite>,
    pub snapshots:       VecDeque<OddsSnapshot>,
    pub fired:           BTreeSet<RuleId>,
    pub first_seen:      DateTime<Utc>,
    pub last_seen:       DateTime<Utc>,
    pub closed_at:       Option<DateTime<Utc>>,
    pub missed_polls:    u32,
    /// Poprvé viděn až po plánovaném startu, start notifikace se neposílá
    pub adopted_live:    bool,
}

impl Match {
    pub fn from_seed(seed: MatchSeed, now: DateTime<Utc>) -> Self {
        let adopted_live = now >= seed.scheduled_start;
        Self {
            id:              seed.id,
            sport:           seed.sport,
            league:          seed.league,
            home:            seed.home,
            away:            seed.away,
            scheduled_start: seed.scheduled_start,
            status:          MatchStatus::Scheduled,
            pre_match_odds:  seed.odds,
            favorite:        None,
            snapshots:       VecDeque::new(),
            fired:           BTreeSet::new(),
            first_seen:      now,
            last_seen:       now,
            closed_at:       None,
            missed_polls:    0,
            adopted_live,
        }
    }

    pub fn latest_snapshot(&self) -> Option<&OddsSnapshot> {
        self.snapshots.back()
    }

    pub fn has_fired(&self, rule: RuleId) -> bool {
        self.fired.contains(&rule)
    }

    pub fn label(&self) -> String {
        format!("{} vs {}", self.home, self.away)
    }

    fn set_status(&mut self, next: MatchStatus, now: DateTime<Utc>) -> Result<MatchStatus, RegistryError> {
        let prev = self.status;
        if !prev.can_advance_to(next) {
            return Err(RegistryError::StatusRegression { match_id: self.id.clone(), from: prev, to: next });
        }
        self.status = next;
        if next.is_terminal() && self.closed_at.is_none() {
            self.closed_at = Some(now);
        }
        Ok(prev)
    }
}

/// Zápis změn ven (DB). Volá se pod zámkem zápasu, nesmí blokovat.
pub trait Journal: Send + Sync {
    fn match_upserted(&self, m: &Match);
    fn snapshot_recorded(&self, match_id: &str, snapshot: &OddsSnapshot);
    fn notification_recorded(&self, record: &NotificationRecord);
    fn match_evicted(&self, match_id: &str);
}

pub struct NullJournal;

impl Journal for NullJournal {
    fn match_upserted(&self, _m: &Match) {}
    fn snapshot_recorded(&self, _match_id: &str, _snapshot: &OddsSnapshot) {}
    fn notification_recorded(&self, _record: &NotificationRecord) {}
    fn match_evicted(&self, _match_id: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    /// Známý zápas, poprvé s pre-match kurzy → klasifikovat favorita
    OddsFirstSeen,
    Known,
    /// Uzavřený nebo už vyhozený zápas, discovery ho ignoruje
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotUpdate {
    Accepted { previous: Option<OddsSnapshot> },
    /// Starší nebo stejně starý než poslední uložený
    Stale,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    /// Scheduled zápas, který do téhle doby po startu nenaběhl → abandoned
    pub never_live_after: Duration,
    /// Běžící zápas bez úspěšného snapshotu tak dlouho → abandoned
    pub stale_after:      Duration,
    /// Jak dlouho držet uzavřené zápasy v paměti
    pub retention:        Duration,
    /// Jak dlouho si po vyhození pamatovat odpálená pravidla
    pub archive_ttl:      Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            never_live_after: Duration::hours(3),
            stale_after:      Duration::hours(6),
            retention:        Duration::hours(24),
            archive_ttl:      Duration::days(7),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub abandoned: Vec<String>,
    pub evicted:   Vec<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total:              usize,
    pub scheduled:          usize,
    pub live:               usize,
    pub checkpoint_reached: usize,
    pub finished:           usize,
    pub abandoned:          usize,
    pub archived:           usize,
}

struct Archived {
    fired:      BTreeSet<RuleId>,
    evicted_at: DateTime<Utc>,
}

pub struct MatchRegistry {
    matches: RwLock<HashMap<String, Arc<Mutex<Match>>>>,
    archive: RwLock<HashMap<String, Archived>>,
    journal: Arc<dyn Journal>,
}

impl MatchRegistry {
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        Self {
            matches: RwLock::new(HashMap::new()),
            archive: RwLock::new(HashMap::new()),
            journal,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(NullJournal))
    }

    async fn entry(&self, id: &str) -> Result<Arc<Mutex<Match>>, RegistryError> {
        self.matches
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownMatch(id.to_string()))
    }

    /// Discovery → registry. Nový zápas založí, u známého doplní kurzy / posunutý start.
    pub async fn upsert(&self, seed: MatchSeed, now: DateTime<Utc>) -> UpsertOutcome {
        if self.archive.read().await.contains_key(&seed.id) {
            return UpsertOutcome::Closed;
        }

        let existing = self.matches.read().await.get(&seed.id).cloned();
        let entry = match existing {
            Some(entry) => entry,
            None => {
                let mut map = self.matches.write().await;
                // mezitím ho mohl založit někdo jiný
                if let Some(entry) = map.get(&seed.id).cloned() {
                    entry
                } else {
                    let m = Match::from_seed(seed, now);
                    self.journal.match_upserted(&m);
                    debug!("registry: new {} {} ({})", m.sport, m.label(), m.id);
                    map.insert(m.id.clone(), Arc::new(Mutex::new(m)));
                    return UpsertOutcome::Created;
                }
            }
        };

        let mut m = entry.lock().await;
        if m.status.is_terminal() {
            return UpsertOutcome::Closed;
        }
        m.last_seen = now;

        let mut changed = false;
        let mut outcome = UpsertOutcome::Known;
        if m.status == MatchStatus::Scheduled {
            if m.scheduled_start != seed.scheduled_start {
                m.scheduled_start = seed.scheduled_start;
                changed = true;
            }
            if m.pre_match_odds.is_none() && seed.odds.is_some() {
                m.pre_match_odds = seed.odds;
                changed = true;
                outcome = UpsertOutcome::OddsFirstSeen;
            }
        }
        if changed {
            self.journal.match_upserted(&m);
        }
        outcome
    }

    pub async fn record_snapshot(&self, id: &str, snapshot: OddsSnapshot) -> Result<SnapshotUpdate, RegistryError> {
        let entry = self.entry(id).await?;
        let mut m = entry.lock().await;
        if m.status.is_terminal() {
            return Ok(SnapshotUpdate::Closed);
        }
        if m.latest_snapshot().map_or(false, |last| snapshot.fetched_at <= last.fetched_at) {
            return Ok(SnapshotUpdate::Stale);
        }

        let previous = m.latest_snapshot().cloned();
        self.journal.snapshot_recorded(id, &snapshot);
        m.last_seen = snapshot.fetched_at;
        m.missed_polls = 0;
        m.snapshots.push_back(snapshot);
        while m.snapshots.len() > SNAPSHOT_HISTORY {
            m.snapshots.pop_front();
        }
        Ok(SnapshotUpdate::Accepted { previous })
    }

    pub async fn get(&self, id: &str) -> Option<Match> {
        let entry = self.matches.read().await.get(id).cloned()?;
        let m = entry.lock().await;
        Some(m.clone())
    }

    pub async fn all(&self) -> Vec<Match> {
        let entries: Vec<_> = self.matches.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.lock().await.clone());
        }
        out
    }

    /// Atomický check-and-set. `true` právě jednou pro danou dvojici (zápas, pravidlo),
    /// i přes restart (záznamy se rehydratují) a po vyhození z paměti (archiv).
    pub async fn mark_rule_fired(&self, id: &str, rule: RuleId, now: DateTime<Utc>) -> Result<bool, RegistryError> {
        let entry = match self.entry(id).await {
            Ok(entry) => entry,
            Err(e) => {
                return if self.archive.read().await.contains_key(id) { Ok(false) } else { Err(e) };
            }
        };

        let mut m = entry.lock().await;
        if !m.fired.insert(rule) {
            return Ok(false);
        }
        self.journal.notification_recorded(&NotificationRecord {
            match_id: m.id.clone(),
            rule,
            fired_at: now,
            surface: rule.surface(),
        });
        Ok(true)
    }

    /// Favorit se určuje jen jednou. `Ok(false)` pokud už byl nastaven.
    pub async fn set_favorite(&self, id: &str, favorite: Favorite) -> Result<bool, RegistryError> {
        let entry = self.entry(id).await?;
        let mut m = entry.lock().await;
        if m.favorite.is_some() {
            return Ok(false);
        }
        m.favorite = Some(favorite);
        self.journal.match_upserted(&m);
        Ok(true)
    }

    /// Vrací předchozí stav. Regrese = chyba, stejný stav = no-op.
    pub async fn advance_status(
        &self,
        id:   &str,
        next: MatchStatus,
        now:  DateTime<Utc>,
    ) -> Result<MatchStatus, RegistryError> {
        let entry = self.entry(id).await?;
        let mut m = entry.lock().await;
        let prev = m.set_status(next, now)?;
        if prev != next {
            info!("registry: {} {} → {}", m.id, prev, next);
            self.journal.match_upserted(&m);
        }
        Ok(prev)
    }

    /// `Ok(false)` pokud už byl zápas uzavřený
    pub async fn mark_abandoned(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<bool, RegistryError> {
        let entry = self.entry(id).await?;
        let mut m = entry.lock().await;
        if m.status.is_terminal() {
            return Ok(false);
        }
        m.set_status(MatchStatus::Abandoned, now)?;
        info!("registry: {} abandoned ({reason})", m.id);
        self.journal.match_upserted(&m);
        Ok(true)
    }

    /// Feed zápas nezná. Běžící zápas po `max_missed` takových odpovědích končí jako finished.
    /// Vrací `true`, pokud se tímhle zápas uzavřel.
    pub async fn record_missed_poll(&self, id: &str, max_missed: u32, now: DateTime<Utc>) -> Result<bool, RegistryError> {
        let entry = self.entry(id).await?;
        let mut m = entry.lock().await;
        if m.status.is_terminal() {
            return Ok(false);
        }
        m.missed_polls += 1;
        if m.status.is_in_play() && m.missed_polls >= max_missed {
            m.set_status(MatchStatus::Finished, now)?;
            info!("registry: {} gone from feed after {} polls → finished", m.id, m.missed_polls);
            self.journal.match_upserted(&m);
            return Ok(true);
        }
        Ok(false)
    }

    /// Zápasy k live pollu: běžící + naplánované, které začnou do `lead`.
    pub async fn poll_candidates(&self, now: DateTime<Utc>, lead: Duration) -> Vec<(String, Sport)> {
        let mut out = Vec::new();
        for m in self.all().await {
            let due = match m.status {
                MatchStatus::Live | MatchStatus::CheckpointReached => true,
                MatchStatus::Scheduled => m.scheduled_start <= now + lead,
                _ => false,
            };
            if due {
                out.push((m.id, m.sport));
            }
        }
        out.sort();
        out
    }

    /// Údržba: abandon zaseklých zápasů, vyhození starých uzavřených (pravidla → archiv).
    pub async fn sweep(&self, now: DateTime<Utc>, cfg: &SweepConfig) -> SweepReport {
        let mut report = SweepReport::default();
        let entries: Vec<_> = self.matches.read().await.values().cloned().collect();

        for entry in entries {
            let mut m = entry.lock().await;
            let reason = match m.status {
                MatchStatus::Scheduled if m.scheduled_start + cfg.never_live_after < now => "never went live",
                MatchStatus::Live | MatchStatus::CheckpointReached if m.last_seen + cfg.stale_after < now => {
                    "no feed data"
                }
                _ => continue,
            };
            if m.set_status(MatchStatus::Abandoned, now).is_ok() {
                info!("registry: {} abandoned ({reason})", m.id);
                self.journal.match_upserted(&m);
                report.abandoned.push(m.id.clone());
            }
        }

        let mut map = self.matches.write().await;
        let mut archive = self.archive.write().await;
        let mut expired = Vec::new();
        for (id, entry) in map.iter() {
            // write lock na mapě drží ostatní venku, zámek zápasu je volný nebo brzy bude
            let m = entry.lock().await;
            if m.closed_at.map_or(false, |closed| closed + cfg.retention < now) {
                expired.push((id.clone(), m.fired.clone()));
            }
        }
        for (id, fired) in expired {
            map.remove(&id);
            self.journal.match_evicted(&id);
            archive.insert(id.clone(), Archived { fired, evicted_at: now });
            report.evicted.push(id);
        }
        archive.retain(|_, a| a.evicted_at + cfg.archive_ttl >= now);

        report.abandoned.sort();
        report.evicted.sort();
        report
    }

    /// Start po restartu: zápasy + záznamy notifikací z DB. Bez zápisu do journalu.
    pub async fn rehydrate(&self, matches: Vec<Match>, records: Vec<NotificationRecord>, now: DateTime<Utc>) -> usize {
        let mut map = self.matches.write().await;
        let mut archive = self.archive.write().await;

        let mut by_match: HashMap<String, BTreeSet<RuleId>> = HashMap::new();
        for r in records {
            by_match.entry(r.match_id).or_default().insert(r.rule);
        }

        let count = matches.len();
        for mut m in matches {
            if let Some(fired) = by_match.remove(&m.id) {
                m.fired.extend(fired);
            }
            map.insert(m.id.clone(), Arc::new(Mutex::new(m)));
        }
        // záznamy k zápasům, které už v DB nejsou
        for (id, fired) in by_match {
            archive.insert(id, Archived { fired, evicted_at: now });
        }
        count
    }

    pub async fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            archived: self.archive.read().await.len(),
            ..RegistryStats::default()
        };
        for m in self.all().await {
            stats.total += 1;
            match m.status {
                MatchStatus::Scheduled         => stats.scheduled += 1,
                MatchStatus::Live              => stats.live += 1,
                MatchStatus::CheckpointReached => stats.checkpoint_reached += 1,
                MatchStatus::Finished          => stats.finished += 1,
                MatchStatus::Abandoned         => stats.abandoned += 1,
            }
        }
        stats
    }
}
