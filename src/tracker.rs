//! Jeden cyklus trackeru:
//!   discovery (každých N cyklů) → live poll → sweep
//!
//! Start notifikace odchází až na pozorovaném přechodu Scheduled → Live,
//! zápas, který nikdy nenaběhne, tak nepošle nic.
//!
//! Live poll: každý zápas vlastní task (fetch → record → evaluate → dispatch),
//! cyklus na ně čeká max `cycle_budget`. Co nedoběhne, běží dál na pozadí
//! a drží in-flight guard, takže se v dalším cyklu ten zápas přeskočí.

use alert_dispatcher::{AlertPayload, DispatchOutcome, Dispatcher};
use chrono::{DateTime, Utc};
use logger::{now_iso, AlertFiredEvent, EventLogger, FeedStatusEvent, MatchStatusEvent, MatchTrackedEvent};
use match_registry::{Match, MatchRegistry, SnapshotUpdate, SweepConfig, UpsertOutcome};
use odds_feed::{FeedError, LiveFetch, OddsFeed};
use sports_core::{Favorite, FeedPhase, MatchSeed, MatchStatus, MoneylineOdds, OddsSnapshot, RuleId, Sport};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use trailing_detector::{classify, describe, evaluate, rule_for};

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub sports:           Vec<Sport>,
    pub discovery_every:  u32,
    pub cycle_budget:     Duration,
    /// Live polling začíná tolik před plánovaným startem
    pub start_lead:       chrono::Duration,
    pub max_missed_polls: u32,
    pub sweep:            SweepConfig,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle:             u64,
    pub discovered:        usize,
    pub polled:            usize,
    pub in_flight_skipped: usize,
    pub timed_out:         usize,
    pub failed:            usize,
    pub alerts:            usize,
    pub abandoned:         usize,
    pub evicted:           usize,
    pub duration_ms:       u64,
}

type InFlightSet = Arc<Mutex<HashSet<String>>>;

/// Max jeden běžící fetch na zápas. Uvolní se dropem.
struct InFlight {
    set: InFlightSet,
    id:  String,
}

impl InFlight {
    fn acquire(set: &InFlightSet, id: &str) -> Option<Self> {
        let mut running = set.lock().unwrap_or_else(|p| p.into_inner());
        if !running.insert(id.to_string()) {
            return None;
        }
        Some(Self { set: set.clone(), id: id.to_string() })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(|p| p.into_inner()).remove(&self.id);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PollResult {
    ok:     bool,
    alerts: usize,
}

#[derive(Clone)]
pub struct Tracker {
    feed:       Arc<dyn OddsFeed>,
    registry:   Arc<MatchRegistry>,
    dispatcher: Arc<Dispatcher>,
    events:     Arc<EventLogger>,
    settings:   Arc<TrackerSettings>,
    in_flight:  InFlightSet,
}

impl Tracker {
    pub fn new(
        feed:       Arc<dyn OddsFeed>,
        registry:   Arc<MatchRegistry>,
        dispatcher: Arc<Dispatcher>,
        events:     Arc<EventLogger>,
        settings:   TrackerSettings,
    ) -> Self {
        Self {
            feed,
            registry,
            dispatcher,
            events,
            settings: Arc::new(settings),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn run_cycle(&self, cycle: u64) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport { cycle, ..CycleReport::default() };

        let every = u64::from(self.settings.discovery_every.max(1));
        if cycle.saturating_sub(1) % every == 0 {
            report.discovered = self.discover(Utc::now()).await;
        }

        self.poll_live(Utc::now(), &mut report).await;

        let sweep = self.registry.sweep(Utc::now(), &self.settings.sweep).await;
        for id in &sweep.abandoned {
            self.status_event(id, "open", MatchStatus::Abandoned, Some("sweep"));
        }
        report.abandoned += sweep.abandoned.len();
        report.evicted = sweep.evicted.len();
        if !sweep.evicted.is_empty() {
            info!("🧹 evicted {} closed matches", sweep.evicted.len());
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        report
    }

    pub async fn log_summary(&self) {
        let s = self.registry.stats().await;
        info!(
            "📊 Tracking {} matches: {} scheduled, {} live, {} past checkpoint, {} finished, {} abandoned ({} archived)",
            s.total, s.scheduled, s.live, s.checkpoint_reached, s.finished, s.abandoned, s.archived
        );
    }

    // ── Discovery ───────────────────────────────────────────────────────────

    async fn discover(&self, now: DateTime<Utc>) -> usize {
        let mut seen = 0;
        for &sport in &self.settings.sports {
            let batch = match self.feed.fetch_upcoming(sport).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("{sport}: discovery skipped this cycle: {e}");
                    self.feed_event(sport, "upcoming", false, 0, Some(e.to_string()));
                    continue;
                }
            };
            self.feed_event(sport, "upcoming", true, batch.seeds.len(), None);
            seen += batch.seeds.len();

            for seed in batch.seeds {
                self.track(seed, now).await;
            }
            for (id, reason) in batch.malformed {
                if self.registry.get(&id).await.is_some() {
                    self.abandon(&id, &format!("malformed feed data: {reason}")).await;
                }
            }
        }
        seen
    }

    async fn track(&self, seed: MatchSeed, now: DateTime<Utc>) {
        let id = seed.id.clone();
        let odds = seed.odds;
        let outcome = self.registry.upsert(seed, now).await;

        if matches!(outcome, UpsertOutcome::Created | UpsertOutcome::OddsFirstSeen) {
            if let Some(odds) = odds {
                self.classify_favorite(&id, &odds).await;
            }
        }

        if outcome == UpsertOutcome::Created {
            if let Some(m) = self.registry.get(&id).await {
                let fav_odds = m
                    .favorite
                    .and_then(|f| f.side())
                    .zip(m.pre_match_odds)
                    .map(|(side, odds)| odds.for_side(side));
                info!(
                    "{} new {} ({}, {}), favorite {}",
                    m.sport.emoji(),
                    m.label(),
                    m.league,
                    m.scheduled_start.format("%d.%m. %H:%M"),
                    m.favorite.map_or("n/a", |f| f.as_str()),
                );
                self.events.log_quiet(&MatchTrackedEvent {
                    ts:        now_iso(),
                    event:     "MATCH_TRACKED",
                    match_id:  m.id.clone(),
                    sport:     m.sport.as_str().to_string(),
                    league:    m.league.clone(),
                    home:      m.home.clone(),
                    away:      m.away.clone(),
                    starts_at: m.scheduled_start.to_rfc3339(),
                    favorite:  m.favorite.map(|f| f.as_str().to_string()),
                    fav_odds,
                });
            }
        }
    }

    /// Jen z pre-match kurzů a jen jednou
    async fn classify_favorite(&self, id: &str, odds: &MoneylineOdds) {
        let favorite = classify(odds);
        match self.registry.set_favorite(id, favorite).await {
            Ok(true) => debug!("{id}: favorite {} ({:.2} / {:.2})", favorite.as_str(), odds.home, odds.away),
            Ok(false) => {}
            Err(e) => warn!("{id}: favorite not stored: {e}"),
        }
    }

    // ── Notifikace ──────────────────────────────────────────────────────────

    async fn fire(&self, m: &Match, rule: RuleId, reason: String) -> usize {
        let payload = AlertPayload::from_match(m, reason.clone());
        match self.dispatcher.dispatch(&m.id, rule, &payload, Utc::now()).await {
            Ok(DispatchOutcome::Fired { delivered, failed }) => {
                info!("🔔 {rule} {} ({}): {reason}", m.label(), m.id);
                self.events.log_quiet(&AlertFiredEvent {
                    ts:        now_iso(),
                    event:     "ALERT_FIRED",
                    match_id:  m.id.clone(),
                    rule:      rule.as_str().to_string(),
                    surface:   rule.surface().as_str().to_string(),
                    sport:     m.sport.as_str().to_string(),
                    detail:    reason,
                    delivered,
                    failed,
                });
                1
            }
            Ok(DispatchOutcome::Duplicate) => {
                debug!("{}: {rule} already fired", m.id);
                0
            }
            Err(e) => {
                warn!("{}: {rule} dispatch failed: {e}", m.id);
                0
            }
        }
    }

    // ── Live poll ───────────────────────────────────────────────────────────

    async fn poll_live(&self, now: DateTime<Utc>, report: &mut CycleReport) {
        let targets = self.registry.poll_candidates(now, self.settings.start_lead).await;

        let mut handles = Vec::with_capacity(targets.len());
        for (id, sport) in targets {
            let Some(guard) = InFlight::acquire(&self.in_flight, &id) else {
                debug!("{id}: previous fetch still running, skipped");
                report.in_flight_skipped += 1;
                continue;
            };
            let tracker = self.clone();
            let task_id = id.clone();
            let handle = tokio::spawn(async move {
                let _guard = guard;
                tracker.poll_one(task_id, sport).await
            });
            handles.push((id, handle));
        }
        report.polled = handles.len();

        let deadline = tokio::time::Instant::now() + self.settings.cycle_budget;
        for (id, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(res)) => {
                    report.alerts += res.alerts;
                    if !res.ok {
                        report.failed += 1;
                    }
                }
                Ok(Err(e)) => {
                    warn!("{id}: live poll task failed: {e}");
                    report.failed += 1;
                }
                Err(_) => {
                    warn!("{id}: live poll over cycle budget, left running");
                    report.timed_out += 1;
                }
            }
        }
    }

    async fn poll_one(&self, id: String, sport: Sport) -> PollResult {
        match self.feed.fetch_live(&id, sport).await {
            Ok(LiveFetch::Snapshot(snapshot)) => PollResult { ok: true, alerts: self.apply_snapshot(&id, snapshot).await },
            Ok(LiveFetch::NotFound) => {
                let before = self.registry.get(&id).await.map(|m| m.status);
                match self.registry.record_missed_poll(&id, self.settings.max_missed_polls, Utc::now()).await {
                    Ok(true) => {
                        let from = before.map_or("live", |s| s.as_str());
                        self.status_event(&id, from, MatchStatus::Finished, Some("gone from feed"));
                    }
                    Ok(false) => debug!("{id}: not in feed"),
                    Err(e) => warn!("{id}: {e}"),
                }
                PollResult { ok: true, alerts: 0 }
            }
            Err(FeedError::Malformed { reason, .. }) => {
                self.abandon(&id, &format!("malformed feed data: {reason}")).await;
                PollResult { ok: false, alerts: 0 }
            }
            Err(e) => {
                warn!("{sport} {id}: live poll skipped this cycle: {e}");
                self.feed_event(sport, "live", false, 0, Some(e.to_string()));
                PollResult { ok: false, alerts: 0 }
            }
        }
    }

    /// record → přechody stavu → checkpoint → dispatch
    async fn apply_snapshot(&self, id: &str, snapshot: OddsSnapshot) -> usize {
        let previous = match self.registry.record_snapshot(id, snapshot.clone()).await {
            Ok(SnapshotUpdate::Accepted { previous }) => previous,
            Ok(SnapshotUpdate::Stale) => {
                debug!("{id}: stale snapshot ignored");
                return 0;
            }
            Ok(SnapshotUpdate::Closed) => return 0,
            Err(e) => {
                warn!("{id}: snapshot rejected: {e}");
                return 0;
            }
        };
        let Some(m) = self.registry.get(id).await else {
            return 0;
        };

        let mut status = m.status;
        let mut alerts = 0;

        if status == MatchStatus::Scheduled && snapshot.has_started() {
            if self.advance(id, MatchStatus::Live, None).await {
                status = MatchStatus::Live;
            }
            if !m.adopted_live {
                alerts += self.fire(&m, RuleId::MatchStart, "Match is live".to_string()).await;
            }
        }

        if status == MatchStatus::Live
            && !snapshot.is_terminal()
            && (rule_for(m.sport).checkpoint)(&snapshot)
            && self.advance(id, MatchStatus::CheckpointReached, None).await
        {
            status = MatchStatus::CheckpointReached;
            alerts += self.evaluate_checkpoint(&m, previous.as_ref(), &snapshot).await;
        }

        match snapshot.phase {
            FeedPhase::Ended => {
                self.advance(id, MatchStatus::Finished, Some("ended")).await;
            }
            FeedPhase::Cancelled => {
                self.abandon(id, "cancelled by feed").await;
            }
            FeedPhase::NotStarted | FeedPhase::InPlay => {}
        }
        debug!("{id}: {} {} ({status})", m.label(), snapshot.score);
        alerts
    }

    async fn evaluate_checkpoint(&self, m: &Match, previous: Option<&OddsSnapshot>, snapshot: &OddsSnapshot) -> usize {
        let side = match m.favorite {
            Some(Favorite::Side(side)) => side,
            other => {
                debug!("{}: checkpoint reached without favorite ({other:?})", m.id);
                return 0;
            }
        };

        match evaluate(m.sport, side, previous, snapshot) {
            Some(verdict) if verdict.is_alert() => {
                let reason = describe(m.sport, side, snapshot);
                self.fire(m, RuleId::FavoriteTrailing, reason).await
            }
            Some(verdict) => {
                info!("{} {}: {:?} at {}", m.sport.emoji(), m.label(), verdict, m.sport.checkpoint_label());
                0
            }
            None => 0,
        }
    }

    // ── Stav ────────────────────────────────────────────────────────────────

    async fn advance(&self, id: &str, to: MatchStatus, reason: Option<&str>) -> bool {
        match self.registry.advance_status(id, to, Utc::now()).await {
            Ok(prev) if prev != to => {
                self.status_event(id, prev.as_str(), to, reason);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    async fn abandon(&self, id: &str, reason: &str) {
        let before = self.registry.get(id).await.map(|m| m.status);
        match self.registry.mark_abandoned(id, reason, Utc::now()).await {
            Ok(true) => {
                let from = before.map_or("open", |s| s.as_str());
                self.status_event(id, from, MatchStatus::Abandoned, Some(reason));
            }
            Ok(false) => {}
            Err(e) => warn!("{id}: abandon failed: {e}"),
        }
    }

    fn status_event(&self, id: &str, from: &str, to: MatchStatus, reason: Option<&str>) {
        self.events.log_quiet(&MatchStatusEvent {
            ts:       now_iso(),
            event:    "MATCH_STATUS",
            match_id: id.to_string(),
            from:     from.to_string(),
            to:       to.as_str().to_string(),
            reason:   reason.map(str::to_string),
        });
    }

    fn feed_event(&self, sport: Sport, stage: &str, ok: bool, items: usize, error: Option<String>) {
        self.events.log_quiet(&FeedStatusEvent {
            ts:    now_iso(),
            event: "FEED_STATUS",
            sport: sport.as_str().to_string(),
            stage: stage.to_string(),
            ok,
            items,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alert_dispatcher::{AlertSender, DeliveryError, RoutingConfig, StaticSubscriptions, SubscriptionRouter};
    use async_trait::async_trait;
    use odds_feed::parse::tennis_sets_won;
    use odds_feed::UpcomingBatch;
    use sports_core::{NotificationRecord, PeriodMarker, RetryPolicy, Score, Side, Surface};
    use std::collections::{HashMap, VecDeque};

    type Script = VecDeque<Result<LiveFetch, FeedError>>;

    #[derive(Default)]
    struct FakeFeed {
        upcoming: Mutex<HashMap<Sport, Vec<MatchSeed>>>,
        live:     Mutex<HashMap<String, Script>>,
        delay:    Mutex<HashMap<String, Duration>>,
        calls:    Mutex<HashMap<String, u32>>,
    }

    impl FakeFeed {
        fn add(&self, seed: MatchSeed, script: Vec<Result<LiveFetch, FeedError>>) {
            self.live.lock().unwrap().insert(seed.id.clone(), script.into());
            self.upcoming.lock().unwrap().entry(seed.sport).or_default().push(seed);
        }

        fn calls(&self, id: &str) -> u32 {
            self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl OddsFeed for FakeFeed {
        async fn fetch_upcoming(&self, sport: Sport) -> Result<UpcomingBatch, FeedError> {
            let seeds = self.upcoming.lock().unwrap().get(&sport).cloned().unwrap_or_default();
            Ok(UpcomingBatch { seeds, ..UpcomingBatch::default() })
        }

        async fn fetch_live(&self, match_id: &str, _sport: Sport) -> Result<LiveFetch, FeedError> {
            *self.calls.lock().unwrap().entry(match_id.to_string()).or_default() += 1;
            let delay = self.delay.lock().unwrap().get(match_id).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            // poslední položka skriptu se opakuje
            let mut live = self.live.lock().unwrap();
            match live.get_mut(match_id) {
                Some(script) if script.len() > 1 => script.pop_front().unwrap_or(Ok(LiveFetch::NotFound)),
                Some(script) => script.front().cloned().unwrap_or(Ok(LiveFetch::NotFound)),
                None => Ok(LiveFetch::NotFound),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingSender {
        fn to(&self, chat: &str) -> Vec<String> {
            self.sent.lock().unwrap().iter().filter(|(c, _)| c == chat).map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl AlertSender for RecordingSender {
        async fn send(&self, chat: &str, text: &str) -> Result<(), DeliveryError> {
            self.sent.lock().unwrap().push((chat.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn settings(budget: Duration) -> TrackerSettings {
        TrackerSettings {
            sports:           Sport::ALL.to_vec(),
            discovery_every:  10,
            cycle_budget:     budget,
            start_lead:       chrono::Duration::minutes(5),
            max_missed_polls: 2,
            sweep:            SweepConfig::default(),
        }
    }

    fn build(feed: Arc<FakeFeed>, registry: Arc<MatchRegistry>, settings: TrackerSettings) -> (Tracker, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        let router = SubscriptionRouter::new(RoutingConfig {
            premium_channel: Some("@premium".into()),
            free_channel:    Some("@free".into()),
            per_user:        false,
        });
        let dispatcher = Dispatcher::new(registry.clone(), router, Arc::new(StaticSubscriptions::default()), sender.clone())
            .with_retry(RetryPolicy::new(1, Duration::from_millis(1)), Duration::from_secs(1));
        let events = Arc::new(EventLogger::new(std::env::temp_dir().join("trailwatch_tracker_tests")));
        let tracker = Tracker::new(feed, registry, Arc::new(dispatcher), events, settings);
        (tracker, sender)
    }

    fn seed(id: &str, sport: Sport, home: &str, odds: (f64, f64), start_in_mins: i64) -> MatchSeed {
        MatchSeed {
            id:              id.to_string(),
            sport,
            league:          "Test League".to_string(),
            home:            home.to_string(),
            away:            format!("{home} Rival"),
            scheduled_start: Utc::now() + chrono::Duration::minutes(start_in_mins),
            odds:            Some(MoneylineOdds::two_way(odds.0, odds.1)),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(secs)
    }

    fn tennis(secs: i64, sets: &[(u32, u32)]) -> Result<LiveFetch, FeedError> {
        let set_scores: Vec<Score> = sets.iter().map(|&(h, a)| Score::new(h, a)).collect();
        Ok(LiveFetch::Snapshot(OddsSnapshot {
            fetched_at:      at(secs),
            phase:           FeedPhase::InPlay,
            score:           tennis_sets_won(&set_scores, false),
            period:          PeriodMarker::new(set_scores.len() as u8, false),
            set_scores,
            elapsed_minutes: 0,
            live_odds:       None,
        }))
    }

    fn court(secs: i64, phase: FeedPhase, score: (u32, u32), period: PeriodMarker) -> Result<LiveFetch, FeedError> {
        Ok(LiveFetch::Snapshot(OddsSnapshot {
            fetched_at:      at(secs),
            phase,
            score:           Score::new(score.0, score.1),
            set_scores:      vec![],
            period,
            elapsed_minutes: 10,
            live_odds:       Some(MoneylineOdds::two_way(2.4, 1.6)),
        }))
    }

    async fn status(registry: &MatchRegistry, id: &str) -> MatchStatus {
        registry.get(id).await.map(|m| m.status).unwrap_or(MatchStatus::Abandoned)
    }

    #[tokio::test]
    async fn tennis_favorite_losing_first_set_alerts_once() {
        let feed = Arc::new(FakeFeed::default());
        feed.add(
            seed("t1", Sport::Tennis, "Sinner", (1.50, 2.50), 2),
            vec![tennis(1, &[(3, 2)]), tennis(2, &[(4, 6)]), tennis(3, &[(4, 6), (1, 0)])],
        );
        let registry = Arc::new(MatchRegistry::in_memory());
        let (tracker, sender) = build(feed, registry.clone(), settings(Duration::from_secs(2)));

        let c1 = tracker.run_cycle(1).await;
        assert_eq!(c1.discovered, 1);
        assert_eq!(c1.alerts, 1);
        assert_eq!(status(&registry, "t1").await, MatchStatus::Live);

        let c2 = tracker.run_cycle(2).await;
        assert_eq!(c2.alerts, 1);
        assert_eq!(status(&registry, "t1").await, MatchStatus::CheckpointReached);

        let c3 = tracker.run_cycle(3).await;
        assert_eq!(c3.alerts, 0);

        let premium = sender.to("@premium");
        assert_eq!(premium.len(), 1);
        assert!(premium[0].contains("FAVORITE TRAILING AT FIRST SET"));
        assert_eq!(sender.to("@free").len(), 1);
    }

    #[tokio::test]
    async fn tennis_favorite_winning_first_set_is_silent() {
        let feed = Arc::new(FakeFeed::default());
        feed.add(seed("t2", Sport::Tennis, "Alcaraz", (1.50, 2.50), 2), vec![tennis(1, &[(3, 3)]), tennis(2, &[(6, 4)])]);
        let registry = Arc::new(MatchRegistry::in_memory());
        let (tracker, sender) = build(feed, registry.clone(), settings(Duration::from_secs(2)));

        tracker.run_cycle(1).await;
        tracker.run_cycle(2).await;

        assert!(sender.to("@premium").is_empty());
        assert_eq!(status(&registry, "t2").await, MatchStatus::CheckpointReached);
    }

    #[tokio::test]
    async fn basketball_halftime_deficit_alerts_but_tie_does_not() {
        let feed = Arc::new(FakeFeed::default());
        let q2 = PeriodMarker::new(2, false);
        let ht = PeriodMarker::new(2, true);
        feed.add(
            seed("b1", Sport::Basketball, "Lakers", (1.80, 2.00), 2),
            vec![court(1, FeedPhase::InPlay, (30, 31), q2), court(2, FeedPhase::InPlay, (40, 45), ht)],
        );
        feed.add(
            seed("b2", Sport::Basketball, "Bulls", (1.80, 2.00), 2),
            vec![court(1, FeedPhase::InPlay, (30, 31), q2), court(2, FeedPhase::InPlay, (45, 45), ht)],
        );
        let registry = Arc::new(MatchRegistry::in_memory());
        let (tracker, sender) = build(feed, registry.clone(), settings(Duration::from_secs(2)));

        tracker.run_cycle(1).await;
        tracker.run_cycle(2).await;

        let premium = sender.to("@premium");
        assert_eq!(premium.len(), 1);
        assert!(premium[0].contains("Lakers vs Lakers Rival"));
        assert!(premium[0].contains("HALFTIME"));
        assert_eq!(status(&registry, "b2").await, MatchStatus::CheckpointReached);
    }

    #[tokio::test]
    async fn pick_em_match_never_alerts() {
        let feed = Arc::new(FakeFeed::default());
        feed.add(
            seed("h1", Sport::Handball, "Kiel", (1.90, 1.90), 2),
            vec![court(1, FeedPhase::InPlay, (5, 6), PeriodMarker::new(1, false)), court(2, FeedPhase::InPlay, (12, 16), PeriodMarker::new(1, true))],
        );
        let registry = Arc::new(MatchRegistry::in_memory());
        let (tracker, sender) = build(feed, registry.clone(), settings(Duration::from_secs(2)));

        tracker.run_cycle(1).await;
        tracker.run_cycle(2).await;

        assert_eq!(registry.get("h1").await.unwrap().favorite, Some(Favorite::Unknown));
        assert!(sender.to("@premium").is_empty());
    }

    #[tokio::test]
    async fn slow_fetch_does_not_block_other_matches() {
        let feed = Arc::new(FakeFeed::default());
        let live = court(1, FeedPhase::InPlay, (2, 0), PeriodMarker::new(1, false));
        feed.add(seed("slow", Sport::Basketball, "Slow", (1.5, 2.5), 2), vec![live.clone()]);
        feed.add(seed("fast", Sport::Basketball, "Fast", (1.5, 2.5), 2), vec![live]);
        feed.delay.lock().unwrap().insert("slow".into(), Duration::from_millis(300));
        let registry = Arc::new(MatchRegistry::in_memory());
        let (tracker, _sender) = build(feed.clone(), registry.clone(), settings(Duration::from_millis(50)));

        let c1 = tracker.run_cycle(1).await;
        assert_eq!(c1.timed_out, 1);
        assert_eq!(status(&registry, "fast").await, MatchStatus::Live);

        let c2 = tracker.run_cycle(2).await;
        assert_eq!(c2.in_flight_skipped, 1);
        assert_eq!(feed.calls("slow"), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(status(&registry, "slow").await, MatchStatus::Live);
        let c3 = tracker.run_cycle(3).await;
        assert_eq!(c3.in_flight_skipped, 0);
        assert_eq!(feed.calls("slow"), 2);
    }

    #[tokio::test]
    async fn transient_error_is_retried_next_cycle() {
        let feed = Arc::new(FakeFeed::default());
        feed.add(
            seed("x", Sport::Handball, "Flaky", (1.5, 2.5), 2),
            vec![Err(FeedError::Transient("timeout".into())), court(1, FeedPhase::InPlay, (1, 0), PeriodMarker::new(1, false))],
        );
        let registry = Arc::new(MatchRegistry::in_memory());
        let (tracker, _sender) = build(feed, registry.clone(), settings(Duration::from_secs(2)));

        let c1 = tracker.run_cycle(1).await;
        assert_eq!(c1.failed, 1);
        assert_eq!(status(&registry, "x").await, MatchStatus::Scheduled);

        let c2 = tracker.run_cycle(2).await;
        assert_eq!(c2.failed, 0);
        assert_eq!(status(&registry, "x").await, MatchStatus::Live);
    }

    #[tokio::test]
    async fn rehydrated_record_prevents_refire() {
        let now = Utc::now();
        let mut m = Match::from_seed(seed("r1", Sport::Basketball, "Celtics", (1.8, 2.0), -60), now);
        m.status = MatchStatus::Live;
        m.favorite = Some(Favorite::Side(Side::Home));
        let record = NotificationRecord {
            match_id: "r1".into(),
            rule:     RuleId::FavoriteTrailing,
            fired_at: now,
            surface:  Surface::Premium,
        };
        let registry = Arc::new(MatchRegistry::in_memory());
        registry.rehydrate(vec![m], vec![record], now).await;

        let feed = Arc::new(FakeFeed::default());
        feed.live.lock().unwrap().insert(
            "r1".into(),
            vec![court(1, FeedPhase::InPlay, (40, 52), PeriodMarker::new(2, true))].into(),
        );
        let (tracker, sender) = build(feed, registry.clone(), settings(Duration::from_secs(2)));

        let c1 = tracker.run_cycle(1).await;
        assert_eq!(c1.alerts, 0);
        assert!(sender.to("@premium").is_empty());
        assert_eq!(status(&registry, "r1").await, MatchStatus::CheckpointReached);
    }

    #[tokio::test]
    async fn never_live_match_is_abandoned_silently() {
        let feed = Arc::new(FakeFeed::default());
        feed.add(
            seed("ghost", Sport::Tennis, "Ghost", (1.5, 2.5), 2),
            vec![Ok(LiveFetch::Snapshot(OddsSnapshot {
                fetched_at:      at(1),
                phase:           FeedPhase::NotStarted,
                score:           Score::default(),
                set_scores:      vec![],
                period:          PeriodMarker::default(),
                elapsed_minutes: 0,
                live_odds:       None,
            }))],
        );
        let registry = Arc::new(MatchRegistry::in_memory());
        let (tracker, sender) = build(feed.clone(), registry.clone(), settings(Duration::from_secs(2)));

        // v okně před startem se polluje, ale feed pořád hlásí NotStarted
        let c1 = tracker.run_cycle(1).await;
        assert_eq!(c1.polled, 1);
        assert_eq!(c1.alerts, 0);
        assert_eq!(feed.calls("ghost"), 1);
        assert_eq!(status(&registry, "ghost").await, MatchStatus::Scheduled);

        let sweep = registry.sweep(Utc::now() + chrono::Duration::hours(4), &SweepConfig::default()).await;
        assert_eq!(sweep.abandoned, vec!["ghost".to_string()]);
        assert_eq!(status(&registry, "ghost").await, MatchStatus::Abandoned);
        assert!(sender.sent.lock().unwrap().is_empty());
        assert!(registry.get("ghost").await.unwrap().fired.is_empty());
    }

    #[tokio::test]
    async fn start_notification_waits_for_live_transition() {
        let feed = Arc::new(FakeFeed::default());
        let not_started = court(1, FeedPhase::NotStarted, (0, 0), PeriodMarker::default());
        feed.add(
            seed("s1", Sport::Handball, "Veszprem", (1.4, 3.0), 2),
            vec![not_started, court(2, FeedPhase::InPlay, (1, 0), PeriodMarker::new(1, false))],
        );
        let registry = Arc::new(MatchRegistry::in_memory());
        let (tracker, sender) = build(feed, registry.clone(), settings(Duration::from_secs(2)));

        let c1 = tracker.run_cycle(1).await;
        assert_eq!(c1.alerts, 0);
        assert!(sender.to("@free").is_empty());

        let c2 = tracker.run_cycle(2).await;
        assert_eq!(c2.alerts, 1);
        assert_eq!(status(&registry, "s1").await, MatchStatus::Live);
        assert_eq!(sender.to("@free").len(), 1);

        tracker.run_cycle(3).await;
        assert_eq!(sender.to("@free").len(), 1);
    }

    #[tokio::test]
    async fn feed_jumping_to_ended_closes_without_alert() {
        let feed = Arc::new(FakeFeed::default());
        feed.add(
            seed("e1", Sport::Basketball, "Heat", (1.4, 3.0), 2),
            vec![court(1, FeedPhase::Ended, (80, 95), PeriodMarker::new(4, false))],
        );
        let registry = Arc::new(MatchRegistry::in_memory());
        let (tracker, sender) = build(feed, registry.clone(), settings(Duration::from_secs(2)));

        tracker.run_cycle(1).await;
        assert_eq!(status(&registry, "e1").await, MatchStatus::Finished);
        assert!(sender.to("@premium").is_empty());
    }

    #[tokio::test]
    async fn malformed_and_vanished_matches_are_closed() {
        let feed = Arc::new(FakeFeed::default());
        feed.add(
            seed("bad", Sport::Handball, "Broken", (1.5, 2.5), 2),
            vec![Err(FeedError::Malformed { match_id: "bad".into(), reason: "invalid score 'x'".into() })],
        );
        feed.add(
            seed("gone", Sport::Handball, "Gone", (1.5, 2.5), 2),
            vec![court(1, FeedPhase::InPlay, (3, 2), PeriodMarker::new(1, false)), Ok(LiveFetch::NotFound)],
        );
        let registry = Arc::new(MatchRegistry::in_memory());
        let (tracker, _sender) = build(feed, registry.clone(), settings(Duration::from_secs(2)));

        tracker.run_cycle(1).await;
        assert_eq!(status(&registry, "bad").await, MatchStatus::Abandoned);
        assert_eq!(status(&registry, "gone").await, MatchStatus::Live);

        tracker.run_cycle(2).await;
        tracker.run_cycle(3).await;
        assert_eq!(status(&registry, "gone").await, MatchStatus::Finished);
    }
}
