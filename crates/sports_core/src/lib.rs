/// TrailWatch — sdílený model
///
/// Typy, které si mezi sebou předávají feed klient, registry, detektor
/// a dispatcher. Žádné I/O, jen data + pár pomocných metod.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod retry;

pub use retry::RetryPolicy;

/// Hodnota z DB / env, kterou neumíme namapovat na enum.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown value '{0}'")]
pub struct UnknownValue(pub String);

// ── Sport ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sport {
    Tennis,
    Basketball,
    Handball,
}

impl Sport {
    pub const ALL: [Sport; 3] = [Sport::Tennis, Sport::Basketball, Sport::Handball];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sport::Tennis     => "tennis",
            Sport::Basketball => "basketball",
            Sport::Handball   => "handball",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Sport::Tennis     => "🎾",
            Sport::Basketball => "🏀",
            Sport::Handball   => "🤾",
        }
    }

    /// Bet365 sport_id
    pub fn feed_id(&self) -> u32 {
        match self {
            Sport::Tennis     => 13,
            Sport::Basketball => 18,
            Sport::Handball   => 78,
        }
    }

    /// Délka jedné periody v minutách. Tenis nemá čas.
    pub fn period_minutes(&self) -> Option<u32> {
        match self {
            Sport::Tennis     => None,
            Sport::Basketball => Some(12),
            Sport::Handball   => Some(30),
        }
    }

    /// Kdy se vyhodnocuje "favorit prohrává"
    pub fn checkpoint_label(&self) -> &'static str {
        match self {
            Sport::Tennis => "FIRST SET",
            _             => "HALFTIME",
        }
    }
}

impl fmt::Display for Sport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sport {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tennis"     => Ok(Sport::Tennis),
            "basketball" => Ok(Sport::Basketball),
            "handball"   => Ok(Sport::Handball),
            other        => Err(UnknownValue(other.to_string())),
        }
    }
}

// ── Side / Favorite ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Home,
    Away,
}

impl Side {
    pub fn opponent(&self) -> Side {
        match self {
            Side::Home => Side::Away,
            Side::Away => Side::Home,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Home => "home",
            Side::Away => "away",
        }
    }
}

/// Výsledek klasifikace pre-match kurzů. `Unknown` = pick'em, žádný alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Favorite {
    Side(Side),
    Unknown,
}

impl Favorite {
    pub fn side(&self) -> Option<Side> {
        match self {
            Favorite::Side(s) => Some(*s),
            Favorite::Unknown => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Favorite::Side(s) => s.as_str(),
            Favorite::Unknown => "unknown",
        }
    }
}

// ── Match status ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Scheduled,
    Live,
    CheckpointReached,
    Finished,
    Abandoned,
}

impl MatchStatus {
    fn rank(&self) -> u8 {
        match self {
            MatchStatus::Scheduled         => 0,
            MatchStatus::Live              => 1,
            MatchStatus::CheckpointReached => 2,
            MatchStatus::Finished          => 3,
            MatchStatus::Abandoned         => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchStatus::Finished | MatchStatus::Abandoned)
    }

    pub fn is_in_play(&self) -> bool {
        matches!(self, MatchStatus::Live | MatchStatus::CheckpointReached)
    }

    /// Stav se nikdy nevrací. Stejný stav = no-op, terminální stav je konečný.
    pub fn can_advance_to(&self, next: MatchStatus) -> bool {
        if *self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Scheduled         => "scheduled",
            MatchStatus::Live              => "live",
            MatchStatus::CheckpointReached => "checkpoint_reached",
            MatchStatus::Finished          => "finished",
            MatchStatus::Abandoned         => "abandoned",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled"          => Ok(MatchStatus::Scheduled),
            "live"               => Ok(MatchStatus::Live),
            "checkpoint_reached" => Ok(MatchStatus::CheckpointReached),
            "finished"           => Ok(MatchStatus::Finished),
            "abandoned"          => Ok(MatchStatus::Abandoned),
            other                => Err(UnknownValue(other.to_string())),
        }
    }
}

// ── Odds / score ────────────────────────────────────────────────────────────

/// Decimal kurzy 1/2 (+ volitelně X u three-way trhů)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoneylineOdds {
    pub home: f64,
    pub away: f64,
    pub draw: Option<f64>,
}

impl MoneylineOdds {
    pub fn two_way(home: f64, away: f64) -> Self {
        Self { home, away, draw: None }
    }

    pub fn for_side(&self, side: Side) -> f64 {
        match side {
            Side::Home => self.home,
            Side::Away => self.away,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Score {
    pub home: u32,
    pub away: u32,
}

impl Score {
    pub fn new(home: u32, away: u32) -> Self {
        Self { home, away }
    }

    pub fn for_side(&self, side: Side) -> u32 {
        match side {
            Side::Home => self.home,
            Side::Away => self.away,
        }
    }

    pub fn total(&self) -> u32 {
        self.home + self.away
    }

    /// Kdo vede, None při remíze
    pub fn leader(&self) -> Option<Side> {
        if self.home > self.away {
            Some(Side::Home)
        } else if self.away > self.home {
            Some(Side::Away)
        } else {
            None
        }
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.home, self.away)
    }
}

// ── Snapshot ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedPhase {
    NotStarted,
    InPlay,
    Ended,
    Cancelled,
}

impl FeedPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedPhase::NotStarted => "not_started",
            FeedPhase::InPlay     => "in_play",
            FeedPhase::Ended      => "ended",
            FeedPhase::Cancelled  => "cancelled",
        }
    }
}

/// Kde v zápase jsme. `period` = 0 před startem, `in_break` = přestávka po periodě `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeriodMarker {
    pub period:   u8,
    pub in_break: bool,
}

impl PeriodMarker {
    pub fn new(period: u8, in_break: bool) -> Self {
        Self { period, in_break }
    }

    /// Přestávka po periodě `n` nebo už některá pozdější perioda.
    pub fn is_past_period(&self, n: u8) -> bool {
        (self.period == n && self.in_break) || self.period > n
    }
}

/// Bod v čase pro jeden zápas. U tenisu `score` = sety, `set_scores` = gamy v setech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsSnapshot {
    pub fetched_at:      DateTime<Utc>,
    pub phase:           FeedPhase,
    pub score:           Score,
    #[serde(default)]
    pub set_scores:      Vec<Score>,
    pub period:          PeriodMarker,
    pub elapsed_minutes: u32,
    pub live_odds:       Option<MoneylineOdds>,
}

impl OddsSnapshot {
    /// Zápas opravdu běží (ne jen "inplay" flag s nulovým časem)
    pub fn has_started(&self) -> bool {
        self.phase == FeedPhase::InPlay
            && (self.elapsed_minutes > 0
                || self.period.period > 0
                || self.score.total() > 0
                || !self.set_scores.is_empty())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, FeedPhase::Ended | FeedPhase::Cancelled)
    }
}

/// Zápas tak, jak přišel z discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSeed {
    pub id:              String,
    pub sport:           Sport,
    pub league:          String,
    pub home:            String,
    pub away:            String,
    pub scheduled_start: DateTime<Utc>,
    pub odds:            Option<MoneylineOdds>,
}

// ── Notifikace ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    MatchStart,
    FavoriteTrailing,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::MatchStart       => "match_start",
            RuleId::FavoriteTrailing => "favorite_trailing",
        }
    }

    pub fn surface(&self) -> Surface {
        match self {
            RuleId::MatchStart       => Surface::Free,
            RuleId::FavoriteTrailing => Surface::Premium,
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleId {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "match_start"       => Ok(RuleId::MatchStart),
            // starší záznamy
            "favorite_trailing" | "halftime_trailing" => Ok(RuleId::FavoriteTrailing),
            other               => Err(UnknownValue(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    Free,
    Premium,
}

impl Surface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Surface::Free    => "free",
            Surface::Premium => "premium",
        }
    }
}

impl FromStr for Surface {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free"    => Ok(Surface::Free),
            "premium" => Ok(Surface::Premium),
            other     => Err(UnknownValue(other.to_string())),
        }
    }
}

/// Idempotency záznam, max jeden na (match_id, rule)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub match_id: String,
    pub rule:     RuleId,
    pub fired_at: DateTime<Utc>,
    pub surface:  Surface,
}
