//! B365 JSON → sports_core typy. Bez I/O, testuje se na fixtures.
//!
//! Feed vrací čísla střídavě jako string i number, proto všude `loose_*`.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sports_core::{FeedPhase, MatchSeed, MoneylineOdds, OddsSnapshot, PeriodMarker, Score, Sport};

/// Upcoming zápas bez kurzů (ty se tahají zvlášť přes prematch)
#[derive(Debug, Clone, PartialEq)]
pub struct UpcomingEvent {
    pub id:              String,
    pub league:          String,
    pub home:            String,
    pub away:            String,
    pub scheduled_start: DateTime<Utc>,
}

impl UpcomingEvent {
    pub fn into_seed(self, sport: Sport, odds: Option<MoneylineOdds>) -> MatchSeed {
        MatchSeed {
            id: self.id,
            sport,
            league: self.league,
            home: self.home,
            away: self.away,
            scheduled_start: self.scheduled_start,
            odds,
        }
    }
}

// Moneyline trhy v `main.sp`, v pořadí preference
const TENNIS_MARKETS: &[&str]     = &["to_win_match"];
const BASKETBALL_MARKETS: &[&str] = &["game_lines", "money_line", "to_win_match"];
const HANDBALL_MARKETS: &[&str]   = &["full_time_result", "game_lines", "to_win_match"];

fn markets_for(sport: Sport) -> &'static [&'static str] {
    match sport {
        Sport::Tennis     => TENNIS_MARKETS,
        Sport::Basketball => BASKETBALL_MARKETS,
        Sport::Handball   => HANDBALL_MARKETS,
    }
}

fn loose_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn loose_u32(v: &Value) -> Option<u32> {
    match v {
        Value::Number(n) => n.as_u64().and_then(|x| u32::try_from(x).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Decimal ("1.50") i fractional ("5/2" → 3.5). Mimo rozsah 1.01–1000 → None.
pub fn parse_decimal_odds(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let val = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den + 1.0
        }
        None => raw.parse().ok()?,
    };

    if val.is_finite() && (1.01..=1000.0).contains(&val) {
        Some(val)
    } else {
        None
    }
}

/// "45-40", "45:40", "45 - 40"
pub fn parse_score_pair(raw: &str) -> Option<Score> {
    let (h, a) = raw.split_once('-').or_else(|| raw.split_once(':'))?;
    Some(Score::new(h.trim().parse().ok()?, a.trim().parse().ok()?))
}

/// Set je dohraný: 6+ gamů s rozdílem 2, nebo 7 (tiebreak)
pub fn tennis_set_complete(set: &Score) -> bool {
    let (hi, lo) = if set.home >= set.away { (set.home, set.away) } else { (set.away, set.home) };
    (hi >= 6 && hi - lo >= 2) || hi == 7
}

/// "6-4,3-2" → [6-4, 3-2]
pub fn parse_tennis_sets(raw: &str) -> Result<Vec<Score>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_score_pair(s).ok_or_else(|| format!("invalid set score '{s}'")))
        .collect()
}

/// Počet vyhraných setů. Poslední set se počítá jen pokud je dohraný nebo zápas skončil.
pub fn tennis_sets_won(sets: &[Score], finished: bool) -> Score {
    let mut won = Score::default();
    for (i, set) in sets.iter().enumerate() {
        let is_last = i + 1 == sets.len();
        if !tennis_set_complete(set) && !(finished && is_last) {
            continue;
        }
        match set.leader() {
            Some(sports_core::Side::Home) => won.home += 1,
            Some(sports_core::Side::Away) => won.away += 1,
            None => {}
        }
    }
    won
}

pub fn parse_upcoming(results: &Value) -> Vec<Result<UpcomingEvent, (String, String)>> {
    let items = match results.as_array() {
        Some(items) => items,
        None => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| {
            // bez id nejde nic ani abandonovat
            let id = item.get("id").and_then(loose_string).filter(|s| !s.is_empty())?;
            Some(parse_upcoming_item(&id, item).map_err(|reason| (id, reason)))
        })
        .collect()
}

fn parse_upcoming_item(id: &str, item: &Value) -> Result<UpcomingEvent, String> {
    let ts = item
        .get("time")
        .and_then(loose_string)
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or("missing start time")?;
    let scheduled_start = Utc.timestamp_opt(ts, 0).single().ok_or("start time out of range")?;

    let team = |key: &str| {
        item.get(key)
            .and_then(|t| t.get("name"))
            .and_then(|n| n.as_str())
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
    };
    let home = team("home").ok_or("missing home team name")?;
    let away = team("away").ok_or("missing away team name")?;
    let league = item
        .pointer("/league/name")
        .and_then(|n| n.as_str())
        .unwrap_or("Unknown League")
        .to_string();

    Ok(UpcomingEvent { id: id.to_string(), league, home, away, scheduled_start })
}

/// Pre-match moneyline z `/v3/bet365/prematch`. Chybějící trh = `Ok(None)`
/// (kurzy ještě nejsou vypsané), rozbitý trh = `Err`.
pub fn parse_prematch_odds(sport: Sport, results: &Value) -> Result<Option<MoneylineOdds>, String> {
    let sp = match results
        .as_array()
        .and_then(|a| a.first())
        .and_then(|first| first.pointer("/main/sp"))
    {
        Some(sp) => sp,
        None => return Ok(None),
    };

    for key in markets_for(sport) {
        let entries = sp.get(*key).and_then(|m| m.get("odds")).and_then(|o| o.as_array());
        if let Some(entries) = entries.filter(|e| !e.is_empty()) {
            return extract_moneyline(entries).map(Some);
        }
    }
    Ok(None)
}

/// Z pole odds položek vytáhne 1 / 2 / X. Podle `header`/`name`, jinak pozičně (home, away, draw).
pub fn extract_moneyline(entries: &[Value]) -> Result<MoneylineOdds, String> {
    let is_money_line = |e: &Value| {
        e.get("name")
            .and_then(|n| n.as_str())
            .map_or(false, |n| n.trim().eq_ignore_ascii_case("money line"))
    };
    // game_lines míchá Money Line se Spread/Total
    let picked: Vec<&Value> = if entries.iter().any(is_money_line) {
        entries.iter().filter(|e| is_money_line(e)).collect()
    } else {
        entries.iter().collect()
    };

    let (mut home, mut away, mut draw) = (None, None, None);
    let mut positional = Vec::new();

    for entry in picked {
        let raw = entry.get("odds").and_then(loose_string).ok_or("odds entry without price")?;
        let price = parse_decimal_odds(&raw).ok_or_else(|| format!("invalid odds '{raw}'"))?;

        let label = entry
            .get("header")
            .and_then(loose_string)
            .or_else(|| entry.get("name").and_then(loose_string))
            .map(|l| l.to_lowercase());

        match label.as_deref() {
            Some("1") | Some("home")                => home = Some(price),
            Some("2") | Some("away")                => away = Some(price),
            Some("x") | Some("draw") | Some("tie")  => draw = Some(price),
            _                                       => positional.push(price),
        }
    }

    let mut rest = positional.into_iter();
    let home = home.or_else(|| rest.next());
    let away = away.or_else(|| rest.next());
    let draw = draw.or_else(|| rest.next());

    match (home, away) {
        (Some(home), Some(away)) => Ok(MoneylineOdds { home, away, draw }),
        _ => Err("moneyline market without both sides".to_string()),
    }
}

fn phase_from_status(status: &str) -> Option<FeedPhase> {
    match status {
        "0" | "2"              => Some(FeedPhase::NotStarted),
        "1" | "7"              => Some(FeedPhase::InPlay),
        "3" | "6" | "9"        => Some(FeedPhase::Ended),
        "4" | "5" | "8" | "99" => Some(FeedPhase::Cancelled),
        _                      => None,
    }
}

/// Perioda pro basketbal/házenou: timer.q → klíče v `scores` → odhad z uplynulých minut.
fn period_marker(sport: Sport, ev: &Value, elapsed: u32) -> PeriodMarker {
    let periods_total: u32 = match sport {
        Sport::Basketball => 4,
        Sport::Handball   => 2,
        Sport::Tennis     => return PeriodMarker::default(),
    };
    let timer = ev.get("timer");

    let explicit = timer.and_then(|t| t.get("q")).and_then(loose_u32).filter(|q| *q > 0);
    let from_scores = ev
        .get("scores")
        .and_then(|s| s.as_object())
        .and_then(|m| {
            m.keys()
                .filter_map(|k| k.parse::<u32>().ok())
                .filter(|k| (1..=periods_total).contains(k))
                .max()
        });
    let from_clock = sport
        .period_minutes()
        .filter(|_| elapsed > 0)
        .map(|len| (elapsed / len + 1).min(periods_total));

    let period = explicit.or(from_scores).or(from_clock).unwrap_or(0);

    let clock_stopped = timer
        .and_then(|t| t.get("tt"))
        .and_then(loose_string)
        .map_or(false, |tt| tt == "0");
    let secs = timer.and_then(|t| t.get("ts")).and_then(loose_u32).unwrap_or(0);
    // odpočítávané hodiny na nule, nebo přičítané na konci periody
    let countdown_done = elapsed == 0 && secs == 0;
    let count_up_done = sport.period_minutes().map_or(false, |len| period > 0 && elapsed >= len * period);
    let in_break = period > 0 && clock_stopped && (countdown_done || count_up_done);

    PeriodMarker::new(u8::try_from(period).unwrap_or(u8::MAX), in_break)
}

/// Live snapshot z `/v1/event/view`. `Ok(None)` = feed zápas nezná.
pub fn parse_event_view(
    sport:      Sport,
    results:    &Value,
    fetched_at: DateTime<Utc>,
) -> Result<Option<OddsSnapshot>, String> {
    let ev = match results.as_array().and_then(|a| a.first()) {
        Some(ev) if ev.is_object() => ev,
        _ => return Ok(None),
    };

    let status = ev.get("time_status").and_then(loose_string).ok_or("missing time_status")?;
    let phase = phase_from_status(&status).ok_or_else(|| format!("unknown time_status '{status}'"))?;

    let ss = ev
        .get("ss")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let elapsed = ev
        .get("timer")
        .and_then(|t| t.get("tm"))
        .and_then(loose_u32)
        .unwrap_or(0);

    let (score, set_scores, period) = match sport {
        Sport::Tennis => {
            let sets = match ss {
                Some(raw) => parse_tennis_sets(raw)?,
                None => Vec::new(),
            };
            let won = tennis_sets_won(&sets, phase == FeedPhase::Ended);
            let current_set = u8::try_from(sets.len()).unwrap_or(u8::MAX);
            (won, sets, PeriodMarker::new(current_set, false))
        }
        _ => {
            let score = match ss {
                Some(raw) => parse_score_pair(raw).ok_or_else(|| format!("invalid score '{raw}'"))?,
                None => Score::default(),
            };
            (score, Vec::new(), period_marker(sport, ev, elapsed))
        }
    };

    let live_odds = ev
        .get("odds")
        .and_then(|o| o.as_array())
        .and_then(|a| extract_moneyline(a).ok());

    Ok(Some(OddsSnapshot {
        fetched_at,
        phase,
        score,
        set_scores,
        period,
        elapsed_minutes: elapsed,
        live_odds,
    }))
}
