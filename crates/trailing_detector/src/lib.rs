//! Trailing detector — "favorit prohrává" pro tenis, basketbal a házenou
//! Pravidlová tabulka místo rozházených ifů: sport → (checkpoint, trailing).
//!
//! - Tenis: checkpoint = dohraný 1. set, favorit ho prohrál
//! - Basketbal / házená: checkpoint = poločas, favorit má méně bodů (remíza = nic)
//!
//! Vyhodnocuje se hranově: jen snapshot, který checkpoint překročil jako první.

use serde::Serialize;
use sports_core::{Favorite, MoneylineOdds, OddsSnapshot, Side, Sport};

/// Favorit = strana s ostře nižším decimal kurzem. Remízový kurz (three-way)
/// o favoritovi nerozhoduje. Stejné nebo nesmyslné kurzy → `Unknown`.
pub fn classify(odds: &MoneylineOdds) -> Favorite {
    let valid = |o: f64| o.is_finite() && o > 1.0;
    if !valid(odds.home) || !valid(odds.away) {
        return Favorite::Unknown;
    }

    if odds.home < odds.away {
        Favorite::Side(Side::Home)
    } else if odds.away < odds.home {
        Favorite::Side(Side::Away)
    } else {
        Favorite::Unknown
    }
}

/// Výsledek vyhodnocení na checkpointu
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Trailing,
    NotTrailing,
    /// Checkpoint nastal, ale ze snapshotu nejde poznat kdo vede (díra ve feedu)
    Undetermined,
}

impl Verdict {
    pub fn is_alert(&self) -> bool {
        matches!(self, Verdict::Trailing)
    }
}

/// Jeden řádek pravidlové tabulky
pub struct SportRule {
    pub sport:      Sport,
    pub checkpoint: fn(&OddsSnapshot) -> bool,
    /// Some(true) = favorit prohrává, None = nejde určit
    pub trailing:   fn(&OddsSnapshot, Side) -> Option<bool>,
}

static TENNIS: SportRule = SportRule {
    sport:      Sport::Tennis,
    checkpoint: tennis_first_set_done,
    trailing:   tennis_favorite_lost_first_set,
};

static BASKETBALL: SportRule = SportRule {
    sport:      Sport::Basketball,
    checkpoint: basketball_halftime,
    trailing:   behind_on_points,
};

static HANDBALL: SportRule = SportRule {
    sport:      Sport::Handball,
    checkpoint: handball_halftime,
    trailing:   behind_on_points,
};

pub fn rule_for(sport: Sport) -> &'static SportRule {
    match sport {
        Sport::Tennis     => &TENNIS,
        Sport::Basketball => &BASKETBALL,
        Sport::Handball   => &HANDBALL,
    }
}

// 4 čtvrtiny → poločas po 2. periodě
fn basketball_halftime(s: &OddsSnapshot) -> bool {
    s.period.is_past_period(2)
}

// 2 poločasy → přestávka po 1. periodě
fn handball_halftime(s: &OddsSnapshot) -> bool {
    s.period.is_past_period(1)
}

fn tennis_first_set_done(s: &OddsSnapshot) -> bool {
    s.score.total() >= 1 || s.set_scores.len() >= 2
}

/// Vítěz 1. setu: z gamů 1. setu, jinak ze setového skóre, pokud je jednoznačné.
pub fn tennis_first_set_winner(s: &OddsSnapshot) -> Option<Side> {
    if !tennis_first_set_done(s) {
        return None;
    }
    if let Some(winner) = s.set_scores.first().and_then(|first| first.leader()) {
        return Some(winner);
    }
    // bez gamů: 1:0 nebo x:0 říká jasně, kdo vyhrál první set
    match (s.score.home, s.score.away) {
        (h, 0) if h > 0 => Some(Side::Home),
        (0, a) if a > 0 => Some(Side::Away),
        _               => None,
    }
}

fn tennis_favorite_lost_first_set(s: &OddsSnapshot, favorite: Side) -> Option<bool> {
    tennis_first_set_winner(s).map(|winner| winner != favorite)
}

fn behind_on_points(s: &OddsSnapshot, favorite: Side) -> Option<bool> {
    Some(s.score.for_side(favorite) < s.score.for_side(favorite.opponent()))
}

/// Hranové vyhodnocení. `Some` jen pro první snapshot na/za checkpointem;
/// další polly po checkpointu i terminální snapshoty (konec, zrušeno) vrací `None`.
pub fn evaluate(
    sport:    Sport,
    favorite: Side,
    previous: Option<&OddsSnapshot>,
    current:  &OddsSnapshot,
) -> Option<Verdict> {
    if current.is_terminal() {
        return None;
    }

    let rule = rule_for(sport);
    if !(rule.checkpoint)(current) {
        return None;
    }
    if previous.map_or(false, |p| !p.is_terminal() && (rule.checkpoint)(p)) {
        return None;
    }

    Some(match (rule.trailing)(current, favorite) {
        Some(true)  => Verdict::Trailing,
        Some(false) => Verdict::NotTrailing,
        None        => Verdict::Undetermined,
    })
}

/// Lidsky čitelný důvod alertu
pub fn describe(sport: Sport, favorite: Side, snapshot: &OddsSnapshot) -> String {
    match sport {
        Sport::Tennis => {
            let first = snapshot.set_scores.first().copied().unwrap_or(snapshot.score);
            format!(
                "Favorite ({}) lost the first set {}-{}",
                favorite.as_str(),
                first.for_side(favorite),
                first.for_side(favorite.opponent()),
            )
        }
        _ => format!(
            "Favorite ({}) trails {}-{} at halftime",
            favorite.as_str(),
            snapshot.score.for_side(favorite),
            snapshot.score.for_side(favorite.opponent()),
        ),
    }
}
