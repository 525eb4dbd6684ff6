//! Texty notifikací (Telegram HTML)

use chrono::{DateTime, Utc};
use match_registry::Match;
use serde::Serialize;
use sports_core::{Favorite, MoneylineOdds, RuleId, Score, Side, Sport};

/// Co se do zprávy dostane. Skládá se z `Match` v okamžiku odpálení.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertPayload {
    pub sport:           Sport,
    pub league:          String,
    pub home:            String,
    pub away:            String,
    pub scheduled_start: DateTime<Utc>,
    pub pre_match_odds:  Option<MoneylineOdds>,
    pub favorite:        Favorite,
    pub score:           Option<Score>,
    pub set_scores:      Vec<Score>,
    pub live_odds:       Option<MoneylineOdds>,
    pub reason:          String,
}

impl AlertPayload {
    pub fn from_match(m: &Match, reason: impl Into<String>) -> Self {
        let latest = m.latest_snapshot();
        Self {
            sport:           m.sport,
            league:          m.league.clone(),
            home:            m.home.clone(),
            away:            m.away.clone(),
            scheduled_start: m.scheduled_start,
            pre_match_odds:  m.pre_match_odds,
            favorite:        m.favorite.unwrap_or(Favorite::Unknown),
            score:           latest.map(|s| s.score),
            set_scores:      latest.map(|s| s.set_scores.clone()).unwrap_or_default(),
            live_odds:       latest.and_then(|s| s.live_odds),
            reason:          reason.into(),
        }
    }

    fn team(&self, side: Side) -> &str {
        match side {
            Side::Home => &self.home,
            Side::Away => &self.away,
        }
    }
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub fn render(rule: RuleId, p: &AlertPayload) -> String {
    match rule {
        RuleId::MatchStart       => render_start(p),
        RuleId::FavoriteTrailing => render_trailing(p),
    }
}

fn odds_lines(out: &mut String, p: &AlertPayload, odds: &MoneylineOdds) {
    out.push_str(&format!("• {}: {:.2}\n", escape_html(&p.home), odds.home));
    out.push_str(&format!("• {}: {:.2}\n", escape_html(&p.away), odds.away));
    if let Some(draw) = odds.draw {
        out.push_str(&format!("• Draw: {draw:.2}\n"));
    }
}

fn render_start(p: &AlertPayload) -> String {
    let mut out = format!(
        "{} <b>MATCH STARTING SOON</b>\n\n<b>{} vs {}</b>\nLeague: {}\nStart: {} UTC\n\n",
        p.sport.emoji(),
        escape_html(&p.home),
        escape_html(&p.away),
        escape_html(&p.league),
        p.scheduled_start.format("%H:%M"),
    );

    match &p.pre_match_odds {
        Some(odds) => {
            out.push_str("<b>Pre-match Odds:</b>\n");
            odds_lines(&mut out, p, odds);
        }
        None => out.push_str("Pre-match odds not posted yet\n"),
    }

    match p.favorite.side() {
        Some(side) => out.push_str(&format!("\n<b>Favorite:</b> {}", escape_html(p.team(side)))),
        None if p.pre_match_odds.is_some() => out.push_str("\n<b>Favorite:</b> none (even odds)"),
        None => {}
    }
    out
}

fn render_trailing(p: &AlertPayload) -> String {
    let mut out = format!(
        "🚨 <b>FAVORITE TRAILING AT {}</b> 🚨\n\n{} <b>{} vs {}</b>\nLeague: {}\n\n",
        p.sport.checkpoint_label(),
        p.sport.emoji(),
        escape_html(&p.home),
        escape_html(&p.away),
        escape_html(&p.league),
    );

    if let Some(score) = p.score {
        out.push_str("<b>Current Score:</b>\n");
        out.push_str(&format!("{}: {}\n", escape_html(&p.home), score.home));
        out.push_str(&format!("{}: {}\n", escape_html(&p.away), score.away));
        if !p.set_scores.is_empty() {
            let sets: Vec<String> = p.set_scores.iter().map(|s| s.to_string()).collect();
            out.push_str(&format!("Sets: {}\n", sets.join(", ")));
        }
        out.push('\n');
    }

    if let Some(side) = p.favorite.side() {
        out.push_str(&format!("<b>Pre-match Favorite:</b> {}\n", escape_html(p.team(side))));
        if let Some(odds) = &p.pre_match_odds {
            out.push_str(&format!("<b>Pre-match Odds:</b> {:.2}\n", odds.for_side(side)));
        }
        out.push('\n');
    }

    if let Some(odds) = &p.live_odds {
        out.push_str("<b>Current Live Odds:</b>\n");
        odds_lines(&mut out, p, odds);
        out.push('\n');
    }

    out.push_str(&format!("<i>{}</i>\n\n", escape_html(&p.reason)));
    out.push_str("💡 The favorite is now trailing - potential value opportunity!");
    out
}
