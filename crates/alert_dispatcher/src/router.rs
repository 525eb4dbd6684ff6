//! Kdo dostane kterou notifikaci. Free → všichni, premium → jen platící s daným sportem.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sports_core::{Sport, Surface, UnknownValue};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Single,
    Basic,
    Advanced,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free     => "free",
            Tier::Single   => "single",
            Tier::Basic    => "basic",
            Tier::Advanced => "advanced",
            Tier::Premium  => "premium",
        }
    }

    /// Kolik sportů si tier může vybrat (Premium = všechny)
    pub fn sport_allowance(&self) -> usize {
        match self {
            Tier::Free     => 0,
            Tier::Single   => 1,
            Tier::Basic    => 2,
            Tier::Advanced => 3,
            Tier::Premium  => Sport::ALL.len(),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free"     => Ok(Tier::Free),
            "single"   => Ok(Tier::Single),
            "basic"    => Ok(Tier::Basic),
            "advanced" => Ok(Tier::Advanced),
            "premium"  => Ok(Tier::Premium),
            other      => Err(UnknownValue(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscriber_id: String,
    /// Telegram chat id (číslo) nebo @username
    pub chat_id:       String,
    pub tier:          Tier,
    pub sports:        BTreeSet<Sport>,
    pub active:        bool,
    pub active_until:  Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn premium_eligible(&self, sport: Sport, now: DateTime<Utc>) -> bool {
        if self.tier == Tier::Free || !self.active {
            return false;
        }
        let current = self.active_until.map_or(false, |until| now < until);
        current && (self.tier == Tier::Premium || self.sports.contains(&sport))
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("subscription source unavailable: {0}")]
pub struct SourceError(pub String);

/// Snapshot předplatných. Vlastní je platební část systému, tady se jen čte.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<Subscription>, SourceError>;
}

/// Pevný seznam (testy, běh bez DB předplatných)
#[derive(Debug, Clone, Default)]
pub struct StaticSubscriptions(pub Vec<Subscription>);

#[async_trait]
impl SubscriptionSource for StaticSubscriptions {
    async fn snapshot(&self) -> Result<Vec<Subscription>, SourceError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingConfig {
    pub premium_channel: Option<String>,
    pub free_channel:    Option<String>,
    /// Posílat i do soukromých chatů předplatitelů
    pub per_user:        bool,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRouter {
    cfg: RoutingConfig,
}

impl SubscriptionRouter {
    pub fn new(cfg: RoutingConfig) -> Self {
        Self { cfg }
    }

    pub fn route(
        &self,
        sport:         Sport,
        surface:       Surface,
        subscriptions: &[Subscription],
        now:           DateTime<Utc>,
    ) -> BTreeSet<String> {
        let mut targets = BTreeSet::new();
        let shared = match surface {
            Surface::Premium => &self.cfg.premium_channel,
            Surface::Free    => &self.cfg.free_channel,
        };
        if let Some(channel) = shared.as_ref().filter(|c| !c.trim().is_empty()) {
            targets.insert(channel.clone());
        }

        if self.cfg.per_user {
            let users = subscriptions.iter().filter(|s| match surface {
                Surface::Premium => s.premium_eligible(sport, now),
                Surface::Free    => true,
            });
            targets.extend(users.map(|s| s.chat_id.clone()));
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sub(chat: &str, tier: Tier, sports: &[Sport], until_h: i64) -> Subscription {
        Subscription {
            subscriber_id: format!("u{chat}"),
            chat_id:       chat.to_string(),
            tier,
            sports:        sports.iter().copied().collect(),
            active:        true,
            active_until:  Some(Utc::now() + Duration::hours(until_h)),
        }
    }

    fn router(per_user: bool) -> SubscriptionRouter {
        SubscriptionRouter::new(RoutingConfig {
            premium_channel: Some("@premium".into()),
            free_channel:    Some("@free".into()),
            per_user,
        })
    }

    #[test]
    fn premium_goes_only_to_entitled_users() {
        let subs = vec![
            sub("1", Tier::Single, &[Sport::Tennis], 24),
            sub("2", Tier::Single, &[Sport::Basketball], 24),
            sub("3", Tier::Premium, &[], 24),
            sub("4", Tier::Advanced, &[Sport::Tennis], -1),
            sub("5", Tier::Free, &[Sport::Tennis], 24),
        ];
        let targets = router(true).route(Sport::Tennis, Surface::Premium, &subs, Utc::now());
        let expected: BTreeSet<String> = ["@premium", "1", "3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(targets, expected);
    }

    #[test]
    fn inactive_flag_wins_over_date() {
        let mut s = sub("1", Tier::Premium, &[], 24);
        s.active = false;
        assert!(!s.premium_eligible(Sport::Handball, Utc::now()));
        s.active = true;
        s.active_until = None;
        assert!(!s.premium_eligible(Sport::Handball, Utc::now()));
    }

    #[test]
    fn free_goes_to_everyone_in_per_user_mode() {
        let mut lapsed = sub("9", Tier::Basic, &[], -48);
        lapsed.active = false;
        let subs = vec![sub("1", Tier::Free, &[], 1), lapsed];
        let targets = router(true).route(Sport::Basketball, Surface::Free, &subs, Utc::now());
        assert_eq!(targets.len(), 3);
    }

    #[test]
    fn shared_channels_only_without_per_user() {
        let subs = vec![sub("1", Tier::Premium, &[], 24)];
        let targets = router(false).route(Sport::Tennis, Surface::Premium, &subs, Utc::now());
        assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec!["@premium".to_string()]);

        let none = SubscriptionRouter::new(RoutingConfig::default());
        assert!(none.route(Sport::Tennis, Surface::Free, &subs, Utc::now()).is_empty());
    }

    #[test]
    fn tier_parses_case_insensitive() {
        assert_eq!("Advanced".parse::<Tier>().unwrap(), Tier::Advanced);
        assert!("gold".parse::<Tier>().is_err());
        assert_eq!(Tier::Premium.sport_allowance(), 3);
    }
}
