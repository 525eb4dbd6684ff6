/// TrailWatch — Alert Dispatcher
///
/// verdikt → `mark_rule_fired` (jediné místo, kde se rozhoduje "už odešlo?")
///         → router (kanály + předplatitelé) → paralelní odeslání s retry.
///
/// Selhání jednoho kanálu neblokuje ostatní. Odpálené pravidlo zůstává
/// odpálené i když doručení selže (rozhodnuto, ne doručeno).

pub mod message;
pub mod router;
pub mod telegram;

pub use message::{render, AlertPayload};
pub use router::{RoutingConfig, SourceError, StaticSubscriptions, Subscription, SubscriptionRouter, SubscriptionSource, Tier};
pub use telegram::{AlertSender, DeliveryError, TelegramSender};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use match_registry::{MatchRegistry, RegistryError};
use sports_core::{RetryPolicy, RuleId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Pravidlo už jednou odpálilo, nic se neposílá
    Duplicate,
    Fired { delivered: usize, failed: usize },
}

/// Výsledek doručení na jeden kanál
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryAttempt {
    pub match_id:  String,
    pub rule:      RuleId,
    pub target:    String,
    pub ok:        bool,
    pub error:     Option<String>,
    pub at:        DateTime<Utc>,
}

pub trait DeliveryLog: Send + Sync {
    fn delivery(&self, attempt: &DeliveryAttempt);
}

pub struct NoDeliveryLog;

impl DeliveryLog for NoDeliveryLog {
    fn delivery(&self, _attempt: &DeliveryAttempt) {}
}

pub struct Dispatcher {
    registry:      Arc<MatchRegistry>,
    router:        SubscriptionRouter,
    subscriptions: Arc<dyn SubscriptionSource>,
    sender:        Arc<dyn AlertSender>,
    deliveries:    Arc<dyn DeliveryLog>,
    retry:         RetryPolicy,
    send_timeout:  Duration,
}

impl Dispatcher {
    pub fn new(
        registry:      Arc<MatchRegistry>,
        router:        SubscriptionRouter,
        subscriptions: Arc<dyn SubscriptionSource>,
        sender:        Arc<dyn AlertSender>,
    ) -> Self {
        Self {
            registry,
            router,
            subscriptions,
            sender,
            deliveries:   Arc::new(NoDeliveryLog),
            retry:        RetryPolicy::new(3, Duration::from_secs(1)),
            send_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_delivery_log(mut self, log: Arc<dyn DeliveryLog>) -> Self {
        self.deliveries = log;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy, send_timeout: Duration) -> Self {
        self.retry = retry;
        self.send_timeout = send_timeout;
        self
    }

    pub async fn dispatch(
        &self,
        match_id: &str,
        rule:     RuleId,
        payload:  &AlertPayload,
        now:      DateTime<Utc>,
    ) -> Result<DispatchOutcome, RegistryError> {
        if !self.registry.mark_rule_fired(match_id, rule, now).await? {
            return Ok(DispatchOutcome::Duplicate);
        }

        let subs = match self.subscriptions.snapshot().await {
            Ok(subs) => subs,
            Err(e) => {
                // sdílené kanály dostanou zprávu i bez předplatných
                warn!("dispatch {match_id}/{rule}: {e}");
                Vec::new()
            }
        };
        let targets = self.router.route(payload.sport, rule.surface(), &subs, now);
        if targets.is_empty() {
            warn!("dispatch {match_id}/{rule}: no delivery targets configured");
            return Ok(DispatchOutcome::Fired { delivered: 0, failed: 0 });
        }

        let text = render(rule, payload);
        let results = join_all(targets.iter().map(|chat| self.deliver(chat, &text))).await;

        let mut delivered = 0;
        let mut failed = 0;
        for (chat, res) in targets.iter().zip(results) {
            let error = match res {
                Ok(()) => {
                    delivered += 1;
                    None
                }
                Err(e) => {
                    failed += 1;
                    warn!("dispatch {match_id}/{rule} → {chat} failed: {e}");
                    Some(e.to_string())
                }
            };
            self.deliveries.delivery(&DeliveryAttempt {
                match_id: match_id.to_string(),
                rule,
                target:   chat.clone(),
                ok:       error.is_none(),
                error,
                at:       Utc::now(),
            });
        }

        info!("dispatch {match_id}/{rule}: delivered {delivered}, failed {failed}");
        Ok(DispatchOutcome::Fired { delivered, failed })
    }

    async fn deliver(&self, chat: &str, text: &str) -> Result<(), DeliveryError> {
        let sender = self.sender.as_ref();
        let timeout = self.send_timeout;
        self.retry
            .run_hinted(
                chat,
                move || async move {
                    match tokio::time::timeout(timeout, sender.send(chat, text)).await {
                        Ok(res) => res,
                        Err(_) => Err(DeliveryError::Timeout),
                    }
                },
                DeliveryError::is_retryable,
                DeliveryError::retry_hint,
            )
            .await
    }
}
