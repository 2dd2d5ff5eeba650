use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt,
    time::Duration,
};

use chrono::{DateTime, Utc};
use prometheus_client::encoding::EncodeLabelValue;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Response bodies are kept up to this many bytes.
pub const MAX_RESPONSE_BODY: usize = 4096;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, EncodeLabelValue,
)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Push,
    Delete,
    Ping,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventType::Push => "push",
            EventType::Delete => "delete",
            EventType::Ping => "ping",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EncodeLabelValue)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Retrying,
    Sent,
    Failed,
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay() -> Duration {
    Duration::from_secs(30)
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(60 * 60)
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(with = "crate::config::duration", default = "default_base_delay")]
    pub base_delay: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(with = "crate::config::duration", default = "default_max_delay")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Wait before the next try once `attempts` tries have failed.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(64) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::from_secs_f64(secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub project: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    pub events: BTreeSet<EventType>,
    pub retry: RetryPolicy,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    pub fn subscribes_to(&self, event_type: EventType) -> bool {
        self.active && self.events.contains(&event_type)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event_type: EventType,
    /// The exact body sent on every attempt.
    pub payload: String,
    pub status: EventStatus,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_attempt: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub test: bool,
}

impl WebhookEvent {
    pub fn new(webhook_id: Uuid, event_type: EventType, payload: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            webhook_id,
            event_type,
            payload,
            status: EventStatus::Pending,
            attempts: 0,
            last_attempt: None,
            next_attempt: Some(now),
            created_at: now,
            test: false,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, EventStatus::Pending | EventStatus::Retrying)
            && self.next_attempt.is_some_and(|at| at <= now)
    }

    pub fn succeeded(&mut self, now: DateTime<Utc>) {
        self.attempts += 1;
        self.status = EventStatus::Sent;
        self.last_attempt = Some(now);
        self.next_attempt = None;
    }

    /// Counts a failed attempt and schedules the next one, unless the
    /// policy has no attempts left.
    pub fn failed(&mut self, policy: &RetryPolicy, now: DateTime<Utc>) {
        self.attempts += 1;
        self.last_attempt = Some(now);

        if self.attempts >= policy.max_attempts {
            self.status = EventStatus::Failed;
            self.next_attempt = None;
            return;
        }

        self.status = EventStatus::Retrying;
        let delay = chrono::Duration::from_std(policy.delay(self.attempts))
            .unwrap_or(chrono::Duration::MAX);
        self.next_attempt = Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC));
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub event_id: Uuid,
    pub attempt: u32,
    pub request_headers: BTreeMap<String, String>,
    pub request_body: String,
    pub response_status: Option<u16>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub fn truncate_body(body: &[u8]) -> String {
    let end = body.len().min(MAX_RESPONSE_BODY);
    let text = String::from_utf8_lossy(&body[..end]);
    text.into_owned()
}

/// Everything the dispatcher persists.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WebhookState {
    pub webhooks: BTreeMap<Uuid, Webhook>,
    pub events: BTreeMap<Uuid, WebhookEvent>,
    pub deliveries: Vec<WebhookDelivery>,
}

impl WebhookState {
    /// Finished events that fall outside the history limits: finished
    /// before `cutoff`, or beyond the newest `max_events` of their webhook.
    pub fn expired_events(&self, cutoff: DateTime<Utc>, max_events: usize) -> Vec<Uuid> {
        let mut finished: BTreeMap<Uuid, Vec<(DateTime<Utc>, Uuid)>> = BTreeMap::new();

        for event in self.events.values() {
            if matches!(event.status, EventStatus::Sent | EventStatus::Failed) {
                let at = event.last_attempt.unwrap_or(event.created_at);
                finished
                    .entry(event.webhook_id)
                    .or_default()
                    .push((at, event.id));
            }
        }

        let mut expired = vec![];
        for mut events in finished.into_values() {
            events.sort_unstable_by(|a, b| b.cmp(a));
            for (rank, (at, id)) in events.into_iter().enumerate() {
                if rank >= max_events || at < cutoff {
                    expired.push(id);
                }
            }
        }

        expired
    }

    /// Drops events and their deliveries.
    pub fn forget_events(&mut self, ids: &[Uuid]) {
        for id in ids {
            self.events.remove(id);
        }
        let ids: HashSet<&Uuid> = ids.iter().collect();
        self.deliveries
            .retain(|delivery| !ids.contains(&delivery.event_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = policy();
        assert_eq!(policy.delay(1), Duration::from_secs(10));
        assert_eq!(policy.delay(2), Duration::from_secs(20));
        assert_eq!(policy.delay(3), Duration::from_secs(30));
        assert_eq!(policy.delay(50), Duration::from_secs(30));
    }

    #[test]
    fn failures_end_in_failed() {
        let policy = policy();
        let now = Utc::now();
        let mut event = WebhookEvent::new(Uuid::new_v4(), EventType::Push, "{}".into(), now);
        assert!(event.is_due(now));

        event.failed(&policy, now);
        assert_eq!(event.status, EventStatus::Retrying);
        assert_eq!(event.next_attempt, Some(now + chrono::Duration::seconds(10)));
        assert!(!event.is_due(now));

        event.failed(&policy, now);
        assert_eq!(event.status, EventStatus::Retrying);

        event.failed(&policy, now);
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.attempts, 3);
        assert!(!event.is_due(now + chrono::Duration::days(1)));
    }

    #[test]
    fn retry_then_success() {
        let now = Utc::now();
        let mut event = WebhookEvent::new(Uuid::new_v4(), EventType::Delete, "{}".into(), now);
        event.failed(&policy(), now);
        event.succeeded(now);
        assert_eq!(event.status, EventStatus::Sent);
        assert_eq!(event.attempts, 2);
        assert_eq!(event.next_attempt, None);
    }

    #[test]
    fn event_types_are_lowercase() {
        assert_eq!(serde_json::to_string(&EventType::Push).unwrap(), "\"push\"");
        assert_eq!(
            serde_json::from_str::<EventType>("\"delete\"").unwrap(),
            EventType::Delete
        );
    }

    fn delivery(event_id: Uuid) -> WebhookDelivery {
        WebhookDelivery {
            id: Uuid::new_v4(),
            event_id,
            attempt: 1,
            request_headers: BTreeMap::new(),
            request_body: "{}".into(),
            response_status: Some(200),
            response_headers: BTreeMap::new(),
            response_body: None,
            duration_ms: 1,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn history_limits() {
        let now = Utc::now();
        let hook = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut state = WebhookState::default();

        let mut add = |webhook_id: Uuid, age_hours: i64, status: EventStatus| {
            let at = now - chrono::Duration::hours(age_hours);
            let mut event = WebhookEvent::new(webhook_id, EventType::Push, "{}".into(), at);
            event.status = status;
            if status != EventStatus::Pending {
                event.last_attempt = Some(at);
            }
            state.deliveries.push(delivery(event.id));
            state.events.insert(event.id, event.clone());
            event.id
        };

        let ancient = add(hook, 48, EventStatus::Sent);
        let stuck = add(hook, 48, EventStatus::Retrying);
        let old = add(hook, 3, EventStatus::Failed);
        let recent = add(hook, 2, EventStatus::Sent);
        let newest = add(hook, 1, EventStatus::Sent);
        let elsewhere = add(other, 3, EventStatus::Sent);

        let mut expired = state.expired_events(now - chrono::Duration::hours(24), 2);
        expired.sort();
        let mut expected = vec![ancient, old];
        expected.sort();
        assert_eq!(expired, expected);

        state.forget_events(&expired);
        assert_eq!(state.events.len(), 4);
        for id in [stuck, recent, newest, elsewhere] {
            assert!(state.events.contains_key(&id));
        }
        assert_eq!(state.deliveries.len(), 4);
        assert!(state.deliveries.iter().all(|d| d.event_id != ancient && d.event_id != old));
    }

    #[test]
    fn bodies_truncated() {
        let body = vec![b'a'; MAX_RESPONSE_BODY * 2];
        assert_eq!(truncate_body(&body).len(), MAX_RESPONSE_BODY);
        assert_eq!(truncate_body(b"ok"), "ok");
    }
}
