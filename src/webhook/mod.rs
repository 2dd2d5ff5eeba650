//! Outbound webhook delivery.
//!
//! Triggering an event only persists a `pending` record per subscribed
//! webhook. A poller moves due records into a bounded queue and a fixed pool
//! of workers sends them, so a slow subscriber can hold up at most the
//! workers it occupies. Retries happen only through the poller picking up
//! `retrying` records once their next attempt is due.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, anyhow};
use chrono::Utc;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{
    sync::{Notify, mpsc},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::{HistoryConfig, WebhookConfig, WebhookSeed},
    error::{Conflict, Error, Resource, Result},
    store::Store,
    webhook::{
        model::{
            EventStatus, EventType, RetryPolicy, Webhook, WebhookDelivery, WebhookEvent,
            WebhookState, truncate_body,
        },
        signature::{SIGNATURE_HEADER, sign},
    },
};

pub mod model;
pub mod signature;

pub const EVENT_HEADER: &str = "X-Wharf-Event";
pub const EVENT_ID_HEADER: &str = "X-Wharf-Event-Id";
pub const DELIVERY_HEADER: &str = "X-Wharf-Delivery";

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct WebhookMetricLabels {
    status: String,
    url: String,
}

/// Body of a webhook create or update request.
#[derive(Clone, Debug, Deserialize)]
pub struct WebhookSpec {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    pub events: BTreeSet<EventType>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub active: Option<bool>,
}

impl WebhookSpec {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Invalid("webhook name is empty".into()));
        }

        let url = reqwest::Url::parse(&self.url)
            .map_err(|err| Error::Invalid(format!("webhook url: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Invalid("webhook url must be http or https".into()));
        }

        if self.events.is_empty() || self.events.contains(&EventType::Ping) {
            return Err(Error::Invalid(
                "webhook must subscribe to push and/or delete".into(),
            ));
        }

        if self.retry.as_ref().is_some_and(|retry| retry.max_attempts == 0) {
            return Err(Error::Invalid("retry.max_attempts must be at least 1".into()));
        }

        Ok(())
    }
}

pub struct WebhookService {
    state: Store<WebhookState>,
    client: reqwest::Client,
    retry: RetryPolicy,
    poll_interval: Duration,
    workers: usize,
    queue_size: usize,
    history: HistoryConfig,
    in_flight: Mutex<HashSet<Uuid>>,
    wake: Notify,
    attempts_total: Family<WebhookMetricLabels, Counter>,
}

impl WebhookService {
    pub fn new(
        state: Store<WebhookState>,
        config: &WebhookConfig,
        registry: &mut Registry,
    ) -> anyhow::Result<Self> {
        let attempts_total = Family::<WebhookMetricLabels, Counter>::default();
        registry.register(
            "webhook_attempts",
            "Number of webhook delivery attempts",
            attempts_total.clone(),
        );

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("wharf-webhook/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Unable to build webhook client")?;

        Ok(Self {
            state,
            client,
            retry: config.retry.clone(),
            poll_interval: config.poll_interval.max(Duration::from_millis(10)),
            workers: config.workers.max(1),
            queue_size: config.queue_size.max(1),
            history: config.history.clone(),
            in_flight: Mutex::new(HashSet::new()),
            wake: Notify::new(),
            attempts_total,
        })
    }

    /// Spawns the poller and the delivery workers.
    pub fn start(self: &Arc<Self>, tasks: &mut JoinSet<anyhow::Result<()>>) {
        let (tx, rx) = mpsc::channel::<Uuid>(self.queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker in 0..self.workers {
            let service = self.clone();
            let rx = rx.clone();

            tasks.spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some(id) = next else {
                        break;
                    };

                    match service.deliver(&id).await {
                        Ok(()) => {}
                        Err(err @ Error::DeliveryFailed(_)) => {
                            info!(worker, event = %id, "{err}");
                        }
                        Err(err @ Error::ExhaustedRetries(_)) => {
                            warn!(worker, event = %id, "{err}");
                        }
                        Err(err) => {
                            error!(worker, event = %id, "Webhook delivery error: {err}");
                        }
                    }

                    service.release(&id);
                }

                Ok(())
            });
        }

        let service = self.clone();
        tasks.spawn(async move {
            let period = service.history.sweep_interval.max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = service.prune_history().await {
                    error!("Webhook history sweep failed: {err}");
                }
            }
        });

        let service = self.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(service.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = service.wake.notified() => {}
                }

                if tx.is_closed() {
                    break;
                }

                if let Err(err) = service.enqueue_due(&tx).await {
                    error!("Webhook poll failed: {err}");
                }
            }

            Ok(())
        });
    }

    fn release(&self, id: &Uuid) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(id);
        }
    }

    /// Queues every due event that isn't already being worked on. Stops
    /// early when the queue is full; the rest wait for the next tick.
    async fn enqueue_due(&self, queue: &mpsc::Sender<Uuid>) -> Result<usize> {
        let now = Utc::now();
        let mut due: Vec<(chrono::DateTime<Utc>, Uuid)> = self
            .state
            .read(|state| {
                state
                    .events
                    .values()
                    .filter(|event| event.is_due(now))
                    .filter(|event| {
                        state
                            .webhooks
                            .get(&event.webhook_id)
                            .is_some_and(|webhook| webhook.active)
                    })
                    .map(|event| (event.next_attempt.unwrap_or(now), event.id))
                    .collect()
            })
            .await;
        due.sort();

        let mut queued = 0;

        for (_, id) in due {
            {
                let mut in_flight = self
                    .in_flight
                    .lock()
                    .map_err(|_| anyhow!("In-flight lock poisoned"))?;
                if !in_flight.insert(id) {
                    continue;
                }
            }

            match queue.try_send(id) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.release(&id);
                    debug!("Webhook queue full, leaving the rest for the next tick");
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.release(&id);
                    return Err(anyhow!("Webhook queue closed").into());
                }
            }
        }

        Ok(queued)
    }

    /// Forgets finished events, and their deliveries, that fall outside the
    /// configured history.
    pub async fn prune_history(&self) -> Result<usize> {
        let max_age = chrono::Duration::from_std(self.history.max_age)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let max_events = self.history.max_events;

        let expired = self
            .state
            .read(|state| state.expired_events(cutoff, max_events))
            .await;
        if expired.is_empty() {
            return Ok(0);
        }

        let mut txn = self.state.begin().await;
        // Re-check under the transaction, the poller may have moved things.
        let expired = txn.expired_events(cutoff, max_events);
        txn.forget_events(&expired);
        drop(txn.commit().await?);

        info!(events = expired.len(), "Pruned webhook history");

        Ok(expired.len())
    }

    pub async fn seed(&self, seeds: &[WebhookSeed]) -> Result<()> {
        if seeds.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut txn = self.state.begin().await;

        for seed in seeds {
            let existing = txn
                .webhooks
                .values()
                .find(|w| w.project == seed.project && w.name == seed.name)
                .map(|w| (w.id, w.created_at));
            let (id, created_at) = existing.unwrap_or_else(|| (Uuid::new_v4(), now));

            txn.webhooks.insert(
                id,
                Webhook {
                    id,
                    project: seed.project.clone(),
                    name: seed.name.clone(),
                    url: seed.url.clone(),
                    secret: seed.secret.clone(),
                    events: seed.events.iter().copied().collect(),
                    retry: seed.retry.clone().unwrap_or_else(|| self.retry.clone()),
                    active: seed.active,
                    created_at,
                    updated_at: now,
                },
            );
        }

        drop(txn.commit().await?);
        info!(count = seeds.len(), "Seeded webhooks from configuration");

        Ok(())
    }

    pub async fn list_webhooks(&self, project: &str) -> Vec<Webhook> {
        self.state
            .read(|state| {
                state
                    .webhooks
                    .values()
                    .filter(|webhook| webhook.project == project)
                    .cloned()
                    .collect()
            })
            .await
    }

    pub async fn get_webhook(&self, project: &str, id: &Uuid) -> Result<Webhook> {
        self.state
            .read(|state| {
                state
                    .webhooks
                    .get(id)
                    .filter(|webhook| webhook.project == project)
                    .cloned()
            })
            .await
            .ok_or(Error::NotFound(Resource::Webhook))
    }

    pub async fn create_webhook(&self, project: &str, spec: WebhookSpec) -> Result<Webhook> {
        spec.validate()?;

        let mut txn = self.state.begin().await;

        if txn
            .webhooks
            .values()
            .any(|w| w.project == project && w.name == spec.name)
        {
            return Err(Error::Conflict(Conflict::Exists(format!(
                "webhook {}",
                spec.name
            ))));
        }

        let now = Utc::now();
        let webhook = Webhook {
            id: Uuid::new_v4(),
            project: project.to_string(),
            name: spec.name,
            url: spec.url,
            secret: spec.secret.filter(|secret| !secret.is_empty()),
            events: spec.events,
            retry: spec.retry.unwrap_or_else(|| self.retry.clone()),
            active: spec.active.unwrap_or(true),
            created_at: now,
            updated_at: now,
        };

        txn.webhooks.insert(webhook.id, webhook.clone());
        drop(txn.commit().await?);

        info!(webhook = %webhook.id, project, url = webhook.url, "Created webhook");

        Ok(webhook)
    }

    pub async fn update_webhook(&self, project: &str, id: &Uuid, spec: WebhookSpec) -> Result<Webhook> {
        spec.validate()?;

        let mut txn = self.state.begin().await;

        if txn
            .webhooks
            .values()
            .any(|w| w.project == project && w.name == spec.name && &w.id != id)
        {
            return Err(Error::Conflict(Conflict::Exists(format!(
                "webhook {}",
                spec.name
            ))));
        }

        let webhook = txn
            .webhooks
            .get_mut(id)
            .filter(|webhook| webhook.project == project)
            .ok_or(Error::NotFound(Resource::Webhook))?;

        webhook.name = spec.name;
        webhook.url = spec.url;
        if let Some(secret) = spec.secret {
            webhook.secret = Some(secret).filter(|secret| !secret.is_empty());
        }
        webhook.events = spec.events;
        if let Some(retry) = spec.retry {
            webhook.retry = retry;
        }
        if let Some(active) = spec.active {
            webhook.active = active;
        }
        webhook.updated_at = Utc::now();

        let webhook = webhook.clone();
        drop(txn.commit().await?);

        info!(webhook = %id, project, "Updated webhook");

        Ok(webhook)
    }

    /// Removes a webhook with its event and delivery history.
    pub async fn delete_webhook(&self, project: &str, id: &Uuid) -> Result<()> {
        let mut txn = self.state.begin().await;

        if txn
            .webhooks
            .get(id)
            .filter(|webhook| webhook.project == project)
            .is_none()
        {
            return Err(Error::NotFound(Resource::Webhook));
        }

        txn.webhooks.remove(id);

        let events: HashSet<Uuid> = txn
            .events
            .values()
            .filter(|event| &event.webhook_id == id)
            .map(|event| event.id)
            .collect();
        txn.events.retain(|event_id, _| !events.contains(event_id));
        txn.deliveries
            .retain(|delivery| !events.contains(&delivery.event_id));

        drop(txn.commit().await?);

        info!(webhook = %id, project, "Deleted webhook");

        Ok(())
    }

    /// Events for one webhook, newest first.
    pub async fn list_events(&self, project: &str, webhook_id: &Uuid) -> Result<Vec<WebhookEvent>> {
        self.get_webhook(project, webhook_id).await?;

        let mut events: Vec<WebhookEvent> = self
            .state
            .read(|state| {
                state
                    .events
                    .values()
                    .filter(|event| &event.webhook_id == webhook_id)
                    .cloned()
                    .collect()
            })
            .await;
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(events)
    }

    /// Deliveries recorded for an event, along with the project that owns
    /// the webhook.
    pub async fn list_deliveries(&self, event_id: &Uuid) -> Result<(String, Vec<WebhookDelivery>)> {
        self.state
            .read(|state| {
                let event = state.events.get(event_id)?;
                let webhook = state.webhooks.get(&event.webhook_id)?;
                let deliveries = state
                    .deliveries
                    .iter()
                    .filter(|delivery| &delivery.event_id == event_id)
                    .cloned()
                    .collect();
                Some((webhook.project.clone(), deliveries))
            })
            .await
            .ok_or(Error::NotFound(Resource::Event))
    }

    pub async fn get_event(&self, event_id: &Uuid) -> Result<WebhookEvent> {
        self.state
            .read(|state| state.events.get(event_id).cloned())
            .await
            .ok_or(Error::NotFound(Resource::Event))
    }

    /// Records a pending event for every active webhook of the project that
    /// subscribes to `event_type`. Returns the new event ids.
    pub async fn trigger_event(
        &self,
        event_type: EventType,
        project: &str,
        repository: &str,
        payload: &Value,
        actor: &str,
    ) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let body = json!({
            "type": event_type,
            "occurred_at": now,
            "project": project,
            "repository": repository,
            "actor": actor,
            "data": payload,
        })
        .to_string();

        let mut txn = self.state.begin().await;

        let subscribed: Vec<Uuid> = txn
            .webhooks
            .values()
            .filter(|webhook| webhook.project == project && webhook.subscribes_to(event_type))
            .map(|webhook| webhook.id)
            .collect();

        if subscribed.is_empty() {
            return Ok(vec![]);
        }

        let mut ids = Vec::with_capacity(subscribed.len());
        for webhook_id in subscribed {
            let event = WebhookEvent::new(webhook_id, event_type, body.clone(), now);
            ids.push(event.id);
            txn.events.insert(event.id, event);
        }

        drop(txn.commit().await?);

        debug!(%event_type, project, repository, count = ids.len(), "Queued webhook events");
        self.wake.notify_one();

        Ok(ids)
    }

    /// Sends one attempt for a due event and records the outcome.
    pub(crate) async fn deliver(&self, event_id: &Uuid) -> Result<()> {
        let found = self
            .state
            .read(|state| {
                let event = state.events.get(event_id)?;
                let webhook = state.webhooks.get(&event.webhook_id)?;
                Some((event.clone(), webhook.clone()))
            })
            .await;

        let Some((event, webhook)) = found else {
            return Ok(());
        };

        if !matches!(event.status, EventStatus::Pending | EventStatus::Retrying) {
            return Ok(());
        }

        let delivery = self.send_event(&event, &webhook).await;
        let success = delivery.error.is_none();
        let reason = delivery.error.clone();

        let mut txn = self.state.begin().await;
        let Some(stored) = txn.events.get_mut(event_id) else {
            return Ok(());
        };

        let now = Utc::now();
        if success {
            stored.succeeded(now);
        } else {
            stored.failed(&webhook.retry, now);
        }
        let status = stored.status;
        txn.deliveries.push(delivery);
        drop(txn.commit().await?);

        match status {
            EventStatus::Sent => Ok(()),
            EventStatus::Failed => Err(Error::ExhaustedRetries(*event_id)),
            _ => Err(Error::DeliveryFailed(reason.unwrap_or_default())),
        }
    }

    /// Makes one HTTP attempt. Never fails: problems end up in the
    /// delivery's `error` field.
    pub(crate) async fn send_event(&self, event: &WebhookEvent, webhook: &Webhook) -> WebhookDelivery {
        let delivery_id = Uuid::new_v4();
        let attempt = event.attempts + 1;

        let mut request_headers = BTreeMap::from([
            ("Content-Type".to_string(), "application/json".to_string()),
            (
                "User-Agent".to_string(),
                concat!("wharf-webhook/", env!("CARGO_PKG_VERSION")).to_string(),
            ),
            (EVENT_HEADER.to_string(), event.event_type.to_string()),
            (EVENT_ID_HEADER.to_string(), event.id.to_string()),
            (DELIVERY_HEADER.to_string(), delivery_id.to_string()),
        ]);

        if let Some(secret) = &webhook.secret {
            request_headers.insert(
                SIGNATURE_HEADER.to_string(),
                sign(secret, event.payload.as_bytes()),
            );
        }

        let mut request = self.client.post(&webhook.url).body(event.payload.clone());
        for (name, value) in &request_headers {
            request = request.header(name, value);
        }

        let started = std::time::Instant::now();
        let mut delivery = WebhookDelivery {
            id: delivery_id,
            event_id: event.id,
            attempt,
            request_headers,
            request_body: event.payload.clone(),
            response_status: None,
            response_headers: BTreeMap::new(),
            response_body: None,
            duration_ms: 0,
            error: None,
            timestamp: Utc::now(),
        };

        let status = match request.send().await {
            Ok(response) => {
                let status = response.status();
                delivery.response_status = Some(status.as_u16());
                delivery.response_headers = response
                    .headers()
                    .iter()
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|value| (name.to_string(), value.to_string()))
                    })
                    .collect();

                match response.bytes().await {
                    Ok(body) => delivery.response_body = Some(truncate_body(&body)),
                    Err(err) => debug!("Unable to read webhook response body: {err}"),
                }

                if !status.is_success() {
                    delivery.error = Some(format!("endpoint returned {status}"));
                }

                status.as_u16().to_string()
            }
            Err(err) => {
                delivery.error = Some(err.to_string());
                "000".to_string()
            }
        };

        delivery.duration_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);

        self.attempts_total
            .get_or_create(&WebhookMetricLabels {
                status,
                url: webhook.url.clone(),
            })
            .inc();

        debug!(
            webhook = %webhook.id,
            event = %event.id,
            attempt,
            error = delivery.error.as_deref(),
            "Webhook attempt"
        );

        delivery
    }

    /// Sends a one-off `ping`, outside the queue and without retries.
    pub async fn test_webhook(&self, project: &str, id: &Uuid) -> Result<(WebhookEvent, WebhookDelivery)> {
        let webhook = self.get_webhook(project, id).await?;

        let now = Utc::now();
        let body = json!({
            "type": EventType::Ping,
            "occurred_at": now,
            "project": project,
            "webhook": webhook.name,
        })
        .to_string();

        let mut event = WebhookEvent::new(webhook.id, EventType::Ping, body, now);
        event.test = true;

        let delivery = self.send_event(&event, &webhook).await;

        if delivery.error.is_none() {
            event.succeeded(Utc::now());
        } else {
            event.attempts += 1;
            event.status = EventStatus::Failed;
            event.last_attempt = Some(Utc::now());
            event.next_attempt = None;
        }

        let mut txn = self.state.begin().await;
        txn.events.insert(event.id, event.clone());
        txn.deliveries.push(delivery.clone());
        drop(txn.commit().await?);

        Ok((event, delivery))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use test_log::test;
    use tokio::time::timeout;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers::*};

    use super::{signature::verify, *};

    pub(crate) fn config() -> WebhookConfig {
        WebhookConfig {
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
            workers: 2,
            queue_size: 8,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                multiplier: 2.0,
                max_delay: Duration::from_millis(50),
            },
            history: HistoryConfig::default(),
            subscriptions: vec![],
        }
    }

    fn service() -> Arc<WebhookService> {
        let mut registry = Registry::default();
        Arc::new(WebhookService::new(Store::in_memory(), &config(), &mut registry).unwrap())
    }

    pub(crate) fn spec(url: &str, secret: Option<&str>) -> WebhookSpec {
        WebhookSpec {
            name: "ci".into(),
            url: url.into(),
            secret: secret.map(|s| s.to_string()),
            events: BTreeSet::from([EventType::Push, EventType::Delete]),
            retry: None,
            active: None,
        }
    }

    async fn wait_for_status(
        service: &WebhookService,
        id: &Uuid,
        status: EventStatus,
    ) -> WebhookEvent {
        timeout(Duration::from_secs(10), async {
            loop {
                let event = service.get_event(id).await.unwrap();
                if event.status == status {
                    break event;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("event never reached the expected status")
    }

    #[test(tokio::test)]
    async fn crud() -> anyhow::Result<()> {
        let service = service();

        let created = service
            .create_webhook("library", spec("http://localhost/hook", None))
            .await?;
        assert!(created.active);
        assert_eq!(created.retry, config().retry);

        assert!(matches!(
            service
                .create_webhook("library", spec("http://localhost/other", None))
                .await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            service
                .create_webhook("library", spec("ftp://localhost/hook", None))
                .await,
            Err(Error::Invalid(_))
        ));

        let mut update = spec("http://localhost/new", Some("s3cret"));
        update.active = Some(false);
        let updated = service
            .update_webhook("library", &created.id, update)
            .await?;
        assert_eq!(updated.url, "http://localhost/new");
        assert_eq!(updated.secret.as_deref(), Some("s3cret"));
        assert!(!updated.active);

        assert!(matches!(
            service.get_webhook("other", &created.id).await,
            Err(Error::NotFound(Resource::Webhook))
        ));

        assert_eq!(service.list_webhooks("library").await.len(), 1);
        service.delete_webhook("library", &created.id).await?;
        assert!(service.list_webhooks("library").await.is_empty());

        Ok(())
    }

    #[test(tokio::test)]
    async fn signed_delivery() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header(EVENT_HEADER, "push"))
            .respond_with(ResponseTemplate::new(200).set_body_string("thanks"))
            .expect(1)
            .mount(&server)
            .await;

        let service = service();
        let mut tasks = JoinSet::new();
        service.start(&mut tasks);

        service
            .create_webhook(
                "library",
                spec(&format!("{}/hook", server.uri()), Some("s3cret")),
            )
            .await?;

        let ids = service
            .trigger_event(
                EventType::Push,
                "library",
                "library/nginx",
                &json!({"tag": "latest"}),
                "bob",
            )
            .await?;
        assert_eq!(ids.len(), 1);

        let event = wait_for_status(&service, &ids[0], EventStatus::Sent).await;
        assert_eq!(event.attempts, 1);

        let requests = server.received_requests().await.unwrap();
        let request = &requests[0];
        let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str()?;
        assert!(verify("s3cret", &request.body, signature));
        assert_eq!(
            request.headers.get(EVENT_ID_HEADER).unwrap().to_str()?,
            event.id.to_string()
        );

        let body: Value = serde_json::from_slice(&request.body)?;
        assert_eq!(body["repository"], "library/nginx");
        assert_eq!(body["data"]["tag"], "latest");

        let (project, deliveries) = service.list_deliveries(&event.id).await?;
        assert_eq!(project, "library");
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].response_status, Some(200));
        assert_eq!(deliveries[0].response_body.as_deref(), Some("thanks"));

        tasks.shutdown().await;
        Ok(())
    }

    #[test(tokio::test)]
    async fn finished_history_is_pruned() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut config = config();
        config.history.max_events = 1;
        let service = Arc::new(WebhookService::new(
            Store::in_memory(),
            &config,
            &mut Registry::default(),
        )?);
        let mut tasks = JoinSet::new();
        service.start(&mut tasks);

        let webhook = service
            .create_webhook("library", spec(&format!("{}/hook", server.uri()), None))
            .await?;

        let mut ids = vec![];
        for tag in ["v1", "v2", "v3"] {
            let id = service
                .trigger_event(EventType::Push, "library", "library/nginx", &json!({"tag": tag}), "bob")
                .await?[0];
            wait_for_status(&service, &id, EventStatus::Sent).await;
            ids.push(id);
        }

        assert_eq!(service.prune_history().await?, 2);
        assert_eq!(service.prune_history().await?, 0);

        let events = service.list_events("library", &webhook.id).await?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, ids[2]);
        assert!(matches!(
            service.list_deliveries(&ids[0]).await,
            Err(Error::NotFound(Resource::Event))
        ));
        assert_eq!(service.list_deliveries(&ids[2]).await?.1.len(), 1);

        tasks.shutdown().await;
        Ok(())
    }

    #[test(tokio::test)]
    async fn always_failing_endpoint_gives_up() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let service = service();
        let mut tasks = JoinSet::new();
        service.start(&mut tasks);

        service
            .create_webhook("library", spec(&server.uri(), None))
            .await?;
        let ids = service
            .trigger_event(EventType::Delete, "library", "library/nginx", &json!({}), "bob")
            .await?;

        let event = wait_for_status(&service, &ids[0], EventStatus::Failed).await;
        assert_eq!(event.attempts, 3);

        // Nothing more once failed
        tokio::time::sleep(Duration::from_millis(200)).await;
        let (_, deliveries) = service.list_deliveries(&event.id).await?;
        assert_eq!(deliveries.len(), 3);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
        assert!(
            deliveries
                .iter()
                .all(|delivery| delivery.response_status == Some(500))
        );

        tasks.shutdown().await;
        Ok(())
    }

    #[test(tokio::test)]
    async fn recovers_after_a_failure() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        Mock::given(method("POST"))
            .respond_with(move |_: &wiremock::Request| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    ResponseTemplate::new(503)
                } else {
                    ResponseTemplate::new(204)
                }
            })
            .mount(&server)
            .await;

        let service = service();
        let mut tasks = JoinSet::new();
        service.start(&mut tasks);

        service
            .create_webhook("library", spec(&server.uri(), None))
            .await?;
        let ids = service
            .trigger_event(EventType::Push, "library", "library/nginx", &json!({}), "bob")
            .await?;

        let event = wait_for_status(&service, &ids[0], EventStatus::Sent).await;
        assert_eq!(event.attempts, 2);

        tasks.shutdown().await;
        Ok(())
    }

    #[test(tokio::test)]
    async fn only_subscribed_active_webhooks() -> anyhow::Result<()> {
        let service = service();

        let mut push_only = spec("http://localhost/push", None);
        push_only.name = "push".into();
        push_only.events = BTreeSet::from([EventType::Push]);
        service.create_webhook("library", push_only).await?;

        let mut inactive = spec("http://localhost/inactive", None);
        inactive.name = "inactive".into();
        inactive.active = Some(false);
        service.create_webhook("library", inactive).await?;

        service
            .create_webhook("other", spec("http://localhost/other", None))
            .await?;

        let ids = service
            .trigger_event(EventType::Delete, "library", "library/nginx", &json!({}), "bob")
            .await?;
        assert!(ids.is_empty());

        let ids = service
            .trigger_event(EventType::Push, "library", "library/nginx", &json!({}), "bob")
            .await?;
        assert_eq!(ids.len(), 1);

        Ok(())
    }

    #[test(tokio::test)]
    async fn ping() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header(EVENT_HEADER, "ping"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let service = service();
        let webhook = service
            .create_webhook("library", spec(&server.uri(), None))
            .await?;

        let (event, delivery) = service.test_webhook("library", &webhook.id).await?;
        assert!(event.test);
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(delivery.response_status, Some(500));

        let events = service.list_events("library", &webhook.id).await?;
        assert_eq!(events.len(), 1);

        Ok(())
    }

    #[test(tokio::test)]
    async fn seeds_are_upserted() -> anyhow::Result<()> {
        let service = service();
        let seed = WebhookSeed {
            project: "library".into(),
            name: "ci".into(),
            url: "http://localhost/a".into(),
            secret: None,
            events: vec![EventType::Push],
            retry: None,
            active: true,
        };

        service.seed(std::slice::from_ref(&seed)).await?;
        let first = service.list_webhooks("library").await;

        let mut changed = seed.clone();
        changed.url = "http://localhost/b".into();
        service.seed(&[changed]).await?;
        let second = service.list_webhooks("library").await;

        assert_eq!(second.len(), 1);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(second[0].url, "http://localhost/b");

        Ok(())
    }
}
