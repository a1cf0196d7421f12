/// Reservation poller and event projector
///
/// One periodic task polls every enabled integration in a batch. A failing
/// integration backs off exponentially (60s doubling, capped at 300s)
/// without delaying the others, and its persisted stale counter gates the
/// booking path once it crosses the block threshold.
use crate::error::PortalResult;
use crate::rental::client::ReservationClient;
use crate::rental::{
    EventStore, EventUpsert, IntegrationConfig, IntegrationManager, STALE_WARN_THRESHOLD,
};
use crate::timeutil;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

/// Event slots projected per integration; slot 0 is the current/outgoing
/// booking and slot 1 the incoming one.
pub const EVENT_SLOTS: i64 = 3;

const BASE_BACKOFF_SECONDS: i64 = 60;
const MAX_BACKOFF_SECONDS: i64 = 300;

#[derive(Debug, Clone, Default)]
struct PollState {
    consecutive_errors: u32,
    next_attempt: Option<DateTime<Utc>>,
}

pub struct ReservationPoller {
    client: ReservationClient,
    integrations: IntegrationManager,
    events: EventStore,
    state: Mutex<HashMap<String, PollState>>,
}

impl ReservationPoller {
    pub fn new(
        client: ReservationClient,
        integrations: IntegrationManager,
        events: EventStore,
    ) -> Self {
        Self {
            client,
            integrations,
            events,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// One batch pass over all enabled integrations. Integrations inside
    /// their backoff window are skipped.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> PortalResult<()> {
        let integrations = self.integrations.list_enabled().await?;

        for integration in integrations {
            if !self.is_due(&integration.integration_id, now) {
                continue;
            }

            match self.poll_integration(&integration).await {
                Ok(projected) => {
                    self.integrations
                        .record_sync_success(&integration.integration_id, now)
                        .await?;
                    self.clear_backoff(&integration.integration_id);
                    info!(
                        "Polled integration {}: {} events projected",
                        integration.integration_id, projected
                    );
                }
                Err(e) => {
                    let stale_count = self
                        .integrations
                        .record_sync_miss(&integration.integration_id)
                        .await?;
                    let delay = self.apply_backoff(&integration.integration_id, now);
                    if stale_count >= STALE_WARN_THRESHOLD {
                        warn!(
                            "Integration {} stale ({} missed polls, next attempt in {}s): {}",
                            integration.integration_id, stale_count, delay, e
                        );
                    } else {
                        warn!(
                            "Polling integration {} failed (next attempt in {}s): {}",
                            integration.integration_id, delay, e
                        );
                    }
                }
            }
        }

        Ok(())
    }

    async fn poll_integration(&self, integration: &IntegrationConfig) -> PortalResult<usize> {
        let mut projected = 0;

        for index in 0..EVENT_SLOTS {
            let entity_id =
                ReservationClient::event_entity_id(&integration.integration_id, index);
            let state = self.client.get_entity_state(&entity_id).await?;

            let Some(state) = state else { continue };

            if let Some(event) =
                project_event(&integration.integration_id, index, &state.attributes)
            {
                self.events.upsert(event).await?;
                projected += 1;
            }
        }

        Ok(projected)
    }

    fn is_due(&self, integration_id: &str, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().expect("poller state lock poisoned");
        match state.get(integration_id).and_then(|s| s.next_attempt) {
            Some(next) => now >= next,
            None => true,
        }
    }

    fn apply_backoff(&self, integration_id: &str, now: DateTime<Utc>) -> i64 {
        let mut state = self.state.lock().expect("poller state lock poisoned");
        let entry = state.entry(integration_id.to_string()).or_default();
        entry.consecutive_errors += 1;
        let exp = (entry.consecutive_errors - 1).min(8);
        let delay = (BASE_BACKOFF_SECONDS * 2i64.saturating_pow(exp)).min(MAX_BACKOFF_SECONDS);
        entry.next_attempt = Some(now + Duration::seconds(delay));
        delay
    }

    fn clear_backoff(&self, integration_id: &str) {
        let mut state = self.state.lock().expect("poller state lock poisoned");
        state.remove(integration_id);
    }
}

/// Project one reservation event into a cache row.
///
/// Events without parsable start/end timestamps or without any usable
/// identifier are skipped. The raw attribute payload is preserved
/// verbatim.
pub fn project_event(
    integration_id: &str,
    event_index: i64,
    attributes: &serde_json::Value,
) -> Option<EventUpsert> {
    let start = attributes.get("start")?.as_str()?;
    let end = attributes.get("end")?.as_str()?;
    let start_utc = parse_event_time(start)?;
    let end_utc = parse_event_time(end)?;

    let slot_name = attr_string(attributes, "slot_name");
    let slot_code = attr_string(attributes, "slot_code");
    let last_four = attr_string(attributes, "last_four");

    if slot_name.is_none() && slot_code.is_none() && last_four.is_none() {
        return None;
    }

    Some(EventUpsert {
        integration_id: integration_id.to_string(),
        event_index,
        slot_name,
        slot_code,
        last_four,
        start_utc,
        end_utc,
        raw_attributes: attributes.to_string(),
    })
}

fn attr_string(attributes: &serde_json::Value, key: &str) -> Option<String> {
    attributes
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    timeutil::parse_db(raw).ok()
}
