//! Booking platform API — event type discovery, scheduled events, invitees.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{error_for_status, send_with_retry, BookingApiError, BookingClient};

// ============================================================================
// API response types (deserialized from source JSON)
// ============================================================================

#[derive(Debug, Deserialize)]
struct CollectionResponse<T> {
    #[serde(default)]
    collection: Vec<T>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEventType {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    active: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawScheduledEvent {
    #[serde(default)]
    id: String,
    #[serde(default)]
    event_type: Option<String>,
    start_time: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInvitee {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

// ============================================================================
// Public types
// ============================================================================

/// An event category as returned by the source's listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTypeInfo {
    pub id: String,
    pub name: String,
    pub active: bool,
}

/// A normalized scheduled event from the source.
///
/// `status` stays in the source's spelling here; normalization to the
/// canonical enum happens in the reconciler so the raw value is still
/// available for logging.
#[derive(Debug, Clone)]
pub struct BookingEvent {
    pub id: String,
    pub event_type_id: String,
    pub start_time: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub status: String,
}

/// One page of scheduled events plus the continuation token, if any.
#[derive(Debug, Clone, Default)]
pub struct EventsPage {
    pub events: Vec<BookingEvent>,
    pub next_page_token: Option<String>,
}

/// Query for one page of the scheduled-events walk.
#[derive(Debug, Clone)]
pub struct EventsPageQuery<'a> {
    pub organization: &'a str,
    pub min_start_time: DateTime<Utc>,
    pub max_start_time: DateTime<Utc>,
    /// Source spelling of the status filter (one status per call).
    pub status: &'a str,
    pub page_token: Option<&'a str>,
}

/// Invitee identity for one scheduled event.
#[derive(Debug, Clone, Default)]
pub struct InviteeDetail {
    pub name: Option<String>,
    pub email: Option<String>,
}

// ============================================================================
// Source abstraction
// ============================================================================

/// The reconciler's view of the external event source.
///
/// `BookingClient` is the HTTP implementation; tests substitute an
/// in-memory double. Each `list_events_page` call is one fresh request —
/// the walk itself (token threading, ceilings, delays) belongs to the
/// caller.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn list_event_types(
        &self,
        organization: &str,
    ) -> Result<Vec<EventTypeInfo>, BookingApiError>;

    async fn list_events_page(
        &self,
        query: &EventsPageQuery<'_>,
    ) -> Result<EventsPage, BookingApiError>;

    async fn get_invitee(&self, event_id: &str) -> Result<InviteeDetail, BookingApiError>;
}

#[async_trait]
impl EventSource for BookingClient {
    /// Fetch the organization's event categories.
    async fn list_event_types(
        &self,
        organization: &str,
    ) -> Result<Vec<EventTypeInfo>, BookingApiError> {
        let request = self.get(self.endpoint("event_types")?).query(&[
            ("organization", organization),
            ("count", "100"),
        ]);
        let response = error_for_status(send_with_retry(request, self.policy()).await?).await?;
        let body: CollectionResponse<RawEventType> = response.json().await?;

        Ok(body
            .collection
            .into_iter()
            .filter(|raw| !raw.id.is_empty())
            .map(|raw| EventTypeInfo {
                name: raw.name.unwrap_or_else(|| raw.id.clone()),
                id: raw.id,
                active: raw.active,
            })
            .collect())
    }

    /// Fetch one page of scheduled events for a single status filter.
    async fn list_events_page(
        &self,
        query: &EventsPageQuery<'_>,
    ) -> Result<EventsPage, BookingApiError> {
        let count = self.page_size().to_string();
        let min_start = query.min_start_time.to_rfc3339();
        let max_start = query.max_start_time.to_rfc3339();

        let mut request = self.get(self.endpoint("scheduled_events")?).query(&[
            ("organization", query.organization),
            ("min_start_time", min_start.as_str()),
            ("max_start_time", max_start.as_str()),
            ("status", query.status),
            ("count", count.as_str()),
        ]);
        if let Some(token) = query.page_token {
            request = request.query(&[("page_token", token)]);
        }

        let response = error_for_status(send_with_retry(request, self.policy()).await?).await?;
        let body: CollectionResponse<RawScheduledEvent> = response.json().await?;

        // Malformed records are dropped (with a warning) rather than
        // sinking the whole page.
        let mut events = Vec::with_capacity(body.collection.len());
        for raw in body.collection {
            if let Some(event) = normalize_event(raw) {
                events.push(event);
            }
        }

        Ok(EventsPage {
            events,
            next_page_token: body.pagination.next_page_token,
        })
    }

    /// Fetch the first invitee for an event. The source models invitees as
    /// a sub-collection; a solo booking has exactly one.
    async fn get_invitee(&self, event_id: &str) -> Result<InviteeDetail, BookingApiError> {
        let path = format!("scheduled_events/{}/invitees", event_id);
        let request = self.get(self.endpoint(&path)?);
        let response = error_for_status(send_with_retry(request, self.policy()).await?).await?;
        let body: CollectionResponse<RawInvitee> = response.json().await?;

        Ok(body
            .collection
            .into_iter()
            .next()
            .map(|raw| InviteeDetail {
                name: raw.name,
                email: raw.email,
            })
            .unwrap_or_default())
    }
}

/// Normalize a raw record. Returns None (with a warning) when the record is
/// unusable: no ID, no type, or an unparseable start time.
fn normalize_event(raw: RawScheduledEvent) -> Option<BookingEvent> {
    if raw.id.is_empty() {
        log::warn!("Dropping scheduled event with empty id");
        return None;
    }
    let Some(event_type_id) = raw.event_type.filter(|t| !t.is_empty()) else {
        log::warn!("Dropping event {}: no event type", raw.id);
        return None;
    };
    let Some(start_time) = raw.start_time.as_deref().and_then(parse_timestamp) else {
        log::warn!(
            "Dropping event {}: unparseable start_time {:?}",
            raw.id,
            raw.start_time
        );
        return None;
    };

    Some(BookingEvent {
        event_type_id,
        start_time,
        created_at: raw.created_at.as_deref().and_then(parse_timestamp),
        updated_at: raw.updated_at.as_deref().and_then(parse_timestamp),
        status: raw.status.unwrap_or_else(|| "active".to_string()),
        id: raw.id,
    })
}

/// Parse an ISO 8601 timestamp to UTC.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s.replace('Z', "+00:00"))
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
