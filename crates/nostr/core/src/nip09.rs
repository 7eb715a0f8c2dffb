//! NIP-09: Event Deletion Request.
//!
//! Deletion is a request, not a command: relays and clients may ignore it.

use crate::nip01::{Event, EventTemplate, unix_now};

pub const DELETION_REQUEST_KIND: u16 = 5;

/// Template for a kind-5 request deleting the given events.
pub fn deletion_template<I, S>(event_ids: I, reason: Option<&str>) -> EventTemplate
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    EventTemplate {
        created_at: unix_now(),
        kind: DELETION_REQUEST_KIND,
        tags: event_ids
            .into_iter()
            .map(|id| vec!["e".to_string(), id.into()])
            .collect(),
        content: reason.unwrap_or_default().to_string(),
    }
}

pub fn is_deletion_request(event: &Event) -> bool {
    event.kind == DELETION_REQUEST_KIND
}

/// Ids named by a deletion request's `e` tags.
pub fn deleted_event_ids(event: &Event) -> Vec<&str> {
    if !is_deletion_request(event) {
        return Vec::new();
    }
    event.tag_values("e").collect()
}
