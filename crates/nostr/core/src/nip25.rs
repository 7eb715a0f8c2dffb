//! NIP-25: Reactions.

use crate::nip01::{Event, EventTemplate, unix_now};

pub const REACTION_KIND: u16 = 7;

/// Template reacting to `event_id` with `content` (`"+"`, `"-"` or an emoji).
///
/// The author's pubkey is tagged with `p` when known so they can find it.
pub fn reaction_template(event_id: &str, author: Option<&str>, content: &str) -> EventTemplate {
    let mut tags = vec![vec!["e".to_string(), event_id.to_string()]];
    if let Some(author) = author {
        tags.push(vec!["p".to_string(), author.to_string()]);
    }
    EventTemplate {
        created_at: unix_now(),
        kind: REACTION_KIND,
        tags,
        content: content.to_string(),
    }
}

/// The event a reaction points at: the last `e` tag.
pub fn reacted_event_id(event: &Event) -> Option<&str> {
    if event.kind != REACTION_KIND {
        return None;
    }
    event.tag_values("e").last()
}
