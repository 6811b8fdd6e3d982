//! Subscription filters.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// A REQ filter selecting events by id, author, kind, tag, time range or
/// count limit. Tag filters are keyed `#x` on the wire and kept in `tags`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(flatten)]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    /// Whether `event` satisfies every constraint of this filter.
    ///
    /// Ids and authors use prefix matching; tag entries keyed `#x` require
    /// an intersection with the event's `x` tag values. Keys in `tags` not
    /// starting with `#` are ignored.
    pub fn matches_event(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids
            && !ids.iter().any(|id| event.id.starts_with(id))
        {
            return false;
        }

        if let Some(authors) = &self.authors
            && !authors.iter().any(|author| event.pubkey.starts_with(author))
        {
            return false;
        }

        if let Some(kinds) = &self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }

        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }

        if let Some(until) = self.until
            && event.created_at > until
        {
            return false;
        }

        for (tag_name, wanted) in &self.tags {
            let Some(name) = tag_name.strip_prefix('#') else {
                continue;
            };
            if !event
                .tag_values(name)
                .any(|value| wanted.iter().any(|want| want == value))
            {
                return false;
            }
        }

        true
    }
}
