//! Subscription filters sent in `REQ` frames

use serde::{Deserialize, Serialize};

use crate::event::{Kind, SignedEvent};

/// Predicate over events: every populated field must match
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Exact event ids
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    /// Event kinds
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<Kind>,
    /// Author public keys (hex)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    /// Values of `p` tags (hex)
    #[serde(rename = "#p", default, skip_serializing_if = "Vec::is_empty")]
    pub p_tags: Vec<String>,
    /// Maximum number of stored events to return
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    /// Empty filter (matches everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to event ids
    pub fn ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.ids.extend(ids);
        self
    }

    /// Restrict to a kind
    pub fn kind(mut self, kind: Kind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Restrict to authors
    pub fn authors(mut self, authors: impl IntoIterator<Item = String>) -> Self {
        self.authors.extend(authors);
        self
    }

    /// Restrict to `p`-tagged recipients
    pub fn p_tags(mut self, pubkeys: impl IntoIterator<Item = String>) -> Self {
        self.p_tags.extend(pubkeys);
        self
    }

    /// Cap the number of results
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` satisfies this filter (ignores `limit`)
    pub fn matches(&self, event: &SignedEvent) -> bool {
        (self.ids.is_empty() || self.ids.contains(&event.id))
            && (self.kinds.is_empty() || self.kinds.contains(&event.kind))
            && (self.authors.is_empty() || self.authors.contains(&event.pubkey))
            && (self.p_tags.is_empty()
                || event
                    .tag_values("p")
                    .any(|p| self.p_tags.iter().any(|wanted| wanted == p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::encrypted_direct_message;
    use crate::keys::Keys;

    #[test]
    fn test_wire_shape() {
        let filter = Filter::new()
            .kind(Kind::ENCRYPTED_DIRECT_MESSAGE)
            .authors(vec!["ab".into()])
            .p_tags(vec!["ab".into()])
            .limit(100);
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kinds":[4],"authors":["ab"],"#p":["ab"],"limit":100})
        );
    }

    #[test]
    fn test_matches_self_addressed() {
        let keys = Keys::generate();
        let other = Keys::generate();
        let own = encrypted_direct_message(&keys, &keys.public_key(), "x").unwrap();
        let to_other = encrypted_direct_message(&keys, &other.public_key(), "x").unwrap();

        let filter = Filter::new()
            .kind(Kind::ENCRYPTED_DIRECT_MESSAGE)
            .authors(vec![keys.public_hex()])
            .p_tags(vec![keys.public_hex()]);

        assert!(filter.matches(&own));
        assert!(!filter.matches(&to_other));
    }

    #[test]
    fn test_matches_by_id() {
        let keys = Keys::generate();
        let event = encrypted_direct_message(&keys, &keys.public_key(), "x").unwrap();
        assert!(Filter::new().ids(vec![event.id.clone()]).matches(&event));
        assert!(!Filter::new().ids(vec!["00".repeat(32)]).matches(&event));
        assert!(Filter::new().matches(&event));
    }
}
