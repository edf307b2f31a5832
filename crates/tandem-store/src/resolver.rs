//! Identifier Resolver - rewrites outbox items once a local id resolves.
//!
//! Items reference not-yet-created parents through placeholders of the form
//! `{{local:<ULID>}}` in their URL and body. When the server confirms a
//! creation, every live item depending on that local id gets the placeholder
//! replaced by the remote id and loses the dependency.

use crate::outbox::{ItemState, Outbox};
use serde_json::Value;
use std::collections::BTreeSet;
use tandem_core::{ItemId, LocalId, RemoteId};

const OPEN: &str = "{{local:";
const CLOSE: &str = "}}";

/// The placeholder token standing in for `id` until it resolves.
pub fn placeholder(id: &LocalId) -> String {
    format!("{}{}{}", OPEN, id, CLOSE)
}

/// Every local id referenced by a placeholder in `text`.
pub fn placeholders_in(text: &str) -> BTreeSet<LocalId> {
    let mut found = BTreeSet::new();
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find(CLOSE) else {
            break;
        };
        if let Ok(id) = after[..end].parse::<LocalId>() {
            found.insert(id);
        }
        rest = &after[end + CLOSE.len()..];
    }
    found
}

fn placeholders_in_value(value: &Value, found: &mut BTreeSet<LocalId>) {
    match value {
        Value::String(s) => found.extend(placeholders_in(s)),
        Value::Array(values) => values.iter().for_each(|v| placeholders_in_value(v, found)),
        Value::Object(map) => map.values().for_each(|v| placeholders_in_value(v, found)),
        _ => {}
    }
}

/// Placeholders still present in a URL and body.
pub fn unresolved_placeholders(url: &str, body: Option<&Value>) -> BTreeSet<LocalId> {
    let mut found = placeholders_in(url);
    if let Some(body) = body {
        placeholders_in_value(body, &mut found);
    }
    found
}

/// Replace the placeholder of `local` with `remote` in every string of `value`.
/// Returns whether anything changed.
pub fn substitute_value(value: &mut Value, token: &str, remote: &RemoteId) -> bool {
    match value {
        Value::String(s) if s.contains(token) => {
            *s = s.replace(token, remote.as_str());
            true
        }
        Value::Array(values) => values
            .iter_mut()
            .fold(false, |changed, v| substitute_value(v, token, remote) || changed),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |changed, v| substitute_value(v, token, remote) || changed),
        _ => false,
    }
}

pub struct IdentifierResolver;

impl IdentifierResolver {
    /// Rewrite every queued, retrying or in-flight item that depends on
    /// `local`. Returns the rewritten items.
    pub fn on_resolved(outbox: &mut Outbox, local: &LocalId, remote: &RemoteId) -> Vec<ItemId> {
        let token = placeholder(local);
        let mut rewritten = Vec::new();

        for id in outbox.items_depending_on(local) {
            let changed = outbox.update(&id, |item| {
                if item.state == ItemState::Failed {
                    return false;
                }
                item.url_template = item.url_template.replace(&token, remote.as_str());
                if let Some(body) = item.body.as_mut() {
                    substitute_value(body, &token, remote);
                }
                item.dependency_refs.remove(local);
                true
            });
            if changed == Some(true) {
                rewritten.push(id);
            }
        }

        if !rewritten.is_empty() {
            tracing::debug!(
                local = %local,
                remote = %remote,
                items = rewritten.len(),
                "rewrote dependents of resolved entity"
            );
        }
        rewritten
    }
}
