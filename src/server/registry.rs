//! Registration-order registries with opaque cursor pagination.
//!
//! Each kind (tools, resources, templates, prompts) gets its own
//! [`Registry`] guarded by a single read/write lock. Lookups take the
//! read lock; mutations take the write lock and the caller emits any
//! list-changed notification after the lock is released.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::protocol::{Prompt, Resource, ResourceTemplate, Tool};
use crate::uri_template::{TemplateValue, UriTemplate};

use super::{PromptHandler, ResourceHandler, ToolHandler};

/// A registered tool and its handler.
#[derive(Clone)]
pub struct ToolEntry {
    /// Tool definition served by `tools/list`.
    pub tool: Tool,
    /// The handler invoked by `tools/call`.
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for ToolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolEntry").field("tool", &self.tool.name).finish()
    }
}

/// A registered literal-URI resource and its handler.
#[derive(Clone)]
pub struct ResourceEntry {
    /// Resource definition served by `resources/list`.
    pub resource: Resource,
    /// The handler invoked by `resources/read`.
    pub handler: Arc<dyn ResourceHandler>,
}

impl std::fmt::Debug for ResourceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceEntry")
            .field("uri", &self.resource.uri)
            .finish()
    }
}

/// A registered resource template, its compiled matcher, and handler.
#[derive(Clone)]
pub struct TemplateEntry {
    /// Template definition served by `resources/templates/list`.
    pub template: ResourceTemplate,
    /// Matcher compiled at registration time.
    pub matcher: Arc<UriTemplate>,
    /// The handler invoked when the template matches a read URI.
    pub handler: Arc<dyn ResourceHandler>,
}

impl std::fmt::Debug for TemplateEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEntry")
            .field("template", &self.template.uri_template)
            .finish()
    }
}

/// A registered prompt and its renderer.
#[derive(Clone)]
pub struct PromptEntry {
    /// Prompt definition served by `prompts/list`.
    pub prompt: Prompt,
    /// The renderer invoked by `prompts/get`.
    pub handler: Arc<dyn PromptHandler>,
}

impl std::fmt::Debug for PromptEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptEntry")
            .field("prompt", &self.prompt.name)
            .finish()
    }
}

/// Encode a pagination cursor from the last returned key.
pub fn encode_cursor(key: &str) -> String {
    BASE64.encode(key.as_bytes())
}

/// Decode a pagination cursor back into a key.
pub fn decode_cursor(cursor: &str) -> Result<String> {
    let bytes = BASE64
        .decode(cursor.as_bytes())
        .map_err(|_| Error::invalid_params("malformed pagination cursor"))?;
    String::from_utf8(bytes).map_err(|_| Error::invalid_params("malformed pagination cursor"))
}

/// Paginate an ordered `(key, value)` sequence.
///
/// Returns the page after the cursor's key in sequence order. A page of
/// exactly `limit` items carries a cursor naming its last key; shorter
/// pages end the iteration. A cursor at the final key yields an empty
/// page and no cursor. `limit = None` returns everything in one page.
pub fn paginate<T: Clone>(
    ordered: &[(String, T)],
    cursor: Option<&str>,
    limit: Option<usize>,
) -> Result<(Vec<T>, Option<String>)> {
    let start = match cursor {
        None => 0,
        Some(cursor) => {
            let key = decode_cursor(cursor)?;
            let position = ordered
                .iter()
                .position(|(k, _)| *k == key)
                .ok_or_else(|| Error::invalid_params("unknown pagination cursor"))?;
            position + 1
        },
    };

    let remaining = &ordered[start.min(ordered.len())..];
    match limit {
        None => Ok((remaining.iter().map(|(_, v)| v.clone()).collect(), None)),
        Some(limit) => {
            let page: Vec<_> = remaining.iter().take(limit).cloned().collect();
            let next = if page.len() == limit && limit > 0 {
                page.last().map(|(k, _)| encode_cursor(k))
            } else {
                None
            };
            Ok((page.into_iter().map(|(_, v)| v).collect(), next))
        },
    }
}

/// An insertion-ordered map of registered entries behind one RW lock.
pub struct Registry<T> {
    entries: RwLock<IndexMap<String, T>>,
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.entries.read().len())
            .finish()
    }
}

impl<T: Clone> Registry<T> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
        }
    }

    /// Insert or replace an entry. Returns true when a previous entry
    /// with the same key was replaced (order is preserved in that case).
    pub fn insert(&self, key: String, value: T) -> bool {
        self.entries.write().insert(key, value).is_some()
    }

    /// Remove an entry by key.
    pub fn remove(&self, key: &str) -> Option<T> {
        self.entries.write().shift_remove(key)
    }

    /// Look up an entry by key.
    pub fn get(&self, key: &str) -> Option<T> {
        self.entries.read().get(key).cloned()
    }

    /// Whether a key is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of `(key, value)` pairs in registration order.
    pub fn snapshot(&self) -> Vec<(String, T)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Snapshot with an overlay layered on top: overlay entries replace
    /// same-keyed global entries in place-of-order terms (the shadowed
    /// global is dropped, the overlay entry lists in the overlay's own
    /// registration order, after all globals).
    pub fn snapshot_with_overlay(&self, overlay: &IndexMap<String, T>) -> Vec<(String, T)> {
        let mut combined: Vec<(String, T)> = self
            .entries
            .read()
            .iter()
            .filter(|(k, _)| !overlay.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        combined.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
        combined
    }
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick the best template match for a URI from an ordered candidate list.
///
/// Exact resources are resolved before this is consulted. Among matching
/// templates the longest literal prefix wins; ties keep the earliest
/// registered (overlay templates are ordered before globals by the
/// caller, so an overlay wins its ties against the global layer).
pub fn best_template_match(
    candidates: &[TemplateEntry],
    uri: &str,
) -> Option<(TemplateEntry, std::collections::HashMap<String, TemplateValue>)> {
    let mut best: Option<(usize, TemplateEntry, std::collections::HashMap<String, TemplateValue>)> =
        None;
    for entry in candidates {
        if let Some(values) = entry.matcher.match_uri(uri) {
            let score = entry.matcher.literal_prefix().len();
            let better = match &best {
                None => true,
                Some((best_score, _, _)) => score > *best_score,
            };
            if better {
                best = Some((score, entry.clone(), values));
            }
        }
    }
    best.map(|(_, entry, values)| (entry, values))
}
