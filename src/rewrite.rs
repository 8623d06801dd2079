//! Rewriting persisted references to their relocated addresses.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::classify::has_scheme;
use crate::content::ContentStore;
use crate::models::{ContentUnit, FetchResult};

/// Original reference → new URL for every successful fetch. When the same
/// original appears more than once, the first result wins.
pub fn mapping_from_results(results: &[FetchResult]) -> BTreeMap<String, String> {
    let mut mapping = BTreeMap::new();
    for result in results.iter().filter(|r| r.outcome.is_success()) {
        mapping
            .entry(result.original.clone())
            .or_insert_with(|| result.new_url.clone());
    }
    mapping
}

/// Apply `mapping` to one unit. Returns `None` when nothing changed, in
/// which case the caller must not persist the unit.
///
/// Absolute originals are replaced wherever they occur in the body, longest
/// first so a URL is never clobbered by one of its prefixes. Path-only
/// originals are replaced wherever they are not the path part of some
/// absolute URL (`src="R"`, `srcset="R 1x, R 2x"`, `url(R)`, free text).
/// Scalar fields are replaced only when their whole value is a mapped
/// original.
pub fn rewrite_content(
    unit: &ContentUnit,
    mapping: &BTreeMap<String, String>,
) -> Option<ContentUnit> {
    let mut updated = unit.clone();
    let mut changed = false;

    if let Some(body) = updated.body.as_mut() {
        let mut keys: Vec<&String> = mapping.keys().collect();
        keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        for old in keys {
            let new = &mapping[old];
            if old.is_empty() || old == new {
                continue;
            }
            if is_absolute(old) {
                if body.contains(old.as_str()) {
                    *body = body.replace(old.as_str(), new);
                    changed = true;
                }
            } else if let Some(replaced) = replace_path(body, old, new) {
                *body = replaced;
                changed = true;
            }
        }
    }

    for value in updated.fields.values_mut() {
        if let Some(current) = value.as_ref() {
            if let Some(new) = mapping.get(current.trim()) {
                if new != current {
                    *value = Some(new.clone());
                    changed = true;
                }
            }
        }
    }

    if changed {
        Some(updated)
    } else {
        None
    }
}

fn is_absolute(reference: &str) -> bool {
    has_scheme(reference) || reference.starts_with("//")
}

/// Replace every occurrence of the path `old` that is not directly preceded
/// by a host, port, or path character. `None` when nothing was replaced.
fn replace_path(body: &str, old: &str, new: &str) -> Option<String> {
    let mut out = String::with_capacity(body.len());
    let mut last = 0;
    let mut replaced = false;

    for (idx, _) in body.match_indices(old) {
        let preceded_by_host = body[..idx].chars().next_back().is_some_and(|c| {
            c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '/' | '%' | '@' | '~')
        });
        if preceded_by_host {
            continue;
        }
        out.push_str(&body[last..idx]);
        out.push_str(new);
        last = idx + old.len();
        replaced = true;
    }

    if !replaced {
        return None;
    }
    out.push_str(&body[last..]);
    Some(out)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RewriteSummary {
    pub scanned: u64,
    pub updated: u64,
    pub unchanged: u64,
}

/// Rewrite every published unit, persisting only the ones that changed.
pub async fn rewrite_all(
    store: &dyn ContentStore,
    mapping: &BTreeMap<String, String>,
    dry_run: bool,
) -> Result<RewriteSummary> {
    let mut summary = RewriteSummary::default();
    for unit in store.published().await? {
        summary.scanned += 1;
        match rewrite_content(&unit, mapping) {
            Some(updated) => {
                if !dry_run {
                    store.update(&updated).await?;
                }
                debug!(id = %unit.id, dry_run, "content rewritten");
                summary.updated += 1;
            }
            None => summary.unchanged += 1,
        }
    }
    Ok(summary)
}
