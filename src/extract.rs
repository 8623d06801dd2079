//! Reference discovery in stored content.
//!
//! Three independent shapes are recognised in a single pass over a body:
//!
//! | Shape | Example |
//! |-------|---------|
//! | image tag `src` | `<img class="x" src="/uploads/2022/05/a.jpg">` |
//! | gallery shortcode id list | `[gallery ids="12,34,56"]` |
//! | bare managed upload URL | `see https://site.test/wp-content/uploads/2023/09/a.png` |
//!
//! Matches from all shapes are merged and deduplicated by exact string
//! equality. Pattern matching is deliberately shallow: no HTML parsing.

use anyhow::Result;
use regex::Regex;
use std::collections::BTreeSet;

use crate::config::SiteConfig;
use crate::models::{ContentUnit, Reference};

pub struct Extractor {
    img: Regex,
    gallery: Regex,
    bare: Regex,
}

impl Extractor {
    pub fn new(site: &SiteConfig) -> Result<Self> {
        // `src` must follow whitespace so `data-src` and friends never match.
        let img = Regex::new(r#"(?i)<img\s(?:[^>]*?\s)?src\s*=\s*["']([^"']+)["'][^>]*>"#)?;
        let gallery = Regex::new(r#"(?i)\[gallery\b[^\]]*?\bids\s*=\s*["']([^"']+)["'][^\]]*\]"#)?;
        let bare = Regex::new(&format!(
            r#"(?i)https?://(?:[a-z0-9-]+\.)*{}{}[^"'<>\s]+"#,
            regex::escape(&site.domain),
            regex::escape(&site.canonical_upload_path),
        ))?;
        Ok(Self { img, gallery, bare })
    }

    /// Every distinct reference string in `content`. Empty for `None` or `""`.
    pub fn extract(&self, content: Option<&str>) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let content = match content {
            Some(c) if !c.is_empty() => c,
            _ => return found,
        };

        for caps in self.img.captures_iter(content) {
            found.insert(caps[1].to_string());
        }
        for caps in self.gallery.captures_iter(content) {
            found.insert(caps[1].to_string());
        }
        for m in self.bare.find_iter(content) {
            found.insert(m.as_str().to_string());
        }

        found
    }

    /// References of one content unit: body matches attributed to
    /// `body_field`, then each non-empty scalar field verbatim.
    pub fn extract_references(&self, unit: &ContentUnit, body_field: &str) -> Vec<Reference> {
        let mut refs: Vec<Reference> = self
            .extract(unit.body.as_deref())
            .into_iter()
            .map(|raw| Reference {
                content_id: unit.id.clone(),
                field: body_field.to_string(),
                raw,
            })
            .collect();

        for (name, value) in &unit.fields {
            if let Some(value) = value.as_deref().map(str::trim) {
                if !value.is_empty() {
                    refs.push(Reference {
                        content_id: unit.id.clone(),
                        field: name.clone(),
                        raw: value.to_string(),
                    });
                }
            }
        }

        refs
    }
}
