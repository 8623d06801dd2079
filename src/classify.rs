//! Structural classification of references.
//!
//! [`Classifier::classify`] is a pure, total function of the raw string and
//! the configured site. It parses the reference into scheme/host/path rather
//! than searching substrings, so `notmanaged.test` never counts as
//! `managed.test` and an `/uploads/` fragment buried deep in a path does not
//! make a URL an upload.

use url::Url;

use crate::config::SiteConfig;
use crate::models::{Category, ClassifiedReference, Reference};

#[derive(Debug, Clone)]
pub struct Classifier {
    domain: String,
    port: Option<u16>,
    scheme: String,
    canonical_upload_path: String,
    legacy_upload_path: String,
}

impl Classifier {
    pub fn new(site: &SiteConfig) -> Self {
        let domain = site.domain.to_ascii_lowercase();
        // `host:port` pins the port; a bare host matches any port.
        let (domain, port) = match domain.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), Some(port)),
                Err(_) => (domain.clone(), None),
            },
            None => (domain, None),
        };
        Self {
            domain,
            port,
            scheme: site.scheme.clone(),
            canonical_upload_path: site.canonical_upload_path.clone(),
            legacy_upload_path: site.legacy_upload_path.clone(),
        }
    }

    pub fn classify(&self, raw: &str) -> Category {
        let raw = raw.trim();
        if raw.is_empty() {
            return Category::Empty;
        }

        // Domain checks come before the scheme check: a managed absolute URL
        // also begins with a scheme.
        if let Some(url) = self.parse_absolute(raw) {
            if self.is_managed_host(&url) {
                let path = url.path();
                return if path.starts_with(&self.canonical_upload_path) {
                    Category::ManagedUpload
                } else if path.starts_with(&self.legacy_upload_path) {
                    Category::LegacyUpload
                } else {
                    Category::ManagedOther
                };
            }
        }

        if has_scheme(raw) {
            return Category::External;
        }
        if raw.starts_with("//") {
            // scheme-relative URL on some other host
            return Category::External;
        }
        if raw.starts_with('/') {
            // Path-only references live on the managed origin; a path under
            // the legacy upload layout is a legacy upload.
            if raw.starts_with(&self.legacy_upload_path)
                && !raw.starts_with(&self.canonical_upload_path)
            {
                return Category::LegacyUpload;
            }
            return Category::Relative;
        }
        Category::Other
    }

    pub fn classify_reference(&self, reference: Reference) -> ClassifiedReference {
        let category = self.classify(&reference.raw);
        ClassifiedReference {
            reference,
            category,
        }
    }

    /// Path (plus query) of a reference that points at the managed origin,
    /// or `None` when it cannot be reduced to a path-only form.
    pub fn managed_path(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.starts_with('/') && !raw.starts_with("//") {
            return Some(raw.to_string());
        }
        let url = self.parse_absolute(raw)?;
        if !self.is_managed_host(&url) {
            return None;
        }
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Some(path)
    }

    fn parse_absolute(&self, raw: &str) -> Option<Url> {
        if raw.starts_with("//") {
            return Url::parse(&format!("{}:{}", self.scheme, raw)).ok();
        }
        if has_scheme(raw) {
            return Url::parse(raw).ok();
        }
        None
    }

    fn is_managed_host(&self, url: &Url) -> bool {
        if self.port.is_some() && url.port_or_known_default() != self.port {
            return false;
        }
        match url.host_str() {
            Some(host) => {
                let host = host.to_ascii_lowercase();
                host == self.domain || host.ends_with(&format!(".{}", self.domain))
            }
            None => false,
        }
    }
}

/// `true` when `raw` starts with an RFC 3986 scheme followed by `://`.
pub(crate) fn has_scheme(raw: &str) -> bool {
    match raw.find("://") {
        Some(idx) if idx > 0 => {
            let scheme = &raw[..idx];
            scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new(&SiteConfig {
            domain: "managed.test".into(),
            scheme: "https".into(),
            canonical_upload_path: "/wp-content/uploads/".into(),
            legacy_upload_path: "/uploads/".into(),
        })
    }

    #[test]
    fn scenario_categories() {
        let c = classifier();
        assert_eq!(c.classify("/uploads/2022/05/img.jpg"), Category::LegacyUpload);
        assert_eq!(
            c.classify("https://managed.test/wp-content/uploads/2022/05/img.jpg"),
            Category::ManagedUpload
        );
        assert_eq!(c.classify("https://other.test/a.jpg"), Category::External);
    }

    #[test]
    fn decision_order() {
        let c = classifier();
        assert_eq!(c.classify(""), Category::Empty);
        assert_eq!(c.classify("   "), Category::Empty);
        assert_eq!(
            c.classify("http://managed.test/uploads/2019/01/a.jpg"),
            Category::LegacyUpload
        );
        assert_eq!(
            c.classify("https://managed.test/about-us/"),
            Category::ManagedOther
        );
        assert_eq!(
            c.classify("//www.managed.test/wp-content/uploads/a.jpg"),
            Category::ManagedUpload
        );
        assert_eq!(c.classify("//cdn.other.test/a.jpg"), Category::External);
        assert_eq!(c.classify("/images/logo.png"), Category::Relative);
        assert_eq!(c.classify("12,34,56"), Category::Other);
        assert_eq!(c.classify("data:image/png;base64,AAAA"), Category::Other);
    }

    #[test]
    fn host_match_is_not_substring_match() {
        let c = classifier();
        assert_eq!(
            c.classify("https://notmanaged.test/wp-content/uploads/a.jpg"),
            Category::External
        );
        assert_eq!(
            c.classify("https://managed.test.evil.example/wp-content/uploads/a.jpg"),
            Category::External
        );
    }

    #[test]
    fn upload_segment_must_be_a_path_prefix() {
        let c = classifier();
        assert_eq!(
            c.classify("https://managed.test/blog/uploads/a.jpg"),
            Category::ManagedOther
        );
    }

    #[test]
    fn classify_is_deterministic() {
        let c = classifier();
        let inputs = [
            "",
            "/uploads/x.jpg",
            "https://managed.test/wp-content/uploads/a.jpg",
            "https://other.test/a.jpg",
            "garbage",
        ];
        for input in inputs {
            let first = c.classify(input);
            for _ in 0..5 {
                assert_eq!(c.classify(input), first);
            }
        }
    }

    #[test]
    fn managed_path_strips_domain() {
        let c = classifier();
        assert_eq!(
            c.managed_path("https://managed.test/wp-content/uploads/a.jpg?ver=2"),
            Some("/wp-content/uploads/a.jpg?ver=2".to_string())
        );
        assert_eq!(
            c.managed_path("/uploads/a.jpg"),
            Some("/uploads/a.jpg".to_string())
        );
        assert_eq!(c.managed_path("https://other.test/a.jpg"), None);
        assert_eq!(c.managed_path("12,34"), None);
    }

    #[test]
    fn domain_with_port_pins_the_port() {
        let c = Classifier::new(&SiteConfig {
            domain: "127.0.0.1:8080".into(),
            scheme: "http".into(),
            canonical_upload_path: "/wp-content/uploads/".into(),
            legacy_upload_path: "/uploads/".into(),
        });
        assert_eq!(
            c.classify("http://127.0.0.1:8080/wp-content/uploads/a.jpg"),
            Category::ManagedUpload
        );
        assert_eq!(
            c.classify("http://127.0.0.1:9090/wp-content/uploads/a.jpg"),
            Category::External
        );
        assert_eq!(
            c.managed_path("http://127.0.0.1:8080/uploads/a.jpg"),
            Some("/uploads/a.jpg".to_string())
        );
    }
}
