//! Resolution, target derivation, and idempotent retrieval of assets.
//!
//! [`Fetcher::resolve_and_fetch`] turns one [`Reference`] into a
//! [`FetchResult`]; it never returns an error. The sequence per reference:
//!
//! 1. [`resolve`] the raw string to an absolute URL on the managed origin.
//! 2. [`derive_target`] a `{year}/{month}/{filename}` location.
//! 3. If the target file already exists, report `already-present` with no
//!    network traffic.
//! 4. Otherwise download through the injected [`HttpClient`], retrying per the
//!    [`RetryPolicy`] and pacing requests through a [`Throttle`]. Configured
//!    fallback mirrors are tried after the origin gives up.
//!
//! # Retry Strategy
//!
//! Every non-success status and every transport error is retried up to
//! `max_attempts` times with a fixed backoff between attempts (default: 3
//! attempts, 2 s apart). The final error decides the outcome:
//! `failed-http { status }` for a rejection, `failed-error { message }` for
//! anything else.

use anyhow::Result;
use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::classify::has_scheme;
use crate::config::{AssetsConfig, Config, FetchConfig, SiteConfig};
use crate::models::{Category, ClassifiedReference, FetchOutcome, FetchResult, Reference};
use crate::progress::{should_report, ProgressEvent, ProgressReporter};

/// Per-attempt failure of a single download.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Timeout, refused connection, reset stream.
    #[error("transient network error: {0}")]
    Transient(String),
    #[error("remote rejected request with HTTP {status}")]
    RemoteRejection { status: u16 },
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if !status.is_success() => FetchError::RemoteRejection {
                status: status.as_u16(),
            },
            _ => FetchError::Transient(e.to_string()),
        }
    }
}

// ============ HTTP client seam ============

/// Downloads one URL into `dest`, returning the number of bytes written.
///
/// Implementations must leave no file at `dest` unless the download
/// completed; a non-success status is reported as
/// [`FetchError::RemoteRejection`].
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError>;
}

/// [`HttpClient`] backed by `reqwest`, streaming bodies to disk.
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::RemoteRejection {
                status: status.as_u16(),
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Stream into a sibling `.part` file so an interrupted download never
        // looks like a present asset on the next run.
        let partial = partial_path(dest);
        match stream_to_file(response, &partial).await {
            Ok(bytes) => {
                tokio::fs::rename(&partial, dest).await?;
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }
}

async fn stream_to_file(mut response: reqwest::Response, path: &Path) -> Result<u64, FetchError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

// ============ Retry and pacing ============

/// How many times to try one URL and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Zero-delay policy, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.backoff_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

/// Cooperative self-throttle: a minimum interval between consecutive requests.
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Sleep until `min_interval` has passed since the previous call.
    pub async fn wait(&mut self) {
        if let Some(last) = self.last {
            let ready_at = last + self.min_interval;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

// ============ Resolution and target paths ============

/// Make `raw` absolute on the managed origin. Already-absolute URLs are
/// returned unchanged, so `resolve(resolve(x)) == resolve(x)`.
pub fn resolve(raw: &str, site: &SiteConfig) -> String {
    let raw = raw.trim();
    if raw.starts_with("//") {
        format!("{}:{}", site.scheme, raw)
    } else if has_scheme(raw) {
        raw.to_string()
    } else if raw.starts_with('/') {
        format!("{}{}", site.origin(), raw)
    } else {
        format!("{}/{}", site.origin(), raw)
    }
}

/// Where a resolved URL lands in the new asset tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub partition: (String, String),
    /// File name on disk (percent-decoded).
    pub filename: String,
    pub path: PathBuf,
    /// Public URL of the relocated asset.
    pub new_url: String,
}

pub fn derive_target(resolved: &str, assets: &AssetsConfig) -> Target {
    let path = Url::parse(resolved)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| resolved.to_string());

    let partition =
        date_partition(&path).unwrap_or_else(|| assets.default_partition.clone());

    let last = path.rsplit('/').next().unwrap_or("");
    let (url_name, filename) = if !last.is_empty() && last.contains('.') {
        (last.to_string(), decode_segment(last))
    } else {
        let synthesized = synthesize_filename(&path, &assets.default_extension);
        (synthesized.clone(), synthesized)
    };

    let (year, month) = &partition;
    let target_path = assets.root.join(year).join(month).join(&filename);
    let new_url = format!(
        "{}/{}/{}/{}",
        assets.url_prefix.trim_end_matches('/'),
        year,
        month,
        url_name
    );

    Target {
        partition,
        filename,
        path: target_path,
        new_url,
    }
}

/// First `/<4 digits>/<2 digits>/` pair of directory segments.
fn date_partition(path: &str) -> Option<(String, String)> {
    let segments: Vec<&str> = path.split('/').collect();
    segments.windows(3).find_map(|w| {
        let is_digits = |s: &str, n: usize| s.len() == n && s.chars().all(|c| c.is_ascii_digit());
        if is_digits(w[0], 4) && is_digits(w[1], 2) {
            Some((w[0].to_string(), w[1].to_string()))
        } else {
            None
        }
    })
}

fn synthesize_filename(path: &str, extension: &str) -> String {
    let cleaned: String = path
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.{}", cleaned, extension)
}

/// Percent-decode a path segment for use as a file name; fall back to the
/// raw segment when decoding would produce a separator or invalid UTF-8.
fn decode_segment(segment: &str) -> String {
    match percent_decode_str(segment).decode_utf8() {
        Ok(decoded)
            if !decoded.contains('/')
                && !decoded.contains('\\')
                && decoded != ".."
                && decoded != "." =>
        {
            decoded.into_owned()
        }
        _ => segment.to_string(),
    }
}

// ============ Fetcher ============

/// Result of fetching a classified batch.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub results: Vec<FetchResult>,
    /// `empty`/`other` references that cannot be resolved to an address.
    pub skipped_malformed: u64,
    /// References whose category is not in `fetch.categories`.
    pub skipped_excluded: u64,
}

pub struct Fetcher<C: HttpClient> {
    client: C,
    site: SiteConfig,
    assets: AssetsConfig,
    categories: Vec<Category>,
    fallback_prefixes: Vec<String>,
    retry: RetryPolicy,
    throttle: Throttle,
}

impl<C: HttpClient> Fetcher<C> {
    pub fn new(client: C, config: &Config) -> Self {
        Self {
            client,
            site: config.site.clone(),
            assets: config.assets.clone(),
            categories: config.fetch.categories.clone(),
            fallback_prefixes: config.fetch.fallback_prefixes.clone(),
            retry: RetryPolicy::from_config(&config.fetch),
            throttle: Throttle::new(Duration::from_millis(config.fetch.rate_limit_ms)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limit(mut self, min_interval: Duration) -> Self {
        self.throttle = Throttle::new(min_interval);
        self
    }

    pub async fn resolve_and_fetch(&mut self, reference: &Reference) -> FetchResult {
        let resolved = resolve(&reference.raw, &self.site);
        let target = derive_target(&resolved, &self.assets);

        let mut result = FetchResult {
            content_id: reference.content_id.clone(),
            field: reference.field.clone(),
            original: reference.raw.clone(),
            resolved_url: resolved.clone(),
            target_path: target.path.display().to_string(),
            new_url: target.new_url.clone(),
            partition: target.partition.clone(),
            filename: target.filename.clone(),
            served_from: None,
            outcome: FetchOutcome::AlreadyPresent,
        };

        if tokio::fs::try_exists(&target.path).await.unwrap_or(false) {
            debug!(url = %resolved, path = %result.target_path, "already present");
            return result;
        }

        let mut candidates = vec![resolved.clone()];
        candidates.extend(
            self.fallback_prefixes
                .iter()
                .map(|prefix| format!("{}{}", prefix, resolved)),
        );

        let mut last_err = None;
        for candidate in candidates {
            match self.fetch_with_retry(&candidate, &target.path).await {
                Ok(bytes) => {
                    info!(url = %candidate, path = %result.target_path, bytes, "downloaded");
                    result.served_from = Some(candidate);
                    result.outcome = FetchOutcome::Downloaded { bytes };
                    return result;
                }
                Err(e) => last_err = Some(e),
            }
        }

        result.outcome = match last_err {
            Some(FetchError::RemoteRejection { status }) => FetchOutcome::FailedHttp { status },
            Some(e) => FetchOutcome::FailedError {
                message: e.to_string(),
            },
            None => FetchOutcome::FailedError {
                message: "no address to fetch".to_string(),
            },
        };
        warn!(url = %resolved, outcome = ?result.outcome, "fetch failed");
        result
    }

    async fn fetch_with_retry(&mut self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let mut last_err = None;
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 && !self.retry.backoff.is_zero() {
                tokio::time::sleep(self.retry.backoff).await;
            }
            self.throttle.wait().await;

            match self.client.download(url, dest).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    debug!(url, attempt = attempt + 1, error = %e, "attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| FetchError::Transient("no attempts made".to_string())))
    }

    /// Fetch every eligible reference in order. Individual failures are
    /// recorded in the results and never stop the batch.
    pub async fn fetch_all(
        &mut self,
        references: &[ClassifiedReference],
        progress: &dyn ProgressReporter,
    ) -> FetchBatch {
        let mut batch = FetchBatch::default();
        let total = references.len() as u64;
        progress.report(ProgressEvent::Started {
            stage: "fetch",
            total,
        });

        for (i, classified) in references.iter().enumerate() {
            let category = classified.category;
            if category.is_malformed() {
                debug!(raw = %classified.reference.raw, %category, "skipping malformed reference");
                batch.skipped_malformed += 1;
            } else if !self.categories.contains(&category) {
                debug!(raw = %classified.reference.raw, %category, "skipping excluded category");
                batch.skipped_excluded += 1;
            } else {
                let result = self.resolve_and_fetch(&classified.reference).await;
                batch.results.push(result);
            }

            let n = i as u64 + 1;
            if should_report(n, total) {
                progress.report(ProgressEvent::Advanced {
                    stage: "fetch",
                    n,
                    total,
                });
            }
        }

        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    use crate::models::FetchSummary;
    use crate::progress::NoProgress;

    fn site() -> SiteConfig {
        SiteConfig {
            domain: "managed.test".into(),
            scheme: "https".into(),
            canonical_upload_path: "/wp-content/uploads/".into(),
            legacy_upload_path: "/uploads/".into(),
        }
    }

    fn config(root: &Path) -> Config {
        let text = format!(
            "[db]\npath = \"{}/db.sqlite\"\n\n[site]\ndomain = \"managed.test\"\n\n[assets]\nroot = \"{}/images\"\n",
            root.display(),
            root.display()
        );
        toml::from_str(&text).unwrap()
    }

    /// Serves a fixed body, except for URLs listed in `statuses`.
    #[derive(Default)]
    struct FakeClient {
        calls: AtomicUsize,
        statuses: Vec<(String, u16)>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpClient for FakeClient {
        async fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(url.to_string());
            if let Some((_, status)) = self.statuses.iter().find(|(u, _)| u == url) {
                return Err(FetchError::RemoteRejection { status: *status });
            }
            if url.contains("unreachable") {
                return Err(FetchError::Transient("connection refused".into()));
            }
            std::fs::create_dir_all(dest.parent().unwrap())?;
            std::fs::write(dest, b"img")?;
            Ok(3)
        }
    }

    fn reference(raw: &str) -> Reference {
        Reference {
            content_id: "1".into(),
            field: "content".into(),
            raw: raw.into(),
        }
    }

    #[test]
    fn resolve_forms() {
        let s = site();
        assert_eq!(
            resolve("//managed.test/a.jpg", &s),
            "https://managed.test/a.jpg"
        );
        assert_eq!(
            resolve("/uploads/a.jpg", &s),
            "https://managed.test/uploads/a.jpg"
        );
        assert_eq!(resolve("img/a.jpg", &s), "https://managed.test/img/a.jpg");
        assert_eq!(resolve("http://other.test/a.jpg", &s), "http://other.test/a.jpg");
    }

    #[test]
    fn resolve_is_idempotent() {
        let s = site();
        for raw in ["//managed.test/a.jpg", "/uploads/a.jpg", "x/y.png", "https://o.test/z"] {
            let once = resolve(raw, &s);
            assert_eq!(resolve(&once, &s), once);
        }
    }

    #[test]
    fn derives_date_partition_and_filename() {
        let assets = AssetsConfig::default();
        let t = derive_target(
            "https://example.test/wp-content/uploads/2023/09/photo.png",
            &assets,
        );
        assert_eq!(t.partition, ("2023".to_string(), "09".to_string()));
        assert_eq!(t.filename, "photo.png");
        assert_eq!(t.new_url, "/images/2023/09/photo.png");
        assert_eq!(t.path, PathBuf::from("public/images/2023/09/photo.png"));
    }

    #[test]
    fn falls_back_to_default_partition_and_synthesized_name() {
        let assets = AssetsConfig::default();
        let t = derive_target("https://example.test/x/y", &assets);
        assert_eq!(t.partition, ("2023".to_string(), "01".to_string()));
        assert_eq!(t.filename, "_x_y.jpg");
        assert_eq!(t.new_url, "/images/2023/01/_x_y.jpg");
    }

    #[test]
    fn year_as_file_name_is_not_a_partition() {
        let assets = AssetsConfig::default();
        let t = derive_target("https://example.test/a/2023/09", &assets);
        assert_eq!(t.partition, ("2023".to_string(), "01".to_string()));
        assert_eq!(t.filename, "_a_2023_09.jpg");
    }

    #[test]
    fn percent_encoded_names_are_decoded_on_disk_only() {
        let assets = AssetsConfig::default();
        let t = derive_target(
            "https://example.test/wp-content/uploads/2021/04/%C3%A7ay.jpg",
            &assets,
        );
        assert_eq!(t.filename, "çay.jpg");
        assert_eq!(t.new_url, "/images/2021/04/%C3%A7ay.jpg");

        let t = derive_target("https://example.test/2021/04/a%2Fb.jpg", &assets);
        assert_eq!(t.filename, "a%2Fb.jpg");
    }

    #[tokio::test]
    async fn second_fetch_is_already_present_without_network() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let mut fetcher = Fetcher::new(FakeClient::default(), &cfg)
            .with_retry(RetryPolicy::immediate(3))
            .with_rate_limit(Duration::ZERO);

        let r = reference("https://managed.test/wp-content/uploads/2022/05/img.jpg");
        let first = fetcher.resolve_and_fetch(&r).await;
        assert_eq!(first.outcome, FetchOutcome::Downloaded { bytes: 3 });
        assert!(Path::new(&first.target_path).exists());
        assert_eq!(fetcher.client.calls.load(Ordering::SeqCst), 1);

        let second = fetcher.resolve_and_fetch(&r).await;
        assert_eq!(second.outcome, FetchOutcome::AlreadyPresent);
        assert_eq!(fetcher.client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_fetch_retries_and_keeps_last_status() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let url = "https://managed.test/wp-content/uploads/2022/05/gone.jpg";
        let client = FakeClient {
            statuses: vec![(url.to_string(), 404)],
            ..Default::default()
        };
        let mut fetcher = Fetcher::new(client, &cfg)
            .with_retry(RetryPolicy::immediate(3))
            .with_rate_limit(Duration::ZERO);

        let result = fetcher.resolve_and_fetch(&reference(url)).await;
        assert_eq!(result.outcome, FetchOutcome::FailedHttp { status: 404 });
        assert_eq!(fetcher.client.calls.load(Ordering::SeqCst), 3);
        assert!(!Path::new(&result.target_path).exists());
    }

    #[tokio::test]
    async fn transport_error_becomes_failed_error() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let mut fetcher = Fetcher::new(FakeClient::default(), &cfg)
            .with_retry(RetryPolicy::immediate(2))
            .with_rate_limit(Duration::ZERO);

        let result = fetcher
            .resolve_and_fetch(&reference("https://unreachable.managed.test/a/b.png"))
            .await;
        match result.outcome {
            FetchOutcome::FailedError { message } => assert!(message.contains("refused")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn fallback_prefix_serves_after_origin_fails() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.fetch.fallback_prefixes = vec!["https://mirror.test/web/".to_string()];
        let url = "https://managed.test/wp-content/uploads/2020/02/lost.png";
        let client = FakeClient {
            statuses: vec![(url.to_string(), 410)],
            ..Default::default()
        };
        let mut fetcher = Fetcher::new(client, &cfg)
            .with_retry(RetryPolicy::immediate(1))
            .with_rate_limit(Duration::ZERO);

        let result = fetcher.resolve_and_fetch(&reference(url)).await;
        assert!(result.outcome.is_success());
        assert_eq!(
            result.served_from.as_deref(),
            Some("https://mirror.test/web/https://managed.test/wp-content/uploads/2020/02/lost.png")
        );
        assert_eq!(result.new_url, "/images/2020/02/lost.png");
    }

    #[tokio::test]
    async fn batch_of_ten_with_three_missing() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let urls: Vec<String> = (0..10)
            .map(|i| format!("https://managed.test/wp-content/uploads/2023/0{}/p{}.jpg", i % 9 + 1, i))
            .collect();
        let client = FakeClient {
            statuses: urls[..3].iter().map(|u| (u.clone(), 404)).collect(),
            ..Default::default()
        };
        let mut fetcher = Fetcher::new(client, &cfg)
            .with_retry(RetryPolicy::immediate(3))
            .with_rate_limit(Duration::ZERO);

        let refs: Vec<ClassifiedReference> = urls
            .iter()
            .map(|u| ClassifiedReference {
                reference: reference(u),
                category: Category::ManagedUpload,
            })
            .collect();
        let batch = fetcher.fetch_all(&refs, &NoProgress).await;
        let summary = FetchSummary::from_results(&batch.results);
        assert_eq!(summary.succeeded(), 7);
        assert_eq!(summary.failed, 3);
        for failed in batch.results.iter().filter(|r| !r.outcome.is_success()) {
            assert_eq!(failed.outcome, FetchOutcome::FailedHttp { status: 404 });
        }
    }

    #[tokio::test]
    async fn batch_skips_malformed_and_excluded() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let mut fetcher = Fetcher::new(FakeClient::default(), &cfg)
            .with_retry(RetryPolicy::immediate(1))
            .with_rate_limit(Duration::ZERO);

        let refs = vec![
            ClassifiedReference {
                reference: reference("12,34"),
                category: Category::Other,
            },
            ClassifiedReference {
                reference: reference("https://other.test/a.jpg"),
                category: Category::External,
            },
            ClassifiedReference {
                reference: reference("/uploads/2019/03/a.jpg"),
                category: Category::LegacyUpload,
            },
        ];
        let batch = fetcher.fetch_all(&refs, &NoProgress).await;
        assert_eq!(batch.skipped_malformed, 1);
        assert_eq!(batch.skipped_excluded, 1);
        assert_eq!(batch.results.len(), 1);
        assert_eq!(
            batch.results[0].resolved_url,
            "https://managed.test/uploads/2019/03/a.jpg"
        );
        assert_eq!(fetcher.client.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_spaces_consecutive_calls() {
        let mut throttle = Throttle::new(Duration::from_millis(500));
        let start = Instant::now();
        throttle.wait().await;
        throttle.wait().await;
        throttle.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("a/b/photo.png")),
            PathBuf::from("a/b/photo.png.part")
        );
    }
}
