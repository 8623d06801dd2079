use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::Category;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub site: SiteConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub redirects: RedirectsConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// The managed (source) WordPress site.
#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    pub domain: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_canonical_upload_path")]
    pub canonical_upload_path: String,
    #[serde(default = "default_legacy_upload_path")]
    pub legacy_upload_path: String,
}

fn default_scheme() -> String {
    "https".to_string()
}
fn default_canonical_upload_path() -> String {
    "/wp-content/uploads/".to_string()
}
fn default_legacy_upload_path() -> String {
    "/uploads/".to_string()
}

impl SiteConfig {
    /// `scheme://domain`, without a trailing slash.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.domain)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssetsConfig {
    #[serde(default = "default_assets_root")]
    pub root: PathBuf,
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,
    #[serde(default = "default_partition")]
    pub default_partition: (String, String),
    #[serde(default = "default_extension")]
    pub default_extension: String,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            root: default_assets_root(),
            url_prefix: default_url_prefix(),
            default_partition: default_partition(),
            default_extension: default_extension(),
        }
    }
}

fn default_assets_root() -> PathBuf {
    PathBuf::from("public/images")
}
fn default_url_prefix() -> String {
    "/images".to_string()
}
fn default_partition() -> (String, String) {
    ("2023".to_string(), "01".to_string())
}
fn default_extension() -> String {
    "jpg".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
    #[serde(default = "default_categories")]
    pub categories: Vec<Category>,
    /// Mirror prefixes tried after the origin fails, e.g. `https://web.archive.org/web/`.
    #[serde(default)]
    pub fallback_prefixes: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            rate_limit_ms: default_rate_limit_ms(),
            categories: default_categories(),
            fallback_prefixes: Vec::new(),
        }
    }
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko)"
        .to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    2000
}
fn default_rate_limit_ms() -> u64 {
    500
}
fn default_categories() -> Vec<Category> {
    vec![
        Category::ManagedUpload,
        Category::LegacyUpload,
        Category::ManagedOther,
        Category::Relative,
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedirectsConfig {
    #[serde(default = "default_status_code")]
    pub status_code: u16,
}

impl Default for RedirectsConfig {
    fn default() -> Self {
        Self {
            status_code: default_status_code(),
        }
    }
}

fn default_status_code() -> u16 {
    301
}

/// Where published content lives. The schema is owned by the content
/// system; only these columns are read and (for rewrites) updated.
#[derive(Debug, Deserialize, Clone)]
pub struct ContentConfig {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_body_column")]
    pub body_column: String,
    #[serde(default = "default_status_column")]
    pub status_column: String,
    #[serde(default = "default_published_value")]
    pub published_value: String,
    #[serde(default = "default_scalar_fields")]
    pub scalar_fields: Vec<String>,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            id_column: default_id_column(),
            body_column: default_body_column(),
            status_column: default_status_column(),
            published_value: default_published_value(),
            scalar_fields: default_scalar_fields(),
        }
    }
}

fn default_table() -> String {
    "articles".to_string()
}
fn default_id_column() -> String {
    "id".to_string()
}
fn default_body_column() -> String {
    "content".to_string()
}
fn default_status_column() -> String {
    "status".to_string()
}
fn default_published_value() -> String {
    "published".to_string()
}
fn default_scalar_fields() -> Vec<String> {
    vec!["featured_image".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArtifactsConfig {
    #[serde(default = "default_artifacts_dir")]
    pub dir: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: default_artifacts_dir(),
        }
    }
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("data")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate site
    let domain = config.site.domain.trim();
    if domain.is_empty() || domain.contains('/') || domain.contains("://") {
        anyhow::bail!("site.domain must be a bare host name (got '{}')", domain);
    }
    match config.site.scheme.as_str() {
        "http" | "https" => {}
        other => anyhow::bail!("site.scheme must be http or https (got '{}')", other),
    }
    for (name, value) in [
        ("site.canonical_upload_path", &config.site.canonical_upload_path),
        ("site.legacy_upload_path", &config.site.legacy_upload_path),
    ] {
        if !value.starts_with('/') || !value.ends_with('/') {
            anyhow::bail!("{} must start and end with '/' (got '{}')", name, value);
        }
    }

    // Validate assets
    let (year, month) = &config.assets.default_partition;
    if year.len() != 4 || month.len() != 2 || !is_digits(year) || !is_digits(month) {
        anyhow::bail!(
            "assets.default_partition must be [\"YYYY\", \"MM\"] (got [\"{}\", \"{}\"])",
            year,
            month
        );
    }
    if config.assets.default_extension.is_empty() || config.assets.default_extension.contains('.')
    {
        anyhow::bail!("assets.default_extension must be an extension without a dot");
    }

    // Validate fetch
    if config.fetch.max_attempts == 0 {
        anyhow::bail!("fetch.max_attempts must be >= 1");
    }
    if config.fetch.timeout_secs == 0 {
        anyhow::bail!("fetch.timeout_secs must be > 0");
    }

    // Validate redirects
    if !matches!(config.redirects.status_code, 301 | 302 | 303 | 307 | 308) {
        anyhow::bail!(
            "redirects.status_code must be a redirect status (got {})",
            config.redirects.status_code
        );
    }

    // Validate content identifiers; they are interpolated into SQL.
    let content = &config.content;
    let mut identifiers = vec![
        ("content.table", &content.table),
        ("content.id_column", &content.id_column),
        ("content.body_column", &content.body_column),
        ("content.status_column", &content.status_column),
    ];
    for field in &content.scalar_fields {
        identifiers.push(("content.scalar_fields", field));
    }
    for (name, ident) in identifiers {
        if !is_identifier(ident) {
            anyhow::bail!("{} is not a valid SQL identifier: '{}'", name, ident);
        }
    }

    Ok(())
}

fn is_digits(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_digit())
}

pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
