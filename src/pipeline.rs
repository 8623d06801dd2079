//! Stage orchestration.
//!
//! Coordinates the relocation flow: analyze → fetch → redirects → rewrite.
//! Each `run_*` function reads its input artifact (or the content store),
//! does its work, writes its output artifact, and prints a summary on
//! stdout. Per-item failures are counted, never fatal.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::artifacts::{self, AnalysisReport, FetchReport};
use crate::classify::Classifier;
use crate::config::Config;
use crate::content::{ContentStore, SqliteContentStore};
use crate::db;
use crate::extract::Extractor;
use crate::fetch::{Fetcher, HttpClient, ReqwestClient};
use crate::migrate;
use crate::models::{Category, FetchSummary};
use crate::progress::{should_report, ProgressEvent, ProgressReporter};
use crate::redirect::{self, PersistSummary, RedirectStore, SqliteRedirectStore};
use crate::rewrite::{self, RewriteSummary};

// ============ analyze ============

/// Extract and classify the references of every published unit.
pub async fn analyze(
    store: &dyn ContentStore,
    extractor: &Extractor,
    classifier: &Classifier,
    progress: &dyn ProgressReporter,
) -> Result<AnalysisReport> {
    let units = store.published().await?;
    let total = units.len() as u64;
    progress.report(ProgressEvent::Started {
        stage: "analyze",
        total,
    });

    let mut report = AnalysisReport::default();
    for category in Category::ALL {
        report.by_category.insert(category, 0);
    }

    for (i, unit) in units.iter().enumerate() {
        report.units_scanned += 1;
        let refs = extractor.extract_references(unit, store.body_field());
        if !refs.is_empty() {
            report.units_with_references += 1;
        }
        for reference in refs {
            let classified = classifier.classify_reference(reference);
            *report.by_category.entry(classified.category).or_insert(0) += 1;
            report.references.push(classified);
        }

        let n = i as u64 + 1;
        if should_report(n, total) {
            progress.report(ProgressEvent::Advanced {
                stage: "analyze",
                n,
                total,
            });
        }
    }

    Ok(report)
}

pub async fn run_analyze(config: &Config, progress: &dyn ProgressReporter) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteContentStore::new(pool.clone(), config.content.clone());
    let extractor = Extractor::new(&config.site)?;
    let classifier = Classifier::new(&config.site);

    let report = analyze(&store, &extractor, &classifier, progress).await?;
    let path = artifacts::write_json(&config.artifacts.dir, artifacts::REFERENCES, &report)?;

    println!("analyze");
    println!("  content units: {}", report.units_scanned);
    println!("  with references: {}", report.units_with_references);
    println!("  references: {}", report.references.len());
    for (category, count) in &report.by_category {
        if *count > 0 {
            println!("    {}: {}", category, count);
        }
    }
    println!("  written: {}", path.display());
    println!("ok");

    pool.close().await;
    Ok(())
}

// ============ fetch ============

/// Fetch the references of an analysis report with any [`HttpClient`].
pub async fn fetch_references<C: HttpClient>(
    fetcher: &mut Fetcher<C>,
    analysis: &AnalysisReport,
    limit: Option<usize>,
    progress: &dyn ProgressReporter,
) -> FetchReport {
    let refs = match limit {
        Some(lim) => &analysis.references[..lim.min(analysis.references.len())],
        None => &analysis.references[..],
    };
    let batch = fetcher.fetch_all(refs, progress).await;
    let summary = FetchSummary::from_results(&batch.results);

    FetchReport {
        downloaded: summary.downloaded,
        already_present: summary.already_present,
        failed: summary.failed,
        skipped_malformed: batch.skipped_malformed,
        skipped_excluded: batch.skipped_excluded,
        results: batch.results,
    }
}

pub async fn run_fetch(
    config: &Config,
    limit: Option<usize>,
    progress: &dyn ProgressReporter,
) -> Result<()> {
    let analysis: AnalysisReport =
        artifacts::read_json(&config.artifacts.dir, artifacts::REFERENCES, "analyze")?;

    let client = ReqwestClient::new(&config.fetch)?;
    let mut fetcher = Fetcher::new(client, config);
    let report = fetch_references(&mut fetcher, &analysis, limit, progress).await;
    let path = artifacts::write_json(&config.artifacts.dir, artifacts::FETCH_RESULTS, &report)?;

    println!("fetch");
    println!("  references: {}", analysis.references.len());
    println!("  downloaded: {}", report.downloaded);
    println!("  already present: {}", report.already_present);
    println!("  failed: {}", report.failed);
    println!("  skipped (malformed): {}", report.skipped_malformed);
    println!("  skipped (excluded): {}", report.skipped_excluded);
    println!("  written: {}", path.display());
    println!("ok");
    Ok(())
}

// ============ redirects ============

pub async fn run_redirects(config: &Config) -> Result<()> {
    // Checked before touching the database.
    let fetched: FetchReport =
        artifacts::read_json(&config.artifacts.dir, artifacts::FETCH_RESULTS, "fetch")?;

    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;
    let store = SqliteRedirectStore::new(pool.clone());

    let classifier = Classifier::new(&config.site);
    let rules = redirect::build_rules(
        &fetched.results,
        &classifier,
        config.redirects.status_code,
    );
    let summary: PersistSummary = redirect::persist(&store, &rules).await?;
    info!(inserted = summary.inserted, duplicates = summary.duplicates, "redirects persisted");

    let rules_path = artifacts::write_json(&config.artifacts.dir, artifacts::REDIRECT_RULES, &rules)?;
    let stored = render_configs(&store, &config.artifacts.dir).await?;

    println!("redirects");
    println!("  rules built: {}", rules.len());
    println!("  inserted: {}", summary.inserted);
    println!("  duplicates skipped: {}", summary.duplicates);
    println!("  rules in store: {}", stored);
    println!("  written: {}", rules_path.display());
    println!("ok");

    pool.close().await;
    Ok(())
}

/// Regenerate both proxy dialects from the full redirect table. Returns the
/// number of stored rules.
pub async fn render_configs(store: &dyn RedirectStore, dir: &Path) -> Result<usize> {
    let rules = store.all().await?;
    artifacts::write_text(dir, artifacts::NGINX_CONF, &redirect::render_nginx(&rules))?;
    artifacts::write_text(dir, artifacts::HTACCESS, &redirect::render_htaccess(&rules))?;
    Ok(rules.len())
}

pub async fn run_render(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;
    let store = SqliteRedirectStore::new(pool.clone());
    let count = render_configs(&store, &config.artifacts.dir).await?;

    println!("render");
    println!("  rules: {}", count);
    println!(
        "  nginx: {}",
        config.artifacts.dir.join(artifacts::NGINX_CONF).display()
    );
    println!(
        "  apache: {}",
        config.artifacts.dir.join(artifacts::HTACCESS).display()
    );
    println!("ok");

    pool.close().await;
    Ok(())
}

pub async fn run_lookup(config: &Config, from_path: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;
    let store = SqliteRedirectStore::new(pool.clone());

    match store.lookup(from_path).await? {
        Some(rule) => println!("{} {} {}", rule.status_code, rule.from_path, rule.to_path),
        None => {
            pool.close().await;
            anyhow::bail!("No redirect for {}", from_path);
        }
    }

    pool.close().await;
    Ok(())
}

// ============ rewrite ============

pub async fn run_rewrite(config: &Config, dry_run: bool) -> Result<()> {
    let fetched: FetchReport =
        artifacts::read_json(&config.artifacts.dir, artifacts::FETCH_RESULTS, "fetch")?;
    let mapping = rewrite::mapping_from_results(&fetched.results);

    let pool = db::connect(config).await?;
    let store = SqliteContentStore::new(pool.clone(), config.content.clone());
    let summary: RewriteSummary = rewrite::rewrite_all(&store, &mapping, dry_run).await?;

    if dry_run {
        println!("rewrite (dry-run)");
    } else {
        println!("rewrite");
    }
    println!("  mapped references: {}", mapping.len());
    println!("  content units: {}", summary.scanned);
    println!("  updated: {}", summary.updated);
    println!("  unchanged: {}", summary.unchanged);
    println!("ok");

    pool.close().await;
    Ok(())
}

// ============ run ============

/// Every stage in order. Rewriting happens last so content is only touched
/// once its assets are on disk and redirects exist.
pub async fn run_all(
    config: &Config,
    limit: Option<usize>,
    dry_run: bool,
    progress: &dyn ProgressReporter,
) -> Result<()> {
    run_analyze(config, progress).await?;
    run_fetch(config, limit, progress).await?;
    run_redirects(config).await?;
    run_rewrite(config, dry_run).await
}
