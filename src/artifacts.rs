//! Stage artifacts on disk.
//!
//! Every stage fully materializes its output as a JSON file under
//! `artifacts.dir` before the next stage starts, so a run can resume from
//! any stage. A stage whose input artifact is missing fails before doing any
//! work, naming the command that produces it.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::{Category, ClassifiedReference, FetchResult};

pub const REFERENCES: &str = "references.json";
pub const FETCH_RESULTS: &str = "fetch_results.json";
pub const REDIRECT_RULES: &str = "redirect_rules.json";
pub const NGINX_CONF: &str = "nginx_redirects.conf";
pub const HTACCESS: &str = "htaccess_redirects";

/// Output of `wprl analyze`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub units_scanned: u64,
    pub units_with_references: u64,
    pub by_category: BTreeMap<Category, u64>,
    pub references: Vec<ClassifiedReference>,
}

/// Output of `wprl fetch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchReport {
    pub downloaded: u64,
    pub already_present: u64,
    pub failed: u64,
    pub skipped_malformed: u64,
    pub skipped_excluded: u64,
    pub results: Vec<FetchResult>,
}

pub fn write_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<PathBuf> {
    let json = serde_json::to_string_pretty(value)?;
    write_text(dir, name, &json)
}

pub fn write_text(dir: &Path, name: &str, text: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create artifacts dir: {}", dir.display()))?;
    let path = dir.join(name);
    std::fs::write(&path, text)
        .with_context(|| format!("Failed to write artifact: {}", path.display()))?;
    Ok(path)
}

/// Read a required upstream artifact. `produced_by` is the command that
/// writes it, used in the error message.
pub fn read_json<T: DeserializeOwned>(dir: &Path, name: &str, produced_by: &str) -> Result<T> {
    let path = dir.join(name);
    if !path.exists() {
        anyhow::bail!(
            "Required artifact {} not found. Run `wprl {}` first.",
            path.display(),
            produced_by
        );
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read artifact: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse artifact: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Reference;
    use tempfile::TempDir;

    #[test]
    fn missing_artifact_names_producing_command() {
        let tmp = TempDir::new().unwrap();
        let err = read_json::<FetchReport>(tmp.path(), FETCH_RESULTS, "fetch").unwrap_err();
        assert!(err.to_string().contains("wprl fetch"));
    }

    #[test]
    fn analysis_report_survives_disk() {
        let tmp = TempDir::new().unwrap();
        let mut report = AnalysisReport {
            units_scanned: 2,
            units_with_references: 1,
            ..Default::default()
        };
        report.by_category.insert(Category::LegacyUpload, 1);
        report.references.push(ClassifiedReference {
            reference: Reference {
                content_id: "1".into(),
                field: "content".into(),
                raw: "/uploads/a.jpg".into(),
            },
            category: Category::LegacyUpload,
        });

        write_json(tmp.path(), REFERENCES, &report).unwrap();
        let back: AnalysisReport = read_json(tmp.path(), REFERENCES, "analyze").unwrap();
        assert_eq!(back.references, report.references);
        assert_eq!(back.by_category.get(&Category::LegacyUpload), Some(&1));
    }
}
