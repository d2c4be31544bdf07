//! Pipeline configuration: one immutable value assembled from the CLI and an
//! optional `.ogda.json` overlay at the first input root, passed down the
//! call tree instead of process globals.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::hash::HashMode;

/// Optional on-disk defaults. Anything the CLI sets explicitly wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Hash pool size used when the CLI does not pass `--threads`.
    pub threads: usize,
    /// Report `(abs_path, type)` duplicates across source lineages too.
    pub report_cross_lineage_duplicates: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            report_cross_lineage_duplicates: false,
        }
    }
}

pub fn load_file_config(input_root: &Path) -> FileConfig {
    let path = input_root.join(".ogda.json");
    let Ok(text) = std::fs::read_to_string(&path) else {
        return FileConfig::default();
    };
    serde_json::from_str::<FileConfig>(&text).unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Ordered input roots; first match wins on collisions.
    pub input_dirs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub job_file: PathBuf,
    pub manifest_input: Option<PathBuf>,
    pub manifest_output: Option<PathBuf>,
    pub database_dir: Option<PathBuf>,
    pub threads: usize,
    pub hash_mode: HashMode,

    pub perform_removes: bool,
    pub force_removes: bool,
    pub remove_unlisted: bool,

    pub load_from_database: bool,
    pub save_to_database: bool,

    pub print_missing: bool,
    pub print_duplicates: bool,
    pub print_item_list: bool,
    pub mute_missing: bool,
    pub hide_progress: bool,

    pub report_cross_lineage_duplicates: bool,
}

impl PipelineConfig {
    pub fn database_manifest_path(&self) -> Option<PathBuf> {
        self.database_dir
            .as_ref()
            .map(|d| d.join("database_manifest.xml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_config_overlay_is_optional_and_lenient() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_file_config(dir.path()).threads, 8);

        std::fs::write(dir.path().join(".ogda.json"), r#"{"threads": 2}"#).unwrap();
        let cfg = load_file_config(dir.path());
        assert_eq!(cfg.threads, 2);
        assert!(!cfg.report_cross_lineage_duplicates);

        std::fs::write(dir.path().join(".ogda.json"), "not json").unwrap();
        assert_eq!(load_file_config(dir.path()).threads, 8);
    }
}
