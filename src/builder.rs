//! Builders: per-item transforms producing output files.
//!
//! A builder is an immutable descriptor (name, version, match predicates,
//! reuse/database flags) over a closed set of in-tree actions. The version
//! string participates in staleness checks: bumping it invalidates every
//! previously built result of that builder.

use std::path::Path;

use regex::Regex;
use tracing::warn;

use crate::item::Item;
use crate::job::{JobError, PluginEntry};
use crate::paths;
use crate::searcher::compile_type_pattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuilderKind {
    /// Byte-identical copy into the output tree at the item's own path.
    Copy,
}

impl BuilderKind {
    fn version(self) -> &'static str {
        match self {
            BuilderKind::Copy => "1",
        }
    }

    /// Whether results may be reused verbatim from the prior manifest when
    /// the source is unchanged.
    fn run_even_on_identical_source(self) -> bool {
        match self {
            BuilderKind::Copy => false,
        }
    }

    fn store_result_in_database(self) -> bool {
        match self {
            BuilderKind::Copy => true,
        }
    }
}

/// What one builder invocation produced.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Destination path relative to the output directory.
    pub dest: String,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct Builder {
    pub name: String,
    pub version: String,
    path_ending: String,
    type_re: Regex,
    kind: BuilderKind,
}

impl Builder {
    pub fn from_entry(entry: &PluginEntry) -> Result<Self, JobError> {
        let kind = match entry.name.as_str() {
            "copy" => BuilderKind::Copy,
            _ => {
                return Err(JobError::UnknownPlugin {
                    kind: "builder",
                    name: entry.name.clone(),
                    row: entry.row,
                })
            }
        };
        let type_re = compile_type_pattern(&entry.type_pattern, entry.row)?;
        Ok(Self {
            name: entry.name.clone(),
            version: kind.version().to_string(),
            path_ending: entry.path_ending.clone(),
            type_re,
            kind,
        })
    }

    pub fn matches(&self, item: &Item) -> bool {
        item.path().ends_with(&self.path_ending) && self.type_re.is_match(&item.type_tag)
    }

    pub fn run_even_on_identical_source(&self) -> bool {
        self.kind.run_even_on_identical_source()
    }

    pub fn store_result_in_database(&self) -> bool {
        self.kind.store_result_in_database()
    }

    /// Execute the action. Failures are captured in the outcome's `success`
    /// flag; they fail the run's exit code but never abort the phase.
    pub fn run(&self, output_dir: &Path, item: &Item) -> BuildOutcome {
        match self.kind {
            BuilderKind::Copy => {
                let dest = item.path().to_string();
                let dest_abs = paths::assemble(output_dir, &dest);
                match paths::copy_creating_dirs(&item.abs_path(), &dest_abs) {
                    Ok(()) => BuildOutcome {
                        dest,
                        success: true,
                    },
                    Err(e) => {
                        warn!("{} failed on {item}: {e}", self.name);
                        BuildOutcome {
                            dest,
                            success: false,
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::SourceRef;

    fn entry(name: &str, ending: &str, pattern: &str) -> PluginEntry {
        PluginEntry {
            name: name.into(),
            path_ending: ending.into(),
            type_pattern: pattern.into(),
            row: 1,
        }
    }

    #[test]
    fn unknown_builder_name_is_fatal() {
        let err = Builder::from_entry(&entry("crunch", "", ".*")).unwrap_err();
        assert!(matches!(err, JobError::UnknownPlugin { kind: "builder", .. }));
    }

    #[test]
    fn copy_builder_lands_file_at_item_path() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(input.path().join("Meshes")).unwrap();
        std::fs::write(input.path().join("Meshes/cube.obj"), b"v 0 0 0\n").unwrap();

        let builder = Builder::from_entry(&entry("copy", ".obj", "mesh")).unwrap();
        let item = Item::new(input.path(), "Meshes/cube.obj", "mesh", SourceRef::default());
        assert!(builder.matches(&item));

        let outcome = builder.run(output.path(), &item);
        assert!(outcome.success);
        assert_eq!(outcome.dest, "Meshes/cube.obj");
        assert_eq!(
            std::fs::read(output.path().join("Meshes/cube.obj")).unwrap(),
            b"v 0 0 0\n"
        );
    }

    #[test]
    fn copy_failure_is_captured_not_propagated() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let item = Item::new(input.path(), "missing.obj", "mesh", SourceRef::default());
        let builder = Builder::from_entry(&entry("copy", "", ".*")).unwrap();
        let outcome = builder.run(output.path(), &item);
        assert!(!outcome.success);
    }
}
