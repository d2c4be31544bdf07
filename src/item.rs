//! Items: the discovered pieces of input content the pipeline tracks.
//!
//! An item is identified by `(input_folder, path, type_tag)`; full equality
//! additionally covers the content hash and the search-only flag, so a
//! re-discovered item with a different role is a distinct item. Items live
//! in a contiguous list and are addressed by index, which is what lets the
//! hashing pool write each item's hash into a disjoint slot without locks.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::hash::{hash_file, HashMode};
use crate::paths;

/// Back-reference to the job-file entry that first pulled an item in.
/// Carried for duplicate diagnostics (`RMLN:<row>` reports).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceRef {
    pub path: String,
    pub type_tag: String,
    pub row: usize,
}

#[derive(Debug, Clone)]
pub struct Item {
    pub input_folder: PathBuf,
    path: String,
    pub type_tag: String,
    /// Hex content hash; empty until hashed, and empty afterwards when the
    /// file is missing.
    pub hash: String,
    pub source: SourceRef,
    search_only: bool,
    delete_on_exit: bool,
    overshadowed: bool,
    /// Relative path of another item this one overrides.
    pub overshadows: Option<String>,
}

impl Item {
    pub fn new(input_folder: &Path, path: &str, type_tag: &str, source: SourceRef) -> Self {
        Self {
            input_folder: input_folder.to_path_buf(),
            path: paths::normalize_rel(path),
            type_tag: type_tag.to_string(),
            hash: String::new(),
            source,
            search_only: false,
            delete_on_exit: false,
            overshadowed: false,
            overshadows: None,
        }
    }

    /// Reconstruct an item from a manifest record, hash already known.
    pub fn with_hash(path: &str, type_tag: &str, hash: &str) -> Self {
        Self {
            input_folder: PathBuf::new(),
            path: paths::normalize_rel(path),
            type_tag: type_tag.to_string(),
            hash: hash.to_string(),
            source: SourceRef::default(),
            search_only: false,
            delete_on_exit: false,
            overshadowed: false,
            overshadows: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: &str) {
        self.path = paths::normalize_rel(path);
    }

    pub fn abs_path(&self) -> PathBuf {
        paths::assemble(&self.input_folder, &self.path)
    }

    /// Case-correct the relative path against the filesystem. Searchers pull
    /// paths out of hand-edited asset files, which are wrong-case often
    /// enough that every discovered item goes through this.
    pub fn verify_path(&mut self) {
        let assembled = self.abs_path();
        if assembled.exists() {
            return;
        }
        match paths::case_correct(&assembled) {
            Some(corrected) => {
                if let Ok(rel) = paths::relative_to(&corrected, &self.input_folder) {
                    debug!("case corrected path to {rel}");
                    self.set_path(&rel);
                }
            }
            None => {
                error!("file still missing after case correction: {}", assembled.display());
            }
        }
    }

    pub fn calculate_hash(&mut self, mode: HashMode) {
        self.hash = hash_file(&self.abs_path(), mode);
    }

    pub fn is_search_only(&self) -> bool {
        self.search_only
    }

    pub fn set_search_only(&mut self, value: bool) {
        self.search_only = value;
    }

    pub fn is_overshadowed(&self) -> bool {
        self.overshadowed
    }

    pub fn set_overshadowed(&mut self, value: bool) {
        self.overshadowed = value;
    }

    pub fn overshadows_item(&self, other: &Item) -> bool {
        self.overshadows.as_deref() == Some(other.path())
    }

    pub fn is_delete_on_exit(&self) -> bool {
        self.delete_on_exit
    }

    pub fn set_delete_on_exit(&mut self, value: bool) {
        self.delete_on_exit = value;
    }

    /// Is this item the first-level reference from its own job-file entry
    /// (as opposed to one found by recursive searching)?
    pub fn is_first_level(&self) -> bool {
        self.type_tag == self.source.type_tag && self.path == self.source.path
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.path == other.path
            && self.type_tag == other.type_tag
            && self.search_only == other.search_only
    }
}

impl Eq for Item {}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Item({},{},{},{})",
            self.path, self.type_tag, self.hash, self.search_only
        )
    }
}

/// Seed items plus everything the searchers found, in admission order.
#[derive(Debug, Default)]
pub struct ItemStore {
    items: Vec<Item>,
    found: Vec<Item>,
}

impl ItemStore {
    pub fn add_seed(&mut self, item: Item) {
        debug!("adding {}: {}", item.type_tag, item.path());
        self.items.push(item);
    }

    /// Insertion-ordered dedup by full item equality.
    pub fn add_found(&mut self, item: Item) -> bool {
        if self.found.contains(&item) {
            return false;
        }
        self.found.push(item);
        true
    }

    pub fn seeds(&self) -> &[Item] {
        &self.items
    }

    pub fn found_count(&self) -> usize {
        self.found.len()
    }

    /// Concatenate seeds and found items into the working list. The store is
    /// consumed; from here on items are addressed by index.
    pub fn into_working_list(mut self) -> Vec<Item> {
        self.items.append(&mut self.found);
        self.items
    }
}

/// Mark every item that some other item declares it overshadows.
/// Quadratic, but N is the item count of one game's asset tree.
pub fn mark_overshadowed(items: &mut [Item]) {
    let shadow_paths: Vec<String> = items
        .iter()
        .filter_map(|i| i.overshadows.clone())
        .collect();
    if shadow_paths.is_empty() {
        return;
    }
    for item in items.iter_mut() {
        if shadow_paths.iter().any(|p| p == item.path()) {
            item.set_overshadowed(true);
        }
    }
}

/// Report items that resolve to the same `(abs_path, type)`. By default only
/// pairs sharing a source lineage (the same job-file entry pulled both in)
/// are compared; `cross_lineage` widens the scan to every pair. A duplicate
/// is attributed to a removable job-file row only when one of the pair is
/// itself the first-level reference from that row.
pub fn report_duplicates(items: &[Item], cross_lineage: bool) -> Vec<SourceRef> {
    let mut first_level: Vec<SourceRef> = Vec::new();
    for (i, a) in items.iter().enumerate() {
        for b in &items[i + 1..] {
            if !cross_lineage && a.source != b.source {
                continue;
            }
            if a.abs_path() != b.abs_path() || a.type_tag != b.type_tag {
                continue;
            }
            let dup = if a.is_first_level() {
                Some(a.source.clone())
            } else if b.is_first_level() {
                Some(b.source.clone())
            } else {
                None
            };
            if let Some(src) = dup {
                warn!(
                    "found duplicate of {} sourced from rows {} and {}",
                    a, a.source.row, b.source.row
                );
                if !first_level.contains(&src) {
                    first_level.push(src);
                }
            }
        }
    }
    first_level.sort();
    first_level
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(path: &str, ty: &str) -> Item {
        Item::new(Path::new("/in"), path, ty, SourceRef::default())
    }

    #[test]
    fn construction_strips_data_prefix() {
        let it = item("Data/Meshes/cube.obj", "mesh");
        assert_eq!(it.path(), "Meshes/cube.obj");
        assert_eq!(it.abs_path(), Path::new("/in/Meshes/cube.obj"));
    }

    #[test]
    fn equality_covers_hash_and_search_only() {
        let a = item("Meshes/cube.obj", "mesh");
        let mut b = a.clone();
        assert_eq!(a, b);
        b.hash = "deadbeef".into();
        assert_ne!(a, b);
        let mut c = a.clone();
        c.set_search_only(true);
        assert_ne!(a, c);
    }

    #[test]
    fn found_set_dedups_in_insertion_order() {
        let mut store = ItemStore::default();
        store.add_seed(item("a.obj", "mesh"));
        assert!(store.add_found(item("c.obj", "mesh")));
        assert!(store.add_found(item("b.obj", "mesh")));
        assert!(!store.add_found(item("c.obj", "mesh")));
        let working: Vec<String> = store
            .into_working_list()
            .iter()
            .map(|i| i.path().to_string())
            .collect();
        assert_eq!(working, vec!["a.obj", "c.obj", "b.obj"]);
    }

    #[test]
    fn overshadow_pass_marks_targets_only() {
        let mut items = vec![item("base/rock.obj", "mesh"), item("mod/rock.obj", "mesh")];
        items[1].overshadows = Some("base/rock.obj".into());
        mark_overshadowed(&mut items);
        assert!(items[0].is_overshadowed());
        assert!(!items[1].is_overshadowed());
    }

    #[test]
    fn duplicate_report_honors_lineage_gate() {
        let seed_row = SourceRef {
            path: "Meshes/rock.obj".into(),
            type_tag: "mesh".into(),
            row: 5,
        };
        let other_row = SourceRef {
            path: "Levels/arena.xml".into(),
            type_tag: "level".into(),
            row: 9,
        };

        // First-level seed, plus the same file rediscovered from another
        // job-file entry's lineage.
        let seed = Item::new(Path::new("/in"), "Meshes/rock.obj", "mesh", seed_row.clone());
        let cross = Item::new(Path::new("/in"), "Meshes/rock.obj", "mesh", other_row);
        let items = vec![seed.clone(), cross];

        // Lineage-local scan never pairs them; the wide scan attributes the
        // duplicate to the seed's row.
        assert!(report_duplicates(&items, false).is_empty());
        let rows: Vec<usize> = report_duplicates(&items, true)
            .iter()
            .map(|s| s.row)
            .collect();
        assert_eq!(rows, vec![5]);

        // A duplicate inside one lineage is reported under both settings.
        let sibling = Item::new(Path::new("/in"), "Meshes/rock.obj", "mesh", seed_row);
        let items = vec![seed, sibling];
        assert_eq!(report_duplicates(&items, false).len(), 1);
        assert_eq!(report_duplicates(&items, true).len(), 1);
    }
}
