//! Searchers: type-driven dependency discovery.
//!
//! A searcher inspects one item and returns the items it references. The
//! in-tree set is a closed enum resolved by identifier from the job file;
//! external searchers would implement the same `search` contract.
//!
//! Searchers are fail-continue: an unparseable input produces a warning and
//! an empty result, never an aborted run.

use std::collections::HashSet;

use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use tracing::{debug, warn};

use crate::item::{Item, ItemStore};
use crate::job::{JobError, PluginEntry};
use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearcherKind {
    /// Sibling collision-hull models: `foo.obj` -> `fooHULL.obj` / `foohull.obj`.
    ObjHull,
    /// Sibling baked level normals: `<level>.col_norm.zip`.
    LevelNorm,
    /// Generic XML reference scan: attribute values that look like asset
    /// paths become typed child items; `<Include path=.../>` children are
    /// traversed but never built.
    XmlRefs,
}

#[derive(Debug, Clone)]
pub struct Searcher {
    pub name: String,
    path_ending: String,
    type_re: Regex,
    kind: SearcherKind,
}

impl Searcher {
    pub fn from_entry(entry: &PluginEntry) -> Result<Self, JobError> {
        let kind = match entry.name.as_str() {
            "obj_hull" => SearcherKind::ObjHull,
            "level_norm" => SearcherKind::LevelNorm,
            "xml_refs" => SearcherKind::XmlRefs,
            _ => {
                return Err(JobError::UnknownPlugin {
                    kind: "searcher",
                    name: entry.name.clone(),
                    row: entry.row,
                })
            }
        };
        let type_re = compile_type_pattern(&entry.type_pattern, entry.row)?;
        Ok(Self {
            name: entry.name.clone(),
            path_ending: entry.path_ending.clone(),
            type_re,
            kind,
        })
    }

    pub fn matches(&self, item: &Item) -> bool {
        item.path().ends_with(&self.path_ending) && self.type_re.is_match(&item.type_tag)
    }

    pub fn search(&self, item: &Item) -> Vec<Item> {
        match self.kind {
            SearcherKind::ObjHull => search_obj_hull(item),
            SearcherKind::LevelNorm => search_level_norm(item),
            SearcherKind::XmlRefs => search_xml_refs(item),
        }
    }
}

/// Type patterns match the whole tag: a job file saying `mesh` must not
/// also capture `mesh_hull`.
pub fn compile_type_pattern(pattern: &str, row: usize) -> Result<Regex, JobError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|e| JobError::Parse {
        row,
        message: format!("bad type pattern \"{pattern}\": {e}"),
    })
}

fn search_obj_hull(item: &Item) -> Vec<Item> {
    let mut found = Vec::new();
    let path = item.path();
    if path.len() < 4 {
        return found;
    }
    let stem = &path[..path.len() - 4];
    for suffix in ["HULL.obj", "hull.obj"] {
        let candidate = format!("{stem}{suffix}");
        if paths::assemble(&item.input_folder, &candidate).exists() {
            found.push(Item::new(
                &item.input_folder,
                &candidate,
                "model_hull",
                item.source.clone(),
            ));
        }
    }
    found
}

fn search_level_norm(item: &Item) -> Vec<Item> {
    let candidate = format!("{}.col_norm.zip", item.path());
    if paths::assemble(&item.input_folder, &candidate).exists() {
        vec![Item::new(
            &item.input_folder,
            &candidate,
            "level_norm",
            item.source.clone(),
        )]
    } else {
        Vec::new()
    }
}

/// Extensions the XML scan recognizes as asset references.
fn type_for_extension(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?.to_ascii_lowercase();
    match ext.as_str() {
        "obj" => Some("model"),
        "png" | "tga" | "dds" | "jpg" => Some("texture"),
        "wav" | "ogg" => Some("sound"),
        "xml" => Some("xml"),
        _ => None,
    }
}

fn search_xml_refs(item: &Item) -> Vec<Item> {
    let text = match std::fs::read_to_string(item.abs_path()) {
        Ok(t) => t,
        Err(e) => {
            warn!("searcher could not read {item}: {e}");
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut reader = Reader::from_str(&text);
    loop {
        match reader.read_event() {
            Err(e) => {
                warn!("searcher could not parse {item}: {e}");
                return Vec::new();
            }
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let elem = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let include = elem.eq_ignore_ascii_case("include");
                for attr in e.attributes().filter_map(|a| a.ok()) {
                    let Ok(value) = attr.unescape_value() else {
                        continue;
                    };
                    let value = value.replace('\\', "/");
                    let Some(type_tag) = type_for_extension(&value) else {
                        continue;
                    };
                    let mut child =
                        Item::new(&item.input_folder, &value, type_tag, item.source.clone());
                    if include {
                        // Traversed for further references, never built.
                        child.set_search_only(true);
                    }
                    let key = (child.path().to_string(), child.type_tag.clone());
                    if seen.insert(key) {
                        found.push(child);
                    }
                }
            }
            Ok(_) => {}
        }
    }
    found
}

/// Recursive search driver. Every item is searched exactly once (the
/// searched set guarantees termination on cyclic references); each newly
/// discovered item is case-corrected and then searched itself.
pub struct SearchEngine<'a> {
    searchers: &'a [Searcher],
    searched: Vec<Item>,
    warned_types: HashSet<String>,
}

impl<'a> SearchEngine<'a> {
    pub fn new(searchers: &'a [Searcher]) -> Self {
        Self {
            searchers,
            searched: Vec::new(),
            warned_types: HashSet::new(),
        }
    }

    pub fn run(&mut self, store: &mut ItemStore) {
        let seeds: Vec<Item> = store.seeds().to_vec();
        for item in seeds {
            self.search_recursive(item, store);
        }
    }

    fn search_recursive(&mut self, item: Item, store: &mut ItemStore) {
        if self.searched.contains(&item) {
            return;
        }

        let mut matching = 0usize;
        let mut found = Vec::new();
        for searcher in self.searchers {
            if searcher.matches(&item) {
                matching += 1;
                found.extend(searcher.search(&item));
            }
        }

        if matching == 0 && self.warned_types.insert(item.type_tag.clone()) {
            warn!("item type \"{}\" has no assigned searcher", item.type_tag);
        }

        self.searched.push(item.clone());

        if !found.is_empty() {
            debug!("found {} references in {item}", found.len());
        }
        for mut child in found {
            child.verify_path();
            store.add_found(child.clone());
            self.search_recursive(child, store);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::SourceRef;
    use std::path::Path;

    fn entry(name: &str, ending: &str, pattern: &str) -> PluginEntry {
        PluginEntry {
            name: name.into(),
            path_ending: ending.into(),
            type_pattern: pattern.into(),
            row: 1,
        }
    }

    #[test]
    fn unknown_searcher_name_is_fatal() {
        let err = Searcher::from_entry(&entry("bogus", "", ".*")).unwrap_err();
        assert!(matches!(err, JobError::UnknownPlugin { kind: "searcher", .. }));
    }

    #[test]
    fn type_pattern_matches_whole_tag() {
        let s = Searcher::from_entry(&entry("obj_hull", ".obj", "mesh")).unwrap();
        let mesh = Item::new(Path::new("/in"), "a.obj", "mesh", SourceRef::default());
        let hull = Item::new(Path::new("/in"), "a.obj", "mesh_hull", SourceRef::default());
        assert!(s.matches(&mesh));
        assert!(!s.matches(&hull));
    }

    #[test]
    fn obj_hull_finds_sibling_hulls() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("Meshes")).unwrap();
        std::fs::write(root.join("Meshes/rock.obj"), b"v 0 0 0\n").unwrap();
        std::fs::write(root.join("Meshes/rockHULL.obj"), b"v 0 0 0\n").unwrap();

        let item = Item::new(root, "Meshes/rock.obj", "model", SourceRef::default());
        let found = search_obj_hull(&item);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path(), "Meshes/rockHULL.obj");
        assert_eq!(found[0].type_tag, "model_hull");
    }

    #[test]
    fn xml_refs_extracts_typed_references_and_include_is_search_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(
            root.join("level.xml"),
            r#"<Level>
                 <Terrain heightmap="Data/Textures/height.png"/>
                 <Object model="Meshes/rock.obj"/>
                 <Include path="Scripts/shared.xml"/>
               </Level>"#,
        )
        .unwrap();

        let item = Item::new(root, "level.xml", "level", SourceRef::default());
        let found = search_xml_refs(&item);
        let by_path: Vec<(&str, &str, bool)> = found
            .iter()
            .map(|i| (i.path(), i.type_tag.as_str(), i.is_search_only()))
            .collect();
        assert!(by_path.contains(&("Textures/height.png", "texture", false)));
        assert!(by_path.contains(&("Meshes/rock.obj", "model", false)));
        assert!(by_path.contains(&("Scripts/shared.xml", "xml", true)));
    }

    #[test]
    fn broken_xml_warns_and_returns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("broken.xml"), "<Level><Unclosed").unwrap();
        let item = Item::new(root, "broken.xml", "level", SourceRef::default());
        assert!(search_xml_refs(&item).is_empty());
    }
}
