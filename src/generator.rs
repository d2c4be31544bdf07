//! Generators: post-build aggregate producers.
//!
//! Generators run after every builder has finished, in declared order, each
//! against the same snapshot of builder-phase results. A generator never
//! sees another generator's output.

use std::io::Cursor;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use tracing::warn;

use crate::job::{JobError, PluginEntry};
use crate::manifest::ManifestResult;
use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GeneratorKind {
    /// `index.xml`: one entry per destination in the builder-phase snapshot,
    /// so the runtime can enumerate shipped assets without a directory walk.
    ItemIndex,
}

impl GeneratorKind {
    fn version(self) -> &'static str {
        match self {
            GeneratorKind::ItemIndex => "1",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenOutcome {
    pub dest: String,
    pub type_tag: String,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct Generator {
    pub name: String,
    pub version: String,
    kind: GeneratorKind,
}

impl Generator {
    pub fn from_entry(entry: &PluginEntry) -> Result<Self, JobError> {
        let kind = match entry.name.as_str() {
            "item_index" => GeneratorKind::ItemIndex,
            _ => {
                return Err(JobError::UnknownPlugin {
                    kind: "generator",
                    name: entry.name.clone(),
                    row: entry.row,
                })
            }
        };
        Ok(Self {
            name: entry.name.clone(),
            version: kind.version().to_string(),
            kind,
        })
    }

    /// Run the aggregate function over the builder-phase snapshot.
    pub fn run(&self, output_dir: &Path, snapshot: &[ManifestResult]) -> GenOutcome {
        match self.kind {
            GeneratorKind::ItemIndex => {
                let dest = "index.xml".to_string();
                let success = match render_item_index(snapshot) {
                    Ok(bytes) => {
                        match paths::atomic_replace(&paths::assemble(output_dir, &dest), &bytes) {
                            Ok(()) => true,
                            Err(e) => {
                                warn!("{} failed to write {dest}: {e}", self.name);
                                false
                            }
                        }
                    }
                    Err(e) => {
                        warn!("{} failed to render {dest}: {e}", self.name);
                        false
                    }
                };
                GenOutcome {
                    dest,
                    type_tag: "index".into(),
                    success,
                }
            }
        }
    }
}

fn render_item_index(snapshot: &[ManifestResult]) -> anyhow::Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("Index")))?;
    for r in snapshot {
        let mut e = BytesStart::new("Asset");
        e.push_attribute(("path", r.dest.as_str()));
        e.push_attribute(("type", r.type_tag.as_str()));
        e.push_attribute(("hash", r.dest_hash.as_str()));
        writer.write_event(Event::Empty(e))?;
    }
    writer.write_event(Event::End(BytesEnd::new("Index")))?;
    Ok(writer.into_inner().into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashMode;
    use crate::item::Item;

    #[test]
    fn unknown_generator_name_is_fatal() {
        let err = Generator::from_entry(&PluginEntry {
            name: "bogus".into(),
            path_ending: String::new(),
            type_pattern: ".*".into(),
            row: 3,
        })
        .unwrap_err();
        assert!(matches!(err, JobError::UnknownPlugin { kind: "generator", .. }));
    }

    #[test]
    fn item_index_lists_snapshot_destinations() {
        let out = tempfile::tempdir().unwrap();
        std::fs::write(out.path().join("a.mesh"), b"m").unwrap();
        let snapshot = vec![ManifestResult::built(
            out.path(),
            Item::with_hash("a.obj", "mesh", "00000000000000aa"),
            "a.mesh".into(),
            true,
            "copy",
            "1",
            "mesh",
            HashMode::Content,
        )];

        let gen = Generator::from_entry(&PluginEntry {
            name: "item_index".into(),
            path_ending: String::new(),
            type_pattern: ".*".into(),
            row: 1,
        })
        .unwrap();
        let outcome = gen.run(out.path(), &snapshot);
        assert!(outcome.success);
        let text = std::fs::read_to_string(out.path().join("index.xml")).unwrap();
        assert!(text.contains("path=\"a.mesh\""));
        assert!(text.contains("type=\"mesh\""));
    }
}
