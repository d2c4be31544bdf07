//! Shared-result database: a content-addressed store of previously built
//! artifacts that separate output directories can draw from.
//!
//! Layout: `<database-dir>/database_manifest.xml` plus one payload file per
//! record at `files/<source_item_hash>/<dest_hash>`. Records are keyed by
//! `(source item, builder name, builder version)`; restoring is a byte copy.

use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use tracing::warn;

use crate::builder::Builder;
use crate::hash::{hash_file, sub_hash, HashMode};
use crate::item::Item;
use crate::paths;

#[derive(Debug, Clone)]
pub struct DatabaseResult {
    pub item: Item,
    pub dest: String,
    pub dest_hash: String,
    pub name: String,
    pub version: String,
    pub type_tag: String,
}

impl DatabaseResult {
    /// Payload location inside the database tree.
    pub fn payload_rel(&self) -> String {
        format!("files/{}/{}", self.item.hash, self.dest_hash)
    }
}

#[derive(Debug, Default)]
pub struct DatabaseManifest {
    results: Vec<DatabaseResult>,
    prefix_set: HashSet<u64>,
}

impl DatabaseManifest {
    /// Load the database manifest, or start empty when none exists yet. A
    /// database that fails to parse is treated as empty (it will be
    /// repopulated on save) with a warning.
    pub fn load_or_default(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(_) => return Self::default(),
        };
        match parse_database(&text) {
            Ok(results) => {
                let mut db = Self::default();
                for r in results {
                    db.add_result(r);
                }
                db
            }
            Err(e) => {
                warn!("error parsing database manifest {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn add_result(&mut self, result: DatabaseResult) {
        self.prefix_set.insert(sub_hash(&result.item.hash));
        self.results.push(result);
    }

    pub fn results(&self) -> &[DatabaseResult] {
        &self.results
    }

    /// Does the database hold a usable result for `(item, builder)` whose
    /// stored payload is actually present and intact?
    pub fn has_built_result_for(
        &self,
        item: &Item,
        builder: &Builder,
        database_dir: &Path,
        mode: HashMode,
    ) -> bool {
        if !self.prefix_set.contains(&sub_hash(&item.hash)) {
            return false;
        }
        self.results.iter().any(|r| {
            &r.item == item
                && r.name == builder.name
                && r.version == builder.version
                && !r.dest_hash.is_empty()
                && hash_file(&paths::assemble(database_dir, &r.payload_rel()), mode) == r.dest_hash
        })
    }

    pub fn previously_built_result(
        &self,
        item: &Item,
        builder: &Builder,
    ) -> Option<DatabaseResult> {
        self.results
            .iter()
            .find(|r| &r.item == item && r.name == builder.name && r.version == builder.version)
            .cloned()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
        let mut root = BytesStart::new("DatabaseManifest");
        root.push_attribute(("version", "1"));
        writer.write_event(Event::Start(root))?;

        for r in &self.results {
            let mut elem = BytesStart::new("DatabaseResult");
            elem.push_attribute(("dest", r.dest.as_str()));
            elem.push_attribute(("dest_hash", r.dest_hash.as_str()));
            elem.push_attribute(("builder", r.name.as_str()));
            elem.push_attribute(("builder_version", r.version.as_str()));
            elem.push_attribute(("type", r.type_tag.as_str()));
            writer.write_event(Event::Start(elem))?;

            let mut e = BytesStart::new("Item");
            e.push_attribute(("path", r.item.path()));
            e.push_attribute(("type", r.item.type_tag.as_str()));
            e.push_attribute(("hash", r.item.hash.as_str()));
            writer.write_event(Event::Empty(e))?;

            writer.write_event(Event::End(BytesEnd::new("DatabaseResult")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("DatabaseManifest")))?;
        let bytes = writer.into_inner().into_inner();
        paths::atomic_replace(path, &bytes)
            .with_context(|| format!("failed to save database manifest {}", path.display()))
    }
}

fn attr(e: &BytesStart<'_>, name: &str) -> String {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.to_string()))
        .unwrap_or_default()
}

fn parse_database(text: &str) -> Result<Vec<DatabaseResult>> {
    let mut reader = Reader::from_str(text);
    let mut results = Vec::new();
    let mut pending: Option<DatabaseResult> = None;

    loop {
        let event = reader.read_event();
        let (e, self_closing) = match &event {
            Err(e) => anyhow::bail!("XML error: {e}"),
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => (e, false),
            Ok(Event::Empty(e)) => (e, true),
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"DatabaseResult" {
                    match pending.take() {
                        Some(p) => results.push(p),
                        None => warn!("dangling DatabaseResult end tag"),
                    }
                }
                continue;
            }
            Ok(_) => continue,
        };

        match e.name().as_ref() {
            b"DatabaseManifest" => {}
            b"DatabaseResult" => {
                let r = DatabaseResult {
                    item: Item::with_hash("", "", ""),
                    dest: attr(e, "dest"),
                    dest_hash: attr(e, "dest_hash"),
                    name: attr(e, "builder"),
                    version: attr(e, "builder_version"),
                    type_tag: attr(e, "type"),
                };
                if self_closing {
                    warn!("DatabaseResult without an Item child");
                    results.push(r);
                } else {
                    pending = Some(r);
                }
            }
            b"Item" => match pending.as_mut() {
                Some(p) => {
                    p.item =
                        Item::with_hash(&attr(e, "path"), &attr(e, "type"), &attr(e, "hash"));
                }
                None => warn!("missing DatabaseResult parent for Item"),
            },
            other => {
                warn!(
                    "unknown element name in database manifest: {}",
                    String::from_utf8_lossy(other)
                );
            }
        }
    }
    if let Some(p) = pending.take() {
        results.push(p);
    }
    Ok(results)
}
