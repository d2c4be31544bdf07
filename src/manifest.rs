//! The build manifest: an ordered record of every output a pipeline run
//! produced, with enough identity (source item hash, producer name and
//! version, destination hash) to decide on the next run whether a result
//! can be reused verbatim.
//!
//! A side index of u64 prefixes of the source hashes makes the common
//! negative lookup ("nothing in the prior manifest mentions this item")
//! O(1) instead of a record scan.

use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use rayon::prelude::*;
use tracing::warn;

use crate::builder::Builder;
use crate::hash::{hash_file, sub_hash, HashMode};
use crate::item::Item;
use crate::job::says_true;
use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Built,
    Database,
    Generated,
}

#[derive(Debug, Clone)]
pub struct ManifestResult {
    pub kind: ResultKind,
    /// Source items; exactly one for Built/Database, none for Generated.
    pub items: Vec<Item>,
    /// Destination path relative to the output directory.
    pub dest: String,
    /// Content hash of the destination file as of when this record was
    /// written.
    pub dest_hash: String,
    /// Producer (builder or generator) name and version.
    pub name: String,
    pub version: String,
    pub type_tag: String,
    pub success: bool,
    pub fresh_built: bool,
    /// Hash of whatever is at the destination right now; filled by the
    /// parallel precompute pass, lazily computed otherwise.
    current_dest_hash: Option<String>,
}

impl ManifestResult {
    /// Record a freshly built output; the destination file is hashed now so
    /// the record describes what this run actually produced.
    pub fn built(
        output_dir: &Path,
        item: Item,
        dest: String,
        success: bool,
        name: &str,
        version: &str,
        type_tag: &str,
        mode: HashMode,
    ) -> Self {
        let dest_hash = hash_file(&paths::assemble(output_dir, &dest), mode);
        Self {
            kind: ResultKind::Built,
            items: vec![item],
            dest,
            dest_hash,
            name: name.to_string(),
            version: version.to_string(),
            type_tag: type_tag.to_string(),
            success,
            fresh_built: true,
            current_dest_hash: None,
        }
    }

    /// Record an output restored from the shared database.
    pub fn from_database(
        dest_hash: String,
        item: Item,
        dest: String,
        name: &str,
        version: &str,
        type_tag: &str,
    ) -> Self {
        Self {
            kind: ResultKind::Database,
            items: vec![item],
            dest,
            dest_hash,
            name: name.to_string(),
            version: version.to_string(),
            type_tag: type_tag.to_string(),
            success: true,
            fresh_built: false,
            current_dest_hash: None,
        }
    }

    /// Record a generator output.
    pub fn generated(
        output_dir: &Path,
        dest: String,
        success: bool,
        name: &str,
        version: &str,
        type_tag: &str,
        mode: HashMode,
    ) -> Self {
        let dest_hash = hash_file(&paths::assemble(output_dir, &dest), mode);
        Self {
            kind: ResultKind::Generated,
            items: Vec::new(),
            dest,
            dest_hash,
            name: name.to_string(),
            version: version.to_string(),
            type_tag: type_tag.to_string(),
            success,
            fresh_built: true,
            current_dest_hash: None,
        }
    }

    /// Hash of the file currently at this record's destination.
    pub fn current_dest_hash(&self, base: &Path, mode: HashMode) -> String {
        match &self.current_dest_hash {
            Some(h) => h.clone(),
            None => hash_file(&paths::assemble(base, &self.dest), mode),
        }
    }
}

#[derive(Debug, Default)]
pub struct Manifest {
    results: Vec<ManifestResult>,
    prefix_set: HashSet<u64>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let mut manifest = Self::default();
        for result in parse_results(&text)
            .with_context(|| format!("error parsing manifest {}", path.display()))?
        {
            manifest.add_result(result);
        }
        Ok(manifest)
    }

    pub fn add_result(&mut self, result: ManifestResult) {
        for item in &result.items {
            self.prefix_set.insert(sub_hash(&item.hash));
        }
        self.results.push(result);
    }

    pub fn results(&self) -> &[ManifestResult] {
        &self.results
    }

    pub fn has_error(&self) -> bool {
        self.results.iter().any(|r| !r.success)
    }

    pub fn destination_files(&self) -> Vec<String> {
        self.results.iter().map(|r| r.dest.clone()).collect()
    }

    /// Hash every record's current destination file on the given pool, so
    /// later staleness checks are pure lookups.
    pub fn precalculate_dest_hashes(
        &mut self,
        base: &Path,
        mode: HashMode,
        pool: &rayon::ThreadPool,
    ) {
        pool.install(|| {
            self.results.par_iter_mut().for_each(|r| {
                r.current_dest_hash = Some(hash_file(&paths::assemble(base, &r.dest), mode));
            });
        });
    }

    /// Is the prior result for `(item, builder)` still valid? True only when
    /// the item (including its hash), the builder name, and the builder
    /// version all match a record whose recorded destination hash is
    /// non-empty and equals the hash of the file currently on disk.
    pub fn is_up_to_date(
        &self,
        item: &Item,
        builder: &Builder,
        output_dir: &Path,
        mode: HashMode,
    ) -> bool {
        if !self.prefix_set.contains(&sub_hash(&item.hash)) {
            return false;
        }
        for r in &self.results {
            match r.items.len() {
                1 => {
                    if &r.items[0] == item
                        && r.name == builder.name
                        && r.version == builder.version
                        && !r.dest_hash.is_empty()
                        && r.current_dest_hash(output_dir, mode) == r.dest_hash
                    {
                        return true;
                    }
                }
                n if n > 1 => {
                    warn!("manifest matching does not handle results with more than one item");
                }
                _ => {}
            }
        }
        false
    }

    /// The record `is_up_to_date` accepted; reused verbatim in the new
    /// manifest.
    pub fn previously_built_result(&self, item: &Item, builder: &Builder) -> Option<ManifestResult> {
        self.results
            .iter()
            .find(|r| {
                r.items.len() == 1
                    && &r.items[0] == item
                    && r.name == builder.name
                    && r.version == builder.version
            })
            .cloned()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
        writer.write_event(Event::Start(BytesStart::new("Manifest")))?;

        let mut program = BytesStart::new("ProgramInfo");
        program.push_attribute(("name", "ogda"));
        program.push_attribute(("build_version", env!("CARGO_PKG_VERSION")));
        program.push_attribute(("platform", std::env::consts::OS));
        program.push_attribute(("arch", std::env::consts::ARCH));
        writer.write_event(Event::Empty(program))?;

        let run_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut execution = BytesStart::new("ExecutionInfo");
        execution.push_attribute(("run_unix", run_unix.to_string().as_str()));
        writer.write_event(Event::Empty(execution))?;

        for r in &self.results {
            write_result(&mut writer, r)?;
        }

        writer.write_event(Event::End(BytesEnd::new("Manifest")))?;
        let bytes = writer.into_inner().into_inner();
        paths::atomic_replace(path, &bytes)
            .with_context(|| format!("failed to save manifest {}", path.display()))
    }
}

fn write_result(writer: &mut Writer<Cursor<Vec<u8>>>, r: &ManifestResult) -> Result<()> {
    let (elem_name, producer_attr, producer_version_attr) = match r.kind {
        ResultKind::Built => ("BuilderResult", "builder", "builder_version"),
        ResultKind::Database => ("DatabaseResult", "builder", "builder_version"),
        ResultKind::Generated => ("GeneratorResult", "generator", "generator_version"),
    };

    let mut elem = BytesStart::new(elem_name);
    elem.push_attribute(("dest", r.dest.as_str()));
    elem.push_attribute(("dest_hash", r.dest_hash.as_str()));
    elem.push_attribute((producer_attr, r.name.as_str()));
    elem.push_attribute((producer_version_attr, r.version.as_str()));
    elem.push_attribute(("type", r.type_tag.as_str()));
    if r.kind != ResultKind::Database {
        elem.push_attribute(("success", if r.success { "true" } else { "false" }));
        elem.push_attribute(("fresh_built", if r.fresh_built { "true" } else { "false" }));
    }

    if r.items.is_empty() {
        writer.write_event(Event::Empty(elem))?;
        return Ok(());
    }

    writer.write_event(Event::Start(elem))?;
    for item in &r.items {
        let mut e = BytesStart::new("Item");
        e.push_attribute(("path", item.path()));
        e.push_attribute(("type", item.type_tag.as_str()));
        e.push_attribute(("hash", item.hash.as_str()));
        writer.write_event(Event::Empty(e))?;
    }
    writer.write_event(Event::End(BytesEnd::new(elem_name)))?;
    Ok(())
}

fn attr(e: &BytesStart<'_>, name: &str) -> String {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.to_string()))
        .unwrap_or_default()
}

/// Parse the result elements of a manifest document. The legacy element
/// name `Result` is accepted as a synonym of `BuilderResult`; unknown
/// elements are reported and skipped.
pub(crate) fn parse_results(text: &str) -> Result<Vec<ManifestResult>> {
    let mut reader = Reader::from_str(text);
    let mut results = Vec::new();
    let mut pending: Option<ManifestResult> = None;

    loop {
        let event = reader.read_event();
        let (e, self_closing) = match &event {
            Err(e) => anyhow::bail!("XML error: {e}"),
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => (e, false),
            Ok(Event::Empty(e)) => (e, true),
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if matches!(name.as_str(), "BuilderResult" | "Result" | "DatabaseResult") {
                    if let Some(p) = pending.take() {
                        results.push(p);
                    }
                }
                continue;
            }
            Ok(_) => continue,
        };

        let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
        match name.as_str() {
            "Manifest" | "ProgramInfo" | "ExecutionInfo" => {}
            // `Result` is a backwards compatible name, never generated.
            "BuilderResult" | "Result" => {
                let r = read_result_attrs(e, ResultKind::Built);
                if self_closing {
                    results.push(r);
                } else {
                    pending = Some(r);
                }
            }
            "DatabaseResult" => {
                let mut r = read_result_attrs(e, ResultKind::Database);
                r.success = true;
                if self_closing {
                    results.push(r);
                } else {
                    pending = Some(r);
                }
            }
            "GeneratorResult" => {
                results.push(read_result_attrs(e, ResultKind::Generated));
            }
            "Item" => {
                if let Some(p) = pending.as_mut() {
                    p.items.push(Item::with_hash(
                        &attr(e, "path"),
                        &attr(e, "type"),
                        &attr(e, "hash"),
                    ));
                } else {
                    warn!("Item element outside any result record");
                }
            }
            other => warn!("unknown element name in manifest: {other}"),
        }
    }
    if let Some(p) = pending.take() {
        results.push(p);
    }
    Ok(results)
}

fn read_result_attrs(e: &BytesStart<'_>, kind: ResultKind) -> ManifestResult {
    let producer_attr = match kind {
        ResultKind::Generated => "generator",
        _ => "builder",
    };
    let version_attr = match kind {
        ResultKind::Generated => "generator_version",
        _ => "builder_version",
    };
    ManifestResult {
        kind,
        items: Vec::new(),
        dest: attr(e, "dest"),
        dest_hash: attr(e, "dest_hash"),
        name: attr(e, producer_attr),
        version: attr(e, version_attr),
        type_tag: attr(e, "type"),
        success: says_true(&attr(e, "success")),
        fresh_built: false,
        current_dest_hash: None,
    }
}
