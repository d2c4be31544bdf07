//! Job description loading.
//!
//! A job file is one XML document naming the input roots, the seed items,
//! and the searcher/builder/generator set by identifier. Parsing is
//! fail-fast: a malformed document or an unknown plugin name aborts the run
//! before any filesystem work happens.

use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to read job file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed job file (line {row}): {message}")]
    Parse { row: usize, message: String },
    #[error("unknown {kind} \"{name}\" named in job file (line {row})")]
    UnknownPlugin {
        kind: &'static str,
        name: String,
        row: usize,
    },
}

/// A seed item declaration. `row` is the line in the job file, carried for
/// duplicate diagnostics.
#[derive(Debug, Clone)]
pub struct JobItem {
    pub path: String,
    pub type_tag: String,
    pub recursive: bool,
    pub path_ending: String,
    pub overshadows: Option<String>,
    pub row: usize,
}

/// A searcher/builder/generator reference: plugin identifier plus the
/// path-suffix and type-regex predicates it is instantiated with.
#[derive(Debug, Clone)]
pub struct PluginEntry {
    pub name: String,
    pub path_ending: String,
    pub type_pattern: String,
    pub row: usize,
}

#[derive(Debug, Default)]
pub struct JobFile {
    pub inputs: Vec<String>,
    pub items: Vec<JobItem>,
    pub searchers: Vec<PluginEntry>,
    pub builders: Vec<PluginEntry>,
    pub generators: Vec<PluginEntry>,
}

impl JobFile {
    pub fn load(path: &Path) -> Result<Self, JobError> {
        let text = std::fs::read_to_string(path).map_err(|source| JobError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, JobError> {
        let mut reader = Reader::from_str(text);

        let mut job = JobFile::default();
        let mut section: Option<Section> = None;
        let mut saw_root = false;

        loop {
            let event = reader.read_event();
            let row = line_at(text, reader.buffer_position() as usize);
            match event {
                Err(e) => {
                    return Err(JobError::Parse {
                        row,
                        message: e.to_string(),
                    })
                }
                Ok(Event::Eof) => break,
                Ok(Event::Start(e)) => {
                    let name = local_name(&e);
                    match name.as_str() {
                        "Job" => saw_root = true,
                        "Inputs" => section = Some(Section::Inputs),
                        "Items" => section = Some(Section::Items),
                        "Searchers" => section = Some(Section::Searchers),
                        "Builders" => section = Some(Section::Builders),
                        "Generators" => section = Some(Section::Generators),
                        _ => job.read_entry(&e, section, row)?,
                    }
                }
                Ok(Event::Empty(e)) => {
                    let name = local_name(&e);
                    match name.as_str() {
                        "Job" => saw_root = true,
                        "Inputs" | "Items" | "Searchers" | "Builders" | "Generators" => {}
                        _ => job.read_entry(&e, section, row)?,
                    }
                }
                Ok(Event::End(e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    if matches!(
                        name.as_str(),
                        "Inputs" | "Items" | "Searchers" | "Builders" | "Generators"
                    ) {
                        section = None;
                    }
                }
                Ok(_) => {}
            }
        }

        if !saw_root {
            return Err(JobError::Parse {
                row: 1,
                message: "missing Job root element".into(),
            });
        }
        Ok(job)
    }

    fn read_entry(
        &mut self,
        e: &BytesStart<'_>,
        section: Option<Section>,
        row: usize,
    ) -> Result<(), JobError> {
        let tag = local_name(e);
        let attr = |name: &str| attr_value(e, name);
        match section {
            Some(Section::Inputs) => {
                let path = attr("path").ok_or_else(|| JobError::Parse {
                    row,
                    message: format!("input element <{tag}> is missing a path attribute"),
                })?;
                self.inputs.push(path);
            }
            Some(Section::Items) => {
                let path = attr("path").ok_or_else(|| JobError::Parse {
                    row,
                    message: "item is missing a path attribute".into(),
                })?;
                let type_tag = attr("type").ok_or_else(|| JobError::Parse {
                    row,
                    message: format!("item \"{path}\" is missing a type attribute"),
                })?;
                self.items.push(JobItem {
                    path,
                    type_tag,
                    recursive: attr("recursive").map(|v| says_true(&v)).unwrap_or(false),
                    path_ending: attr("path_ending").unwrap_or_default(),
                    overshadows: attr("overshadows"),
                    row,
                });
            }
            Some(section @ (Section::Searchers | Section::Builders | Section::Generators)) => {
                // The identifier attribute is named after the plugin kind
                // (`searcher=`, `builder=`, `generator=`); `name=` is
                // accepted everywhere.
                let name = attr(section.id_attr())
                    .or_else(|| attr("name"))
                    .ok_or_else(|| JobError::Parse {
                        row,
                        message: format!("<{tag}> entry is missing an identifier attribute"),
                    })?;
                let entry = PluginEntry {
                    name,
                    path_ending: attr("path_ending").unwrap_or_default(),
                    type_pattern: attr("type_pattern_re").unwrap_or_else(|| ".*".into()),
                    row,
                };
                match section {
                    Section::Searchers => self.searchers.push(entry),
                    Section::Builders => self.builders.push(entry),
                    Section::Generators => self.generators.push(entry),
                    Section::Inputs | Section::Items => unreachable!(),
                }
            }
            None => {
                return Err(JobError::Parse {
                    row,
                    message: format!("unexpected element <{tag}> outside any section"),
                })
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Inputs,
    Items,
    Searchers,
    Builders,
    Generators,
}

impl Section {
    fn id_attr(self) -> &'static str {
        match self {
            Section::Searchers => "searcher",
            Section::Builders => "builder",
            Section::Generators => "generator",
            Section::Inputs | Section::Items => "",
        }
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_string()
}

fn attr_value(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.to_string()))
}

pub fn says_true(value: &str) -> bool {
    matches!(value.trim(), "true" | "True" | "TRUE" | "1" | "yes")
}

fn line_at(text: &str, byte_pos: usize) -> usize {
    let end = byte_pos.min(text.len());
    text[..end].bytes().filter(|&b| b == b'\n').count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = r#"<?xml version="1.0"?>
<Job>
  <Inputs>
    <Input path="Data"/>
  </Inputs>
  <Items>
    <Item path="Meshes/cube.obj" type="mesh"/>
    <Item path="Textures" type="texture" recursive="true" path_ending=".png"/>
  </Items>
  <Searchers>
    <Searcher searcher="obj_hull" path_ending=".obj" type_pattern_re="mesh"/>
  </Searchers>
  <Builders>
    <Builder builder="copy" path_ending="" type_pattern_re="mesh|texture"/>
  </Builders>
  <Generators>
    <Generator generator="item_index"/>
  </Generators>
</Job>
"#;

    #[test]
    fn parses_all_sections() {
        let job = JobFile::parse(JOB).unwrap();
        assert_eq!(job.inputs, vec!["Data"]);
        assert_eq!(job.items.len(), 2);
        assert!(!job.items[0].recursive);
        assert!(job.items[1].recursive);
        assert_eq!(job.items[1].path_ending, ".png");
        assert_eq!(job.searchers.len(), 1);
        assert_eq!(job.searchers[0].name, "obj_hull");
        assert_eq!(job.builders[0].type_pattern, "mesh|texture");
        assert_eq!(job.generators[0].name, "item_index");
    }

    #[test]
    fn item_rows_point_into_the_document() {
        let job = JobFile::parse(JOB).unwrap();
        assert_eq!(job.items[0].row, 7);
        assert_eq!(job.items[1].row, 8);
    }

    #[test]
    fn malformed_xml_is_fatal() {
        let err = JobFile::parse("<Job><Items><Item ").unwrap_err();
        assert!(matches!(err, JobError::Parse { .. }));
    }

    #[test]
    fn missing_required_attribute_is_fatal() {
        let err = JobFile::parse("<Job><Items><Item type=\"mesh\"/></Items></Job>").unwrap_err();
        assert!(matches!(err, JobError::Parse { .. }));
    }

    #[test]
    fn document_without_job_root_is_rejected() {
        let err = JobFile::parse("<NotAJob/>").unwrap_err();
        assert!(matches!(err, JobError::Parse { .. }));
    }
}
