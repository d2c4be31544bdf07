//! Filesystem portability primitives shared by the pipeline and the mesh
//! cache: relative-path normalization, recursive enumeration, case
//! correction against the on-disk tree, and atomic file replacement.
//!
//! All pipeline-relative paths are stored as `/`-separated strings; they are
//! only turned into `PathBuf`s at the filesystem boundary.

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Normalize a pipeline-relative path: forward slashes, and no redundant
/// `Data/` prefix (asset references in the wild carry it about half the
/// time, so it is stripped on construction everywhere).
pub fn normalize_rel(path: &str) -> String {
    let mut p = path.replace('\\', "/");
    for prefix in ["Data/", "data/"] {
        if p.len() >= prefix.len() && p[..prefix.len()].eq_ignore_ascii_case(prefix) {
            p = p[prefix.len()..].to_string();
            break;
        }
    }
    p
}

/// Join a root directory and a `/`-separated relative path.
pub fn assemble(root: &Path, rel: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in rel.split('/').filter(|s| !s.is_empty()) {
        out.push(part);
    }
    out
}

/// Relative `/`-separated form of `path` under `base`.
pub fn relative_to(path: &Path, base: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(base)
        .with_context(|| format!("{} is not under {}", path.display(), base.display()))?;
    Ok(rel.to_string_lossy().replace('\\', "/"))
}

/// Enumerate every file under `root`, returned as sorted `/`-separated
/// relative paths. Hidden files are included; the output directory is fully
/// managed, so nothing may hide from the reconciler.
pub fn list_files(root: &Path) -> Vec<String> {
    let mut out = Vec::new();
    if !root.is_dir() {
        return out;
    }
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(false)
        .build();
    for item in walker {
        let dent = match item {
            Ok(d) => d,
            Err(_) => continue,
        };
        if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        if let Ok(rel) = relative_to(dent.path(), root) {
            out.push(rel);
        }
    }
    out.sort();
    out
}

/// Outcome of correcting a single path segment against its parent directory.
enum SegmentFix {
    /// Segment now matches an on-disk entry.
    Corrected(String),
    /// No case-insensitive match exists under the parent.
    Uncorrectable,
    /// The parent directory itself is missing; it must be corrected first.
    NeedParent,
}

fn fix_segment(parent: &Path, name: &str) -> SegmentFix {
    let entries = match fs::read_dir(if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    }) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SegmentFix::NeedParent,
        Err(_) => return SegmentFix::Uncorrectable,
    };
    for entry in entries.flatten() {
        let entry_name = entry.file_name().to_string_lossy().to_string();
        if entry_name.eq_ignore_ascii_case(name) {
            return SegmentFix::Corrected(entry_name);
        }
    }
    SegmentFix::Uncorrectable
}

/// Correct the case of `path` against the filesystem, segment by segment.
///
/// Scans backward for the deepest segment whose parent exists (any segment
/// below that reports `NeedParent`), corrects it, then walks forward fixing
/// the remaining segments. Returns `None` when no case-insensitive match
/// exists on disk.
pub fn case_correct(path: &Path) -> Option<PathBuf> {
    if path.exists() {
        return Some(path.to_path_buf());
    }

    let mut segments: Vec<String> = Vec::new();
    let mut base = PathBuf::new();
    for comp in path.components() {
        match comp {
            std::path::Component::Normal(os) => segments.push(os.to_string_lossy().to_string()),
            other => {
                if segments.is_empty() {
                    base.push(other.as_os_str());
                } else {
                    // Mid-path `..`/`.` is not case-correctable; give up.
                    return None;
                }
            }
        }
    }
    if segments.is_empty() {
        return None;
    }

    // Backward scan: find the first segment (from the leaf) whose parent can
    // answer a directory listing.
    let mut idx = segments.len() - 1;
    loop {
        let parent = assemble_segments(&base, &segments[..idx]);
        match fix_segment(&parent, &segments[idx]) {
            SegmentFix::Corrected(fixed) => {
                segments[idx] = fixed;
                break;
            }
            SegmentFix::Uncorrectable => return None,
            SegmentFix::NeedParent => {
                if idx == 0 {
                    return None;
                }
                idx -= 1;
            }
        }
    }

    // Fast track: was that the only wrong segment?
    let full = assemble_segments(&base, &segments);
    if full.exists() {
        return Some(full);
    }

    // Forward pass: correct each remaining segment in turn.
    for i in (idx + 1)..segments.len() {
        let prefix = assemble_segments(&base, &segments[..=i]);
        if prefix.exists() {
            continue;
        }
        let parent = assemble_segments(&base, &segments[..i]);
        match fix_segment(&parent, &segments[i]) {
            SegmentFix::Corrected(fixed) => segments[i] = fixed,
            _ => return None,
        }
    }

    let full = assemble_segments(&base, &segments);
    if full.exists() {
        Some(full)
    } else {
        None
    }
}

fn assemble_segments(base: &Path, segments: &[String]) -> PathBuf {
    let mut out = base.to_path_buf();
    for s in segments {
        out.push(s);
    }
    out
}

pub fn create_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Write `bytes` to a temp sibling of `dest` and rename it into place.
/// On the first failure the parent directories are created and the write is
/// retried once.
pub fn atomic_replace(dest: &Path, bytes: &[u8]) -> Result<()> {
    match try_atomic_write(dest, bytes) {
        Ok(()) => Ok(()),
        Err(_) => {
            create_parent_dirs(dest)?;
            try_atomic_write(dest, bytes)
                .with_context(|| format!("Failed to write {}", dest.display()))
        }
    }
}

fn try_atomic_write(dest: &Path, bytes: &[u8]) -> Result<()> {
    // Append rather than replace the extension, so siblings differing only
    // in extension never share a temp file.
    let mut tmp_name = dest.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
    }
    fs::rename(&tmp, dest)?;
    Ok(())
}

/// Byte-identical copy, creating the destination's parent directories.
pub fn copy_creating_dirs(source: &Path, dest: &Path) -> Result<()> {
    create_parent_dirs(dest)?;
    fs::copy(source, dest).with_context(|| {
        format!(
            "Failed to copy {} to {}",
            source.display(),
            dest.display()
        )
    })?;
    Ok(())
}
