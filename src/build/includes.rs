//! Library discovery from `#include` directives.
//!
//! Sources are scanned textually: comments, string literals and `#if 0`
//! blocks never produce includes. Every header not found in the current
//! include folders is looked up in the library index, and each imported
//! library's own sources join the scan queue until no new library shows up.

use super::context::Context;
use crate::library::{Library, LibraryLayout};
use crate::sketch::{ADDITIONAL_FILE_EXTENSIONS, skip_entry};
use anyhow::{Context as _, Result};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Header names included by `source`, in order of appearance, without
/// duplicates.
pub fn extract_includes(source: &str) -> Vec<String> {
    let mut includes: Vec<String> = Vec::new();
    let mut skip_depth = 0usize;
    for line in logical_lines(&strip_comments(source)) {
        let Some(directive) = line.trim_start().strip_prefix('#') else {
            continue;
        };
        let directive = directive.trim_start();
        let (keyword, rest) = directive
            .split_once(|c: char| c.is_whitespace() || c == '<' || c == '"' || c == '(')
            .map_or((directive, ""), |(k, _)| (k, &directive[k.len()..]));
        let rest = rest.trim();

        if skip_depth > 0 {
            match keyword {
                "if" | "ifdef" | "ifndef" => skip_depth += 1,
                "endif" => skip_depth -= 1,
                "else" | "elif" if skip_depth == 1 => skip_depth = 0,
                _ => {}
            }
            continue;
        }

        match keyword {
            "if" if is_false_condition(rest) => skip_depth = 1,
            "include" => {
                if let Some(header) = parse_include_target(rest)
                    && !includes.contains(&header)
                {
                    includes.push(header);
                }
            }
            _ => {}
        }
    }
    includes
}

fn is_false_condition(condition: &str) -> bool {
    matches!(condition, "0" | "false" | "(0)")
}

fn parse_include_target(rest: &str) -> Option<String> {
    let (close, body) = match rest.chars().next()? {
        '<' => ('>', &rest[1..]),
        '"' => ('"', &rest[1..]),
        _ => return None,
    };
    let end = body.find(close)?;
    let header = body[..end].trim();
    (!header.is_empty()).then(|| header.to_string())
}

/// Replace comments with spaces, keeping line breaks and string literals.
fn strip_comments(source: &str) -> String {
    #[derive(Clone, Copy)]
    enum State {
        Code,
        Block,
        Line,
        Str(char),
    }

    let mut out = String::with_capacity(source.len());
    let mut state = State::Code;
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    out.push(' ');
                    state = State::Block;
                }
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::Line;
                }
                '"' | '\'' => {
                    out.push(c);
                    state = State::Str(c);
                }
                _ => out.push(c),
            },
            State::Block => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                } else if c == '\n' {
                    out.push('\n');
                }
            }
            State::Line => {
                if c == '\n' {
                    out.push('\n');
                    state = State::Code;
                }
            }
            State::Str(quote) => {
                out.push(c);
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else if c == quote || c == '\n' {
                    state = State::Code;
                }
            }
        }
    }
    out
}

/// Lines with backslash continuations folded in.
fn logical_lines(source: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for line in source.lines() {
        match line.strip_suffix('\\') {
            Some(head) => current.push_str(head),
            None => {
                current.push_str(line);
                lines.push(std::mem::take(&mut current));
            }
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Sources and headers a library contributes to the scan.
fn library_files(library: &Library) -> Result<Vec<PathBuf>> {
    let mut files = scan_folder(&library.source_dir, library.layout == LibraryLayout::Recursive)?;
    if let Some(utility) = library.utility_dir() {
        files.extend(scan_folder(&utility, false)?);
    }
    Ok(files)
}

fn scan_folder(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut walker = WalkDir::new(dir).follow_links(true);
    if !recursive {
        walker = walker.max_depth(1);
    }
    let mut files = Vec::new();
    for entry in walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !skip_entry(e.path()))
    {
        let entry = entry.with_context(|| format!("Failed to scan {}", dir.display()))?;
        let wanted = entry
            .path()
            .extension()
            .is_some_and(|e| ADDITIONAL_FILE_EXTENSIONS.iter().any(|x| e == *x));
        if entry.file_type().is_file() && wanted {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

fn library_include_folders(library: &Library) -> Vec<PathBuf> {
    let mut folders = vec![library.source_dir.clone()];
    folders.extend(library.utility_dir());
    folders
}

/// Core and variant folders every compile sees.
fn base_include_folders(ctx: &Context) -> Result<Vec<PathBuf>> {
    let target = ctx.target()?;
    let mut folders = vec![target.core_dir.clone()];
    folders.extend(target.variant_dir.clone());
    Ok(folders)
}

/// Resolve the transitive set of libraries the sketch needs. Fills
/// `imported_libraries`, `library_resolution_results` and
/// `include_folders`.
pub fn find_includes(ctx: &mut Context) -> Result<()> {
    let arch = ctx.target()?.fqbn.architecture.clone();
    let sketch = ctx.sketch()?;
    let sketch_dir = sketch.full_path.clone();
    let local_headers: HashSet<String> = sketch
        .additional_files
        .iter()
        .filter_map(|f| f.strip_prefix(&sketch_dir).ok())
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .collect();

    let mut include_folders = base_include_folders(ctx)?;
    let mut imported: Vec<Library> = Vec::new();
    // each queued source carries the folder its quoted includes start from
    let mut queue: VecDeque<(PathBuf, String)> = VecDeque::new();
    let mut scanned: HashSet<PathBuf> = HashSet::new();

    queue.push_back((sketch_dir.clone(), ctx.sketch_source.clone()));
    for file in &ctx.sketch()?.additional_files {
        scanned.insert(file.clone());
        queue.push_back((parent_dir(file), read_lossy(file)?));
    }

    while let Some((dir, source)) = queue.pop_front() {
        for header in extract_includes(&source) {
            if local_headers.contains(&header) || local_headers.contains(&format!("src/{header}")) {
                continue;
            }
            if dir.join(&header).is_file() {
                continue;
            }
            if include_folders.iter().any(|dir| dir.join(&header).is_file()) {
                continue;
            }
            let Some(result) = ctx.library_index.resolve(&header, &arch)? else {
                debug!("No library provides {header}, leaving it to the toolchain");
                continue;
            };
            if imported.iter().any(|l| l.dir == result.library.dir) {
                continue;
            }

            let library = result.library.clone();
            debug!("{header} resolved to {}", library.dir.display());
            include_folders.extend(library_include_folders(&library));
            for file in library_files(&library)? {
                if scanned.insert(file.clone()) {
                    queue.push_back((parent_dir(&file), read_lossy(&file)?));
                }
            }
            imported.push(library);
            ctx.library_resolution_results.insert(header, result);
        }
    }

    for library in &imported {
        if !library.is_compatible_with(&arch) {
            ctx.console.warn(format!(
                "library {} claims to run on {} architecture(s) and may be incompatible with your current board which runs on {} architecture(s).",
                library.name,
                library.architectures.join(", "),
                arch
            ));
        }
    }

    ctx.imported_libraries = imported;
    ctx.include_folders = include_folders;
    Ok(())
}

/// Tell the user when a header had more than one candidate.
pub fn print_library_resolution_notes(ctx: &mut Context) -> Result<()> {
    for (header, result) in &ctx.library_resolution_results {
        if !result.reported {
            continue;
        }
        let mut note = format!(
            "Multiple libraries were found for \"{header}\"\n  Used: {}",
            result.library.dir.display()
        );
        for other in &result.not_used {
            note.push_str(&format!("\n  Not used: {}", other.display()));
        }
        ctx.console.info(note);
    }
    Ok(())
}

fn parent_dir(file: &Path) -> PathBuf {
    file.parent().map(Path::to_path_buf).unwrap_or_default()
}

fn read_lossy(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
