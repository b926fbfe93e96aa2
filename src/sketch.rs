//! Sketch discovery and source merging.
//!
//! A sketch is a folder named like its main `.ino` file. Every `.ino`/`.pde`
//! in the root is concatenated into a single C++ translation unit; other
//! C/C++ files in the root and under `src/` are copied verbatim into the
//! build folder.

use crate::error::BuildError;
use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use walkdir::WalkDir;

pub const MAIN_FILE_EXTENSIONS: [&str; 2] = ["ino", "pde"];
pub const SOURCE_FILE_EXTENSIONS: [&str; 3] = ["c", "cpp", "S"];
pub const HEADER_FILE_EXTENSIONS: [&str; 3] = ["h", "hh", "hpp"];
pub const ADDITIONAL_FILE_EXTENSIONS: [&str; 10] =
    ["c", "cpp", "cc", "cxx", "S", "h", "hh", "hpp", "tpp", "ipp"];

/// Folders that never hold build inputs.
const SCCS_FOLDERS: [&str; 5] = ["CVS", "RCS", ".git", ".svn", ".hg"];

static INCLUDES_ARDUINO_H: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*#\s*include\s*[<"]Arduino\.h[>"]"#).expect("static regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sketch {
    pub name: String,
    pub full_path: PathBuf,
    pub main_file: PathBuf,
    /// Secondary `.ino`/`.pde` files, sorted.
    pub other_sketch_files: Vec<PathBuf>,
    /// C/C++ sources and headers copied as-is, sorted.
    pub additional_files: Vec<PathBuf>,
}

impl Sketch {
    /// Load a sketch from its folder or from its main file.
    pub fn load(path: &Path) -> Result<Self> {
        let path = path
            .canonicalize()
            .map_err(|_| BuildError::NoSketch {
                path: path.to_path_buf(),
            })?;
        let (dir, main_file) = if path.is_file() {
            let dir = path
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| BuildError::NoSketch { path: path.clone() })?;
            (dir, path)
        } else {
            let main = find_main_file(&path)?;
            (path, main)
        };

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut other_sketch_files = Vec::new();
        let mut additional_files = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))? {
            let file = entry?.path();
            if !file.is_file() || is_hidden(&file) || file == main_file {
                continue;
            }
            if has_extension(&file, &MAIN_FILE_EXTENSIONS) {
                other_sketch_files.push(file);
            } else if has_extension(&file, &ADDITIONAL_FILE_EXTENSIONS) {
                additional_files.push(file);
            }
        }

        let src = dir.join("src");
        if src.is_dir() {
            let walker = WalkDir::new(&src)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !skip_entry(e.path()));
            for entry in walker {
                let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
                if entry.file_type().is_file()
                    && has_extension(entry.path(), &ADDITIONAL_FILE_EXTENSIONS)
                {
                    additional_files.push(entry.into_path());
                }
            }
        }

        other_sketch_files.sort();
        additional_files.sort();

        Ok(Self {
            name,
            full_path: dir,
            main_file,
            other_sketch_files,
            additional_files,
        })
    }

    /// File name of the main sketch file, e.g. `Blink.ino`.
    pub fn main_file_name(&self) -> String {
        self.main_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Concatenate all sketch files into one translation unit. Returns the
    /// number of lines inserted before the first line of the main file.
    pub fn merge_sources(&self) -> Result<(usize, String)> {
        let mut line_offset = 0;
        let mut merged = String::new();

        let main_src = read_source(&self.main_file)?;
        if !INCLUDES_ARDUINO_H.is_match(&main_src) {
            merged.push_str("#include <Arduino.h>\n");
            line_offset += 1;
        }
        merged.push_str(&format!("#line 1 {}\n", quote_cpp_string(&self.main_file.to_string_lossy())));
        merged.push_str(&main_src);
        merged.push('\n');
        line_offset += 1;

        for file in &self.other_sketch_files {
            let src = read_source(file)?;
            merged.push_str(&format!("#line 1 {}\n", quote_cpp_string(&file.to_string_lossy())));
            merged.push_str(&src);
            merged.push('\n');
        }

        Ok((line_offset, merged))
    }

    /// Populate `build_dir` with the sketch's additional files, each tagged
    /// with a `#line` directive pointing back at its origin. Returns the line
    /// offset and merged source of the `.ino` files.
    pub fn prepare_build_path(&self, build_dir: &Path) -> Result<(usize, String)> {
        fs::create_dir_all(build_dir)
            .with_context(|| format!("Failed to create {}", build_dir.display()))?;

        let (offset, merged) = self.merge_sources()?;

        for file in &self.additional_files {
            let rel = file.strip_prefix(&self.full_path).with_context(|| {
                format!("{} is outside of the sketch folder", file.display())
            })?;
            let target = build_dir.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut content = format!("#line 1 {}\n", quote_cpp_string(&file.to_string_lossy()));
            content.push_str(&read_source(file)?);
            write_if_different(&target, content.as_bytes())?;
        }

        Ok((offset, merged))
    }
}

fn find_main_file(dir: &Path) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    for ext in MAIN_FILE_EXTENSIONS {
        let candidate = dir.join(format!("{name}.{ext}"));
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    // a folder holding exactly one sketch file is a sketch too
    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && !is_hidden(&path) && has_extension(&path, &MAIN_FILE_EXTENSIONS) {
            candidates.push(path);
        }
    }
    if candidates.len() == 1
        && let Some(main) = candidates.pop()
    {
        return Ok(main);
    }
    Err(BuildError::NoSketch {
        path: dir.to_path_buf(),
    }
    .into())
}

fn read_source(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .is_some_and(|e| extensions.iter().any(|x| e == *x))
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().starts_with('.'))
}

/// Hidden entries and version-control folders are never build inputs.
pub fn skip_entry(path: &Path) -> bool {
    is_hidden(path)
        || path
            .file_name()
            .is_some_and(|n| SCCS_FOLDERS.iter().any(|s| n == *s))
}

/// Quote a string as a C string literal.
pub fn quote_cpp_string(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Write `data` to `path` only when the content differs, so unchanged
/// files keep their modification time.
pub fn write_if_different(path: &Path, data: &[u8]) -> Result<bool> {
    if let Ok(existing) = fs::read(path)
        && existing == data
    {
        return Ok(false);
    }
    fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}
