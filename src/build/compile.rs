//! Parallel compilation of a folder of sources.

use super::context::Context;
use super::exec::{OutputMode, exec_command};
use super::recipe::prepare_command_for_recipe;
use super::types::with_suffix;
use super::uptodate::obj_file_is_up_to_date;
use crate::properties::PropertyMap;
use crate::sketch::{SOURCE_FILE_EXTENSIONS, skip_entry};
use anyhow::{Context as _, Result};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing::debug;
use walkdir::WalkDir;

/// Sources with a compile recipe extension under `dir`, sorted. Hidden and
/// version-control folders are skipped.
pub fn find_source_files(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
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
        let is_source = entry
            .path()
            .extension()
            .is_some_and(|ext| SOURCE_FILE_EXTENSIONS.iter().any(|s| ext == *s));
        if entry.file_type().is_file() && is_source {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

pub fn compile_files_recursive(
    ctx: &Context,
    source_dir: &Path,
    build_dir: &Path,
    properties: &PropertyMap,
    includes: &[String],
) -> Result<Vec<PathBuf>> {
    let sources = find_source_files(source_dir, true)?;
    compile_files(ctx, source_dir, &sources, build_dir, properties, includes)
}

pub fn compile_files_flat(
    ctx: &Context,
    source_dir: &Path,
    build_dir: &Path,
    properties: &PropertyMap,
    includes: &[String],
) -> Result<Vec<PathBuf>> {
    let sources = find_source_files(source_dir, false)?;
    compile_files(ctx, source_dir, &sources, build_dir, properties, includes)
}

fn progress_bar(ctx: &Context, len: usize) -> ProgressBar {
    if !ctx.progress {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message("Compiling...");
    pb
}

/// Compile `sources` on a pool of `ctx.jobs` workers. Feeding stops at the
/// first failure; jobs already handed out still finish. Returns the sorted
/// object list, or the first error recorded.
pub fn compile_files(
    ctx: &Context,
    source_dir: &Path,
    sources: &[PathBuf],
    build_dir: &Path,
    properties: &PropertyMap,
    includes: &[String],
) -> Result<Vec<PathBuf>> {
    if sources.is_empty() {
        return Ok(Vec::new());
    }

    let workers = ctx.effective_jobs();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("Failed to start compile workers")?;

    let objects: Mutex<Vec<PathBuf>> = Mutex::new(Vec::with_capacity(sources.len()));
    let errors: Mutex<Vec<anyhow::Error>> = Mutex::new(Vec::new());
    let (sender, receiver) = mpsc::sync_channel::<&Path>(0);
    let receiver = Mutex::new(receiver);
    let pb = progress_bar(ctx, sources.len());

    pool.in_place_scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|_| {
                loop {
                    let next = receiver.lock().recv();
                    let Ok(source) = next else {
                        break;
                    };
                    pb.set_message(format!("Compiling {}", file_name(source)));
                    match compile_file(ctx, source_dir, source, build_dir, properties, includes) {
                        Ok(object) => objects.lock().push(object),
                        Err(e) => errors.lock().push(e),
                    }
                    pb.inc(1);
                }
            });
        }

        for source in sources {
            if !errors.lock().is_empty() {
                debug!("Compile error recorded, no more files are queued");
                break;
            }
            if sender.send(source.as_path()).is_err() {
                break;
            }
        }
        drop(sender);
    });
    pb.finish_and_clear();

    if let Some(first) = errors.into_inner().into_iter().next() {
        return Err(first);
    }
    let mut objects = objects.into_inner();
    objects.sort();
    Ok(objects)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Compile one file with `recipe.<ext>.o.pattern`, unless its object is
/// still valid. The compilation database sees the command either way.
fn compile_file(
    ctx: &Context,
    source_dir: &Path,
    source: &Path,
    build_dir: &Path,
    build_properties: &PropertyMap,
    includes: &[String],
) -> Result<PathBuf> {
    let ext = source
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();
    let recipe = format!("recipe.{ext}.o.pattern");

    let mut properties = build_properties.clone();
    let warning_flags = properties
        .get(&format!("compiler.warning_flags.{}", ctx.warnings_level))
        .to_string();
    properties.set("compiler.warning_flags", warning_flags);
    properties.set("includes", includes.join(" "));
    properties.set_path("source_file", source);

    let relative = source
        .strip_prefix(source_dir)
        .with_context(|| format!("{} is not inside {}", source.display(), source_dir.display()))?;
    let object = with_suffix(&build_dir.join(relative), ".o");
    let depfile = with_suffix(&build_dir.join(relative), ".d");
    properties.set_path("object_file", &object);
    if let Some(parent) = object.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let up_to_date = obj_file_is_up_to_date(source, Some(&object), Some(&depfile))?;
    let command = prepare_command_for_recipe(&properties, &recipe, false, &ctx.tool_env)?;
    if let Some(db) = &ctx.compilation_database {
        db.add(source, &command);
    }

    if !up_to_date && !ctx.only_update_compilation_database {
        exec_command(ctx, &command, OutputMode::ShowIfVerbose, OutputMode::Show)?;
    } else if ctx.verbose {
        if up_to_date {
            ctx.console
                .info(format!("Using previously compiled file: {}", object.display()));
        } else {
            ctx.console
                .info(format!("Skipping compile of: {}", object.display()));
        }
    }
    Ok(object)
}

/// `"-I<dir>"` arguments for the `{includes}` property.
pub fn include_args(folders: &[PathBuf]) -> Vec<String> {
    folders
        .iter()
        .map(|f| format!("\"-I{}\"", f.display()))
        .collect()
}
