//! The compile, archive and link phases of a sketch build.

use super::archive::{archive_compiled_files, cached_core_archive_dir_name, core_or_referenced_core_has_changed};
use super::compdb::CompilationDatabase;
use super::compile::{compile_files_flat, compile_files_recursive, include_args};
use super::context::{Context, DEFAULT_WARNINGS_LEVEL};
use super::exec::{OutputMode, exec_command};
use super::recipe::{COMMANDLINE_LIMIT, prepare_command_for_recipe};
use super::types::Origin;
use crate::cache::BuildCache;
use crate::error::BuildError;
use crate::library::{Library, LibraryLayout};
use crate::properties::PropertyMap;
use crate::ui::Table;
use anyhow::{Context as _, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CORE_ARCHIVE: &str = "core.a";
pub const COMPILATION_DATABASE_FILE: &str = "compile_commands.json";
const GROUPED_OBJECTS_ARCHIVE: &str = "objs.a";

fn canonical_or_absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

pub fn fail_if_build_path_equals_sketch_path(ctx: &mut Context) -> Result<()> {
    let build_path = canonical_or_absolute(&ctx.build_path);
    let sketch_path = if ctx.sketch_location.is_file() {
        ctx.sketch_location.parent().unwrap_or(&ctx.sketch_location)
    } else {
        &ctx.sketch_location
    };
    if build_path == canonical_or_absolute(sketch_path) {
        return Err(BuildError::BuildPathEqualsSketchPath { path: build_path }.into());
    }
    Ok(())
}

/// Sub-folders of the build path, defaults for unset options and the
/// compilation database sink.
pub fn add_additional_entries(ctx: &mut Context) -> Result<()> {
    ctx.sketch_build_path = ctx.build_path.join("sketch");
    ctx.libraries_build_path = ctx.build_path.join("libraries");
    ctx.core_build_path = ctx.build_path.join("core");
    if ctx.warnings_level.is_empty() {
        ctx.warnings_level = DEFAULT_WARNINGS_LEVEL.to_string();
    }
    ctx.compilation_database = Some(CompilationDatabase::new(ctx.build_path.join(COMPILATION_DATABASE_FILE)));
    Ok(())
}

/// Copy the sketch's additional files into the build path and keep the
/// merged `.ino` source in memory.
pub fn prepare_sketch_build_path(ctx: &mut Context) -> Result<()> {
    let (offset, source) = ctx.sketch()?.prepare_build_path(&ctx.sketch_build_path)?;
    ctx.line_offset = offset;
    ctx.sketch_source = source;
    Ok(())
}

pub fn build_sketch(ctx: &mut Context) -> Result<()> {
    let includes = include_args(&ctx.include_folders);
    let properties = ctx.build_properties.clone();
    let root = ctx.sketch_build_path.clone();

    let mut objects = compile_files_flat(ctx, &root, &root, &properties, &includes)?;
    let src = root.join("src");
    if src.is_dir() {
        objects.extend(compile_files_recursive(ctx, &src, &src, &properties, &includes)?);
    }
    debug!("Sketch produced {} objects", objects.len());
    ctx.sketch_object_files = objects;
    Ok(())
}

pub fn build_libraries(ctx: &mut Context) -> Result<()> {
    let includes = include_args(&ctx.include_folders);
    let properties = ctx.build_properties.clone();
    let libraries = ctx.imported_libraries.clone();

    let mut objects = Vec::new();
    for library in &libraries {
        objects.extend(compile_library(ctx, library, &properties, &includes)?);
    }
    ctx.library_object_files = objects;
    Ok(())
}

fn compile_library(
    ctx: &Context,
    library: &Library,
    properties: &PropertyMap,
    includes: &[String],
) -> Result<Vec<PathBuf>> {
    if ctx.verbose {
        ctx.console.info(format!("Compiling library \"{}\"", library.name));
    }
    let build_root = Origin::Library(library.clone()).build_root(ctx);

    let mut objects = match library.layout {
        LibraryLayout::Recursive => {
            compile_files_recursive(ctx, &library.source_dir, &build_root, properties, includes)?
        }
        LibraryLayout::Flat => {
            let mut objects = compile_files_flat(ctx, &library.source_dir, &build_root, properties, includes)?;
            if let Some(utility) = library.utility_dir() {
                objects.extend(compile_files_flat(
                    ctx,
                    &utility,
                    &build_root.join("utility"),
                    properties,
                    includes,
                )?);
            }
            objects
        }
    };

    if library.dot_a_linkage {
        let archive_name = format!("{}.a", library.dir_name());
        let archive = archive_compiled_files(ctx, &build_root, &archive_name, &objects, properties)?;
        objects = vec![archive];
    }
    Ok(objects)
}

/// Compile the variant and the core. The core goes into `core.a`, taken
/// from the shared cache when it is still fresh.
pub fn build_core(ctx: &mut Context) -> Result<()> {
    let target = ctx.target()?;
    let core_dir = target.core_dir.clone();
    let variant_dir = target.variant_dir.clone();
    let core_platform_dir = target.core_platform_dir().to_path_buf();
    let board_platform_dir = target.platform_dir.clone();
    let fqbn = target.fqbn.to_string();

    let build_dir = ctx.core_build_path.clone();
    fs::create_dir_all(&build_dir).with_context(|| format!("Failed to create {}", build_dir.display()))?;
    let properties = ctx.build_properties.clone();
    let mut folders = vec![core_dir.clone()];
    folders.extend(variant_dir.clone());
    let includes = include_args(&folders);

    let variant_objects = match &variant_dir {
        Some(dir) => compile_files_recursive(ctx, dir, &build_dir.join("variant"), &properties, &includes)?,
        None => Vec::new(),
    };

    let cache_dir = match &ctx.core_cache_path {
        Some(base) if !ctx.only_update_compilation_database => {
            let key = cached_core_archive_dir_name(&fqbn, properties.get("compiler.optimization_flags"), &core_dir);
            Some(BuildCache::new(base).get_or_create(&key)?)
        }
        _ => None,
    };
    let local_archive = build_dir.join(CORE_ARCHIVE);

    if let Some(cache_dir) = &cache_dir {
        let cached = cache_dir.join(CORE_ARCHIVE);
        if cached.is_file()
            && !core_or_referenced_core_has_changed(&core_platform_dir, Some(&board_platform_dir), &cached)
        {
            if is_older_or_missing(&local_archive, &cached) {
                fs::copy(&cached, &local_archive)
                    .with_context(|| format!("Failed to copy {}", cached.display()))?;
            }
            if ctx.verbose {
                ctx.console
                    .info(format!("Using precompiled core: {}", cached.display()));
            }
            ctx.core_object_files = variant_objects;
            ctx.core_archive_file = Some(local_archive);
            return Ok(());
        }
    }

    let core_objects = compile_files_recursive(ctx, &core_dir, &build_dir, &properties, &includes)?;
    let archive = archive_compiled_files(ctx, &build_dir, CORE_ARCHIVE, &core_objects, &properties)?;

    if let Some(cache_dir) = &cache_dir {
        let cached = cache_dir.join(CORE_ARCHIVE);
        match fs::copy(&archive, &cached) {
            Ok(_) => {
                if ctx.verbose {
                    ctx.console
                        .info(format!("Archiving built core (caching) in: {}", cached.display()));
                }
            }
            Err(e) => ctx
                .console
                .warn(format!("Error caching core archive in {}: {e}", cache_dir.display())),
        }
    }

    ctx.core_object_files = variant_objects;
    ctx.core_archive_file = Some(archive);
    Ok(())
}

fn is_older_or_missing(file: &Path, reference: &Path) -> bool {
    let modified = |p: &Path| fs::metadata(p).and_then(|m| m.modified());
    match (modified(file), modified(reference)) {
        (Ok(file), Ok(reference)) => file < reference,
        _ => true,
    }
}

fn quoted_list(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("\"{}\"", p.display()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Group `objects` into one `objs.a` per folder. Used when the plain list
/// would exceed the command line limit.
fn archive_objects_by_folder(ctx: &Context, objects: &[PathBuf], properties: &PropertyMap) -> Result<Vec<PathBuf>> {
    let mut by_folder: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    for object in objects {
        let folder = object.parent().map(Path::to_path_buf).unwrap_or_default();
        by_folder.entry(folder).or_default().push(object.clone());
    }
    let mut archives = Vec::new();
    for (folder, objects) in &by_folder {
        archives.push(archive_compiled_files(ctx, folder, GROUPED_OBJECTS_ARCHIVE, objects, properties)?);
    }
    Ok(archives)
}

/// Link sketch, library and variant objects with the core archive using
/// `recipe.c.combine.pattern`.
pub fn link(ctx: &mut Context) -> Result<()> {
    if ctx.only_update_compilation_database {
        if ctx.verbose {
            ctx.console.info("Skipping linking");
        }
        return Ok(());
    }

    let mut objects = ctx.sketch_object_files.clone();
    objects.extend(ctx.library_object_files.iter().cloned());
    objects.extend(ctx.core_object_files.iter().cloned());
    let archive = ctx
        .core_archive_file
        .clone()
        .unwrap_or_else(|| ctx.core_build_path.join(CORE_ARCHIVE));

    let mut properties = ctx.build_properties.clone();
    let mut object_files = quoted_list(&objects);
    if object_files.len() > COMMANDLINE_LIMIT {
        debug!("Object list exceeds the command line limit, grouping objects into archives");
        let archives = archive_objects_by_folder(ctx, &objects, &properties)?;
        object_files = format!("-Wl,--whole-archive {} -Wl,--no-whole-archive", quoted_list(&archives));
    }

    let warning_flags = properties
        .get(&format!("compiler.warning_flags.{}", ctx.warnings_level))
        .to_string();
    properties.set("compiler.warning_flags", warning_flags);
    let relative_archive = archive
        .strip_prefix(&ctx.build_path)
        .unwrap_or(&archive)
        .to_path_buf();
    properties.set_path("archive_file", &relative_archive);
    properties.set_path("archive_file_path", &archive);
    properties.set("object_files", object_files);

    let command = prepare_command_for_recipe(&properties, "recipe.c.combine.pattern", false, &ctx.tool_env)?;
    exec_command(ctx, &command, OutputMode::ShowIfVerbose, OutputMode::Show)?;
    Ok(())
}

pub fn save_compilation_database(ctx: &mut Context) -> Result<()> {
    if let Some(db) = &ctx.compilation_database {
        db.save()?;
    }
    Ok(())
}

/// Table of the libraries linked into the sketch.
pub fn print_used_libraries(ctx: &mut Context) -> Result<()> {
    if !ctx.verbose || ctx.imported_libraries.is_empty() {
        return Ok(());
    }
    let mut table = Table::new(&["Library", "Version", "Location", "Path"]);
    for library in &ctx.imported_libraries {
        table.add_row(vec![
            library.name.clone(),
            library.version.clone(),
            library.location.label().to_string(),
            library.dir.display().to_string(),
        ]);
    }
    ctx.console.info(table.render(120));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_build_path_equals_sketch_path() {
        let tmp = TempDir::new().unwrap();
        let sketch = tmp.path().join("Blink");
        fs::create_dir_all(&sketch).unwrap();
        fs::write(sketch.join("Blink.ino"), "").unwrap();

        let mut ctx = Context::new(&sketch, "a:b:c", &sketch);
        let err = fail_if_build_path_equals_sketch_path(&mut ctx).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::BuildPathEqualsSketchPath { .. })
        ));

        let mut ctx = Context::new(sketch.join("Blink.ino"), "a:b:c", &sketch);
        assert!(fail_if_build_path_equals_sketch_path(&mut ctx).is_err());

        let mut ctx = Context::new(&sketch, "a:b:c", tmp.path().join("build"));
        assert!(fail_if_build_path_equals_sketch_path(&mut ctx).is_ok());
    }

    #[test]
    fn test_add_additional_entries() {
        let mut ctx = Context::new("s", "a:b:c", "/tmp/build");
        add_additional_entries(&mut ctx).unwrap();
        assert_eq!(ctx.sketch_build_path, Path::new("/tmp/build/sketch"));
        assert_eq!(ctx.libraries_build_path, Path::new("/tmp/build/libraries"));
        assert_eq!(ctx.core_build_path, Path::new("/tmp/build/core"));
        assert_eq!(ctx.warnings_level, "none");
        assert!(ctx.compilation_database.is_some());

        let mut ctx = Context::new("s", "a:b:c", "/tmp/build");
        ctx.warnings_level = "all".into();
        add_additional_entries(&mut ctx).unwrap();
        assert_eq!(ctx.warnings_level, "all");
    }

    #[test]
    fn test_quoted_list() {
        let list = quoted_list(&[PathBuf::from("/b/a.o"), PathBuf::from("/b/my lib/c.o")]);
        assert_eq!(list, "\"/b/a.o\" \"/b/my lib/c.o\"");
    }

    #[test]
    fn test_is_older_or_missing() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::write(&b, "").unwrap();
        assert!(is_older_or_missing(&a, &b));
        fs::write(&a, "").unwrap();
        fs::File::options()
            .write(true)
            .open(&b)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - std::time::Duration::from_secs(60))
            .unwrap();
        assert!(!is_older_or_missing(&a, &b));
    }
}
