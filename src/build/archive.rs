//! Static archives and the freshness checks of the core cache.

use super::context::Context;
use super::exec::{OutputMode, exec_command};
use super::recipe::prepare_command_for_recipe;
use crate::properties::PropertyMap;
use crate::sketch::skip_entry;
use anyhow::{Context as _, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

const MAX_CACHE_DIR_NAME: usize = 100;

/// Fold `objects` into `build_dir/archive_name` with `recipe.ar.pattern`,
/// one invocation per object. Nothing runs when the archive is newer than
/// every object.
pub fn archive_compiled_files(
    ctx: &Context,
    build_dir: &Path,
    archive_name: &str,
    objects: &[PathBuf],
    build_properties: &PropertyMap,
) -> Result<PathBuf> {
    let archive = build_dir.join(archive_name);
    if ctx.only_update_compilation_database {
        if ctx.verbose {
            ctx.console
                .info(format!("Skipping archive creation of: {}", archive.display()));
        }
        return Ok(archive);
    }

    if let Ok(meta) = fs::metadata(&archive) {
        let archive_time = meta.modified()?;
        let rebuild = objects.iter().any(|object| {
            fs::metadata(object)
                .and_then(|m| m.modified())
                .map_or(true, |t| t > archive_time)
        });
        if !rebuild {
            if ctx.verbose {
                ctx.console
                    .info(format!("Using previously compiled file: {}", archive.display()));
            }
            return Ok(archive);
        }
        fs::remove_file(&archive)
            .with_context(|| format!("Failed to remove {}", archive.display()))?;
    }

    fs::create_dir_all(build_dir)
        .with_context(|| format!("Failed to create {}", build_dir.display()))?;
    for object in objects {
        let mut properties = build_properties.clone();
        properties.set("archive_file", archive_name);
        properties.set_path("archive_file_path", &archive);
        properties.set_path("object_file", object);
        let command = prepare_command_for_recipe(&properties, "recipe.ar.pattern", false, &ctx.tool_env)?;
        exec_command(ctx, &command, OutputMode::ShowIfVerbose, OutputMode::Show)?;
    }
    Ok(archive)
}

/// Whether any file under `dir` (optionally only `*.ext`) is newer than
/// `reference`. Unreadable entries count as changes.
fn has_newer_files(dir: &Path, reference: SystemTime, ext: Option<&str>) -> bool {
    for entry in WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !skip_entry(e.path()))
    {
        let Ok(entry) = entry else {
            return true;
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(ext) = ext
            && entry.path().extension().is_none_or(|e| e != ext)
        {
            continue;
        }
        match entry.metadata().ok().and_then(|m| m.modified().ok()) {
            Some(time) if time <= reference => {}
            _ => return true,
        }
    }
    false
}

fn folders_changed(core: &Path, target_core: Option<&Path>, target_file: &Path, ext: Option<&str>) -> bool {
    let Ok(reference) = fs::metadata(target_file).and_then(|m| m.modified()) else {
        return true;
    };
    if has_newer_files(core, reference, ext) {
        return true;
    }
    match target_core {
        Some(other) if other != core => has_newer_files(other, reference, ext),
        _ => false,
    }
}

/// True when `target_file` is missing or older than any file of the core
/// platform, or of the board platform when it borrows its core.
pub fn core_or_referenced_core_has_changed(core: &Path, target_core: Option<&Path>, target_file: &Path) -> bool {
    folders_changed(core, target_core, target_file, None)
}

/// Same as [`core_or_referenced_core_has_changed`] restricted to `*.txt`
/// build rules.
pub fn txt_build_rules_have_changed(core: &Path, target_core: Option<&Path>, target_file: &Path) -> bool {
    folders_changed(core, target_core, target_file, Some("txt"))
}

fn hex_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// Cache folder name for a core built for `fqbn` with `optimization_flags`
/// from `core_dir`.
pub fn cached_core_archive_dir_name(fqbn: &str, optimization_flags: &str, core_dir: &Path) -> String {
    let fqbn = fqbn.replace([':', '='], "_");
    let core_dir = std::path::absolute(core_dir).unwrap_or_else(|_| core_dir.to_path_buf());
    let hash = hex_digest(format!("{}{}", core_dir.display(), optimization_flags).as_bytes());
    let name = format!("{fqbn}_{hash}");
    if name.len() > MAX_CACHE_DIR_NAME {
        hex_digest(name.as_bytes())
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    fn touch(path: &Path, time: SystemTime) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        if !path.exists() {
            fs::write(path, "").unwrap();
        }
        File::options().write(true).open(path).unwrap().set_modified(time).unwrap();
    }

    #[test]
    fn test_cached_core_archive_dir_name() {
        let a = cached_core_archive_dir_name("arduino:avr:nano:cpu=atmega328", "-Os", Path::new("/hw/avr"));
        assert!(a.starts_with("arduino_avr_nano_cpu_atmega328_"));
        assert_eq!(a.len(), "arduino_avr_nano_cpu_atmega328_".len() + 32);
        let b = cached_core_archive_dir_name("arduino:avr:nano:cpu=atmega328", "-O2", Path::new("/hw/avr"));
        assert_ne!(a, b);
        let c = cached_core_archive_dir_name("arduino:avr:nano:cpu=atmega328", "-Os", Path::new("/hw/avr"));
        assert_eq!(a, c);

        let long_fqbn = format!("vendor:arch:board:{}", "option=value,".repeat(10));
        let long = cached_core_archive_dir_name(&long_fqbn, "", Path::new("/hw"));
        assert_eq!(long.len(), 32);
        assert!(long.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_core_change_detection() {
        let tmp = TempDir::new().unwrap();
        let now = SystemTime::now();
        let core = tmp.path().join("platform");
        let other = tmp.path().join("board-platform");
        let archive = tmp.path().join("cache/core.a");

        touch(&core.join("cores/arduino/main.cpp"), now - Duration::from_secs(100));
        touch(&core.join("platform.txt"), now - Duration::from_secs(100));
        touch(&other.join("boards.txt"), now - Duration::from_secs(100));
        assert!(core_or_referenced_core_has_changed(&core, Some(&other), &archive));

        touch(&archive, now - Duration::from_secs(50));
        assert!(!core_or_referenced_core_has_changed(&core, Some(&other), &archive));
        assert!(!txt_build_rules_have_changed(&core, Some(&other), &archive));

        touch(&core.join("cores/arduino/main.cpp"), now);
        assert!(core_or_referenced_core_has_changed(&core, None, &archive));
        assert!(!txt_build_rules_have_changed(&core, None, &archive));

        touch(&core.join("cores/arduino/main.cpp"), now - Duration::from_secs(100));
        touch(&other.join("boards.txt"), now);
        assert!(!core_or_referenced_core_has_changed(&core, None, &archive));
        assert!(core_or_referenced_core_has_changed(&core, Some(&other), &archive));
        assert!(txt_build_rules_have_changed(&core, Some(&other), &archive));
    }
}
