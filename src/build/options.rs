//! `build.options.json`: the inputs a build folder was produced with.
//!
//! When the options of a new build differ from the stored ones, or the
//! platform's `.txt` rules changed since they were stored, every artifact
//! in the build folder is discarded.

use super::archive::txt_build_rules_have_changed;
use super::clean::clean_build_path;
use super::context::Context;
use anyhow::{Context as _, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const BUILD_OPTIONS_FILE: &str = "build.options.json";

pub type BuildOptions = BTreeMap<String, String>;

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Snapshot of everything that shapes the build.
pub fn build_options_map(ctx: &Context) -> Result<BuildOptions> {
    let sketch = ctx.sketch()?;
    let base = sketch.full_path.parent().unwrap_or(&sketch.full_path);
    let additional_files: Vec<String> = sketch
        .additional_files
        .iter()
        .map(|f| {
            f.strip_prefix(base)
                .unwrap_or(f)
                .to_string_lossy()
                .to_string()
        })
        .collect();

    let mut opts = BuildOptions::new();
    opts.insert("hardwareFolders".into(), join_paths(&ctx.hardware_dirs));
    opts.insert("builtInToolsFolders".into(), join_paths(&ctx.tools_dirs));
    opts.insert("builtInLibrariesFolders".into(), join_paths(&ctx.builtin_libraries_dirs));
    opts.insert("otherLibrariesFolders".into(), join_paths(&ctx.other_libraries_dirs));
    opts.insert("sketchLocation".into(), sketch.full_path.to_string_lossy().to_string());
    opts.insert("fqbn".into(), ctx.fqbn.clone());
    opts.insert("customBuildProperties".into(), ctx.custom_build_properties.join(","));
    opts.insert("additionalFiles".into(), additional_files.join(","));
    opts.insert(
        "compiler.optimization_flags".into(),
        ctx.build_properties.get("compiler.optimization_flags").to_string(),
    );
    Ok(opts)
}

pub fn create_build_options_map(ctx: &mut Context) -> Result<()> {
    let opts = build_options_map(ctx)?;
    ctx.build_options_json = serde_json::to_string_pretty(&opts)?;
    Ok(())
}

pub fn load_previous_build_options_map(ctx: &mut Context) -> Result<()> {
    let file = ctx.build_path.join(BUILD_OPTIONS_FILE);
    ctx.build_options_json_previous = if file.is_file() {
        fs::read_to_string(&file).with_context(|| format!("Failed to read {}", file.display()))?
    } else {
        String::new()
    };
    Ok(())
}

fn sketch_name(opts: &BuildOptions) -> Option<String> {
    let location = opts.get("sketchLocation")?;
    Path::new(location)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
}

/// Whether the build folder must be wiped before building.
pub fn build_options_changed(
    current_json: &str,
    previous_json: &str,
    core_platform_dir: &Path,
    board_platform_dir: Option<&Path>,
    options_file: &Path,
) -> Result<bool> {
    if previous_json.is_empty() {
        return Ok(false);
    }
    let mut current: BuildOptions = serde_json::from_str(current_json)?;
    let Ok(mut previous) = serde_json::from_str::<BuildOptions>(previous_json) else {
        debug!("{BUILD_OPTIONS_FILE} is invalid, rebuilding all");
        return Ok(true);
    };

    // a sketch moved to another folder keeps its objects
    if sketch_name(&current) == sketch_name(&previous) {
        current.remove("sketchLocation");
        previous.remove("sketchLocation");
    }
    if current != previous {
        return Ok(true);
    }
    Ok(txt_build_rules_have_changed(core_platform_dir, board_platform_dir, options_file))
}

pub fn wipeout_build_path_if_build_options_changed(ctx: &mut Context) -> Result<()> {
    let target = ctx.target()?;
    let options_file = ctx.build_path.join(BUILD_OPTIONS_FILE);
    let changed = build_options_changed(
        &ctx.build_options_json,
        &ctx.build_options_json_previous,
        target.core_platform_dir(),
        Some(&target.platform_dir),
        &options_file,
    )?;
    if changed {
        if ctx.verbose {
            ctx.console
                .info("Build options changed, rebuilding all");
        }
        clean_build_path(&ctx.build_path)?;
    }
    Ok(())
}

pub fn store_build_options_map(ctx: &mut Context) -> Result<()> {
    fs::create_dir_all(&ctx.build_path)
        .with_context(|| format!("Failed to create {}", ctx.build_path.display()))?;
    let file = ctx.build_path.join(BUILD_OPTIONS_FILE);
    fs::write(&file, &ctx.build_options_json)
        .with_context(|| format!("Failed to write {}", file.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn json(pairs: &[(&str, &str)]) -> String {
        let opts: BuildOptions = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        serde_json::to_string_pretty(&opts).unwrap()
    }

    struct Fixture {
        _tmp: TempDir,
        platform: PathBuf,
        options_file: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let platform = tmp.path().join("avr");
        fs::create_dir_all(&platform).unwrap();
        let old = SystemTime::now() - Duration::from_secs(100);
        fs::write(platform.join("platform.txt"), "").unwrap();
        File::options()
            .write(true)
            .open(platform.join("platform.txt"))
            .unwrap()
            .set_modified(old)
            .unwrap();
        let options_file = tmp.path().join("build.options.json");
        fs::write(&options_file, "{}").unwrap();
        Fixture {
            _tmp: tmp,
            platform,
            options_file,
        }
    }

    fn changed(f: &Fixture, current: &str, previous: &str) -> bool {
        build_options_changed(current, previous, &f.platform, None, &f.options_file).unwrap()
    }

    #[test]
    fn test_json_is_sorted_with_two_space_indent() {
        let text = json(&[("fqbn", "a:b:c"), ("additionalFiles", "")]);
        assert_eq!(text, "{\n  \"additionalFiles\": \"\",\n  \"fqbn\": \"a:b:c\"\n}");
    }

    #[test]
    fn test_unchanged_and_first_build() {
        let f = fixture();
        let opts = json(&[("fqbn", "a:b:c"), ("sketchLocation", "/x/Blink")]);
        assert!(!changed(&f, &opts, ""));
        assert!(!changed(&f, &opts, &opts));
    }

    #[test]
    fn test_changed_options_and_invalid_json() {
        let f = fixture();
        let opts = json(&[("fqbn", "a:b:c")]);
        assert!(changed(&f, &opts, &json(&[("fqbn", "a:b:d")])));
        assert!(changed(&f, &opts, "not json"));
    }

    #[test]
    fn test_moved_sketch_with_same_name() {
        let f = fixture();
        let now = json(&[("fqbn", "a:b:c"), ("sketchLocation", "/new/Blink")]);
        assert!(!changed(&f, &now, &json(&[("fqbn", "a:b:c"), ("sketchLocation", "/old/Blink")])));
        assert!(changed(&f, &now, &json(&[("fqbn", "a:b:c"), ("sketchLocation", "/old/Fade")])));
    }

    #[test]
    fn test_newer_platform_rules_force_wipe() {
        let f = fixture();
        let opts = json(&[("fqbn", "a:b:c")]);
        File::options()
            .write(true)
            .open(f.platform.join("platform.txt"))
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(100))
            .unwrap();
        assert!(changed(&f, &opts, &opts));
    }
}
