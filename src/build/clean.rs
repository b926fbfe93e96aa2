//! Build folder cleanup.
//!
//! - wiping the whole build path when the build options changed
//! - dropping compiled libraries the sketch no longer includes

use super::context::Context;
use super::types::Origin;
use anyhow::{Context as _, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Remove everything inside `build_path`, keeping the folder itself.
pub fn clean_build_path(build_path: &Path) -> Result<()> {
    if !build_path.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(build_path)
        .with_context(|| format!("Failed to clean build path {}", build_path.display()))?
    {
        let path = entry?.path();
        debug!("Removing {}", path.display());
        if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}

/// Delete `libraries/<dir>` build folders of libraries that are no longer
/// imported.
pub fn remove_unused_compiled_libraries(ctx: &mut Context) -> Result<()> {
    let libraries_build_path = &ctx.libraries_build_path;
    if !libraries_build_path.is_dir() {
        return Ok(());
    }
    let in_use: HashSet<_> = ctx
        .imported_libraries
        .iter()
        .map(|lib| Origin::Library(lib.clone()).build_root(ctx))
        .collect();

    for entry in fs::read_dir(libraries_build_path)
        .with_context(|| format!("Failed to read {}", libraries_build_path.display()))?
    {
        let path = entry?.path();
        if path.is_dir() && !in_use.contains(&path) {
            debug!("Removing unused compiled library {}", path.display());
            fs::remove_dir_all(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}
