//! Shared cache of compiled cores.
//!
//! Every entry is a folder named after the board, flags and core location
//! it was built for. A `.last-used` marker is touched whenever a build
//! looks the entry up, so stale entries can be purged by age.
//!
//! ## Commands
//!
//! - `inox cache path` - Print cache directory location
//! - `inox cache list` - List cached cores
//! - `inox cache clean` - Remove every cached core
//! - `inox cache purge --max-age-days N` - Remove cores unused for N days

use crate::ui;
use anyhow::{Context, Result};
use colored::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

pub const LAST_USED_FILE: &str = ".last-used";

/// `<user cache dir>/inox/cores`.
pub fn default_cache_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir().context("Could not find the user cache directory")?;
    Ok(base.join("inox").join("cores"))
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub name: String,
    pub path: PathBuf,
    pub last_used: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct BuildCache {
    base_dir: PathBuf,
}

impl BuildCache {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Folder for `key`, created if needed, with its marker refreshed.
    pub fn get_or_create(&self, key: &str) -> Result<PathBuf> {
        let dir = self.base_dir.join(key);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create core cache folder {}", dir.display()))?;
        fs::write(dir.join(LAST_USED_FILE), b"")
            .with_context(|| format!("Failed to mark {} as used", dir.display()))?;
        Ok(dir)
    }

    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        if !self.base_dir.is_dir() {
            return Ok(entries);
        }
        for entry in fs::read_dir(&self.base_dir)
            .with_context(|| format!("Failed to read {}", self.base_dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            let last_used = fs::metadata(path.join(LAST_USED_FILE))
                .and_then(|m| m.modified())
                .ok();
            entries.push(CacheEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                path,
                last_used,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Remove entries not used within `ttl`. Entries without a marker are
    /// left alone. Returns the removed folders.
    pub fn purge(&self, ttl: Duration) -> Result<Vec<PathBuf>> {
        let now = SystemTime::now();
        let mut removed = Vec::new();
        for entry in self.entries()? {
            let Some(last_used) = entry.last_used else {
                continue;
            };
            let age = now.duration_since(last_used).unwrap_or_default();
            if age < ttl {
                continue;
            }
            debug!("Removing expired cache entry {}", entry.path.display());
            fs::remove_dir_all(&entry.path)
                .with_context(|| format!("Failed to remove {}", entry.path.display()))?;
            removed.push(entry.path);
        }
        Ok(removed)
    }

    pub fn clean(&self) -> Result<()> {
        if self.base_dir.exists() {
            fs::remove_dir_all(&self.base_dir)
                .with_context(|| format!("Failed to remove {}", self.base_dir.display()))?;
        }
        Ok(())
    }
}

pub fn print_path(cache: &BuildCache) {
    println!("{}", cache.base_dir().display());
}

pub fn list(cache: &BuildCache) -> Result<()> {
    let entries = cache.entries()?;
    if entries.is_empty() {
        println!("{} Cache is empty.", "ℹ".blue());
        return Ok(());
    }

    let now = SystemTime::now();
    let mut table = ui::Table::new(&["Cached Core", "Last Used"]);
    for entry in entries {
        let last_used = match entry.last_used {
            Some(t) => format!("{} days ago", now.duration_since(t).unwrap_or_default().as_secs() / 86_400),
            None => "never".to_string(),
        };
        table.add_row(vec![entry.name, last_used]);
    }
    table.print();
    Ok(())
}

pub fn clean(cache: &BuildCache) -> Result<()> {
    if cache.base_dir().exists() {
        println!("{} Cleaning core cache...", "🧹".yellow());
        cache.clean()?;
        println!("{} Cache cleaned.", "✓".green());
    } else {
        println!("{} Cache already empty.", "✓".green());
    }
    Ok(())
}

pub fn purge(cache: &BuildCache, max_age_days: u64) -> Result<()> {
    let removed = cache.purge(Duration::from_secs(max_age_days * 86_400))?;
    for path in &removed {
        println!("   {} Removed {}", "🗑️".red(), path.display());
    }
    if removed.is_empty() {
        println!("{} All cached cores are in use.", "✓".green());
    } else {
        println!("{} Removed {} cached cores.", "✓".green(), removed.len());
    }
    Ok(())
}
