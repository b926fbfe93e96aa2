//! Installed libraries and header lookup.

use crate::error::BuildError;
use crate::properties::PropertyMap;
use crate::sketch::HEADER_FILE_EXTENSIONS;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a library was installed. Variants are declared in resolution
/// priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LibraryLocation {
    PlatformBuiltIn,
    ReferencedPlatformBuiltIn,
    User,
    IdeBuiltIn,
}

impl LibraryLocation {
    pub fn label(self) -> &'static str {
        match self {
            Self::PlatformBuiltIn => "platform",
            Self::ReferencedPlatformBuiltIn => "ref-platform",
            Self::User => "user",
            Self::IdeBuiltIn => "ide",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryLayout {
    /// Sources in the library root, plus an optional `utility/` folder.
    Flat,
    /// Sources anywhere under `src/`.
    Recursive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    pub name: String,
    pub dir: PathBuf,
    pub source_dir: PathBuf,
    pub layout: LibraryLayout,
    pub version: String,
    pub architectures: Vec<String>,
    pub dot_a_linkage: bool,
    pub location: LibraryLocation,
}

impl Library {
    pub fn load(dir: &Path, location: LibraryLocation) -> Result<Self> {
        let props = PropertyMap::load_if_exists(&dir.join("library.properties"))?;
        let has_props = !props.is_empty();
        let layout = if has_props && dir.join("src").is_dir() {
            LibraryLayout::Recursive
        } else {
            LibraryLayout::Flat
        };
        let source_dir = match layout {
            LibraryLayout::Recursive => dir.join("src"),
            LibraryLayout::Flat => dir.to_path_buf(),
        };

        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = match props.get("name").trim() {
            "" => dir_name,
            name => name.to_string(),
        };

        let mut architectures: Vec<String> = props
            .get("architectures")
            .split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if architectures.is_empty() {
            architectures.push("*".to_string());
        }

        Ok(Self {
            name,
            dir: dir.to_path_buf(),
            source_dir,
            layout,
            version: props.get("version").to_string(),
            architectures,
            dot_a_linkage: props.get("dot_a_linkage") == "true",
            location,
        })
    }

    /// Name of the installation folder, used for the build sub-folder.
    pub fn dir_name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn utility_dir(&self) -> Option<PathBuf> {
        match self.layout {
            LibraryLayout::Flat => Some(self.dir.join("utility")).filter(|d| d.is_dir()),
            LibraryLayout::Recursive => None,
        }
    }

    pub fn is_compatible_with(&self, arch: &str) -> bool {
        self.architectures.iter().any(|a| a == "*" || a == arch)
    }

    /// Headers directly inside the source folder.
    pub fn headers(&self) -> Result<Vec<String>> {
        let mut headers = Vec::new();
        let Ok(entries) = fs::read_dir(&self.source_dir) else {
            return Ok(headers);
        };
        for entry in entries {
            let path = entry?.path();
            let is_header = path
                .extension()
                .is_some_and(|e| HEADER_FILE_EXTENSIONS.iter().any(|h| e == *h));
            if is_header
                && path.is_file()
                && let Some(name) = path.file_name()
            {
                headers.push(name.to_string_lossy().to_string());
            }
        }
        headers.sort();
        Ok(headers)
    }

    /// Rank among candidates of the same location: exact architecture
    /// beats wildcard, then a name matching the header stem wins.
    fn rank(&self, header: &str, arch: &str) -> (u8, u8) {
        let arch_rank = if self.architectures.iter().any(|a| a == arch) {
            2
        } else if self.architectures.iter().any(|a| a == "*") {
            1
        } else {
            0
        };
        let stem = header.rsplit_once('.').map_or(header, |(s, _)| s);
        let name_rank = if self.name == stem || self.dir_name() == stem {
            2
        } else if self.dir_name().starts_with(stem) {
            1
        } else {
            0
        };
        (arch_rank, name_rank)
    }
}

/// Outcome of resolving one header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryResolutionResult {
    pub library: Library,
    /// Other candidates that could have provided the header.
    pub not_used: Vec<PathBuf>,
    /// Whether the choice should be reported to the user.
    pub reported: bool,
}

#[derive(Debug, Default)]
pub struct LibraryIndex {
    libraries: Vec<Library>,
    by_header: HashMap<String, Vec<usize>>,
}

impl LibraryIndex {
    /// Scan library roots. Every non-hidden sub-folder is a library.
    pub fn scan(roots: &[(PathBuf, LibraryLocation)]) -> Result<Self> {
        let mut index = Self::default();
        for (root, location) in roots {
            if !root.is_dir() {
                continue;
            }
            let mut dirs = Vec::new();
            for entry in fs::read_dir(root).with_context(|| format!("Failed to read {}", root.display()))? {
                let path = entry?.path();
                let hidden = path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with('.'));
                if path.is_dir() && !hidden {
                    dirs.push(path);
                }
            }
            dirs.sort();
            for dir in dirs {
                index.add(Library::load(&dir, *location)?)?;
            }
        }
        Ok(index)
    }

    pub fn add(&mut self, library: Library) -> Result<()> {
        let id = self.libraries.len();
        for header in library.headers()? {
            self.by_header.entry(header).or_default().push(id);
        }
        debug!("Indexed library {} ({})", library.name, library.dir.display());
        self.libraries.push(library);
        Ok(())
    }

    pub fn libraries(&self) -> &[Library] {
        &self.libraries
    }

    pub fn candidates(&self, header: &str) -> Vec<&Library> {
        self.by_header
            .get(header)
            .map(|ids| ids.iter().map(|&i| &self.libraries[i]).collect())
            .unwrap_or_default()
    }

    /// Pick the library providing `header` for `arch`. Incompatible
    /// libraries are only used when nothing else matches. A tie between
    /// two best-ranked candidates of the same location is an error.
    pub fn resolve(&self, header: &str, arch: &str) -> Result<Option<LibraryResolutionResult>, BuildError> {
        let all = self.candidates(header);
        if all.is_empty() {
            return Ok(None);
        }
        let compatible: Vec<&Library> = all
            .iter()
            .copied()
            .filter(|l| l.is_compatible_with(arch))
            .collect();
        let pool = if compatible.is_empty() { all.clone() } else { compatible };

        let Some(tier) = pool.iter().map(|l| l.location).min() else {
            return Ok(None);
        };
        let mut best: Vec<&Library> = Vec::new();
        let mut best_rank = (0, 0);
        for lib in pool.iter().filter(|l| l.location == tier) {
            let rank = lib.rank(header, arch);
            if best.is_empty() || rank > best_rank {
                best = vec![lib];
                best_rank = rank;
            } else if rank == best_rank {
                best.push(lib);
            }
        }

        if best.len() > 1 {
            return Err(BuildError::AmbiguousLibrary {
                header: header.to_string(),
                candidates: best.iter().map(|l| l.dir.display().to_string()).collect(),
            });
        }
        let Some(winner) = best.into_iter().next() else {
            return Ok(None);
        };

        let not_used: Vec<PathBuf> = all
            .iter()
            .filter(|l| l.dir != winner.dir)
            .map(|l| l.dir.clone())
            .collect();
        let reported = !not_used.is_empty() && tier > LibraryLocation::ReferencedPlatformBuiltIn;
        Ok(Some(LibraryResolutionResult {
            library: winner.clone(),
            not_used,
            reported,
        }))
    }
}
