//! Installed platforms and board resolution.
//!
//! A hardware folder contains `<package>/<arch>/` platform folders, each with
//! a `platform.txt`, a `boards.txt` and the `cores/`, `variants/` and
//! `libraries/` trees referenced from them. Boards-manager installs use the
//! `<package>/hardware/<arch>/<version>/` layout; the highest version wins.

use crate::error::BuildError;
use crate::fqbn::Fqbn;
use crate::properties::PropertyMap;
use anyhow::{Context, Result, bail};
use semver::Version;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Platform {
    pub package: String,
    pub architecture: String,
    pub dir: PathBuf,
    pub properties: PropertyMap,
    pub boards: PropertyMap,
}

impl Platform {
    fn load(package: &str, architecture: &str, dir: &Path) -> Result<Self> {
        let mut properties = PropertyMap::load_if_exists(&dir.join("platform.txt"))?;
        properties.merge(&PropertyMap::load_if_exists(&dir.join("platform.local.txt"))?);
        let mut boards = PropertyMap::load_if_exists(&dir.join("boards.txt"))?;
        boards.merge(&PropertyMap::load_if_exists(&dir.join("boards.local.txt"))?);
        Ok(Self {
            package: package.to_string(),
            architecture: architecture.to_string(),
            dir: dir.to_path_buf(),
            properties,
            boards,
        })
    }
}

/// The board selected for a build, with everything the build engine needs
/// from the platform that provides it.
#[derive(Debug, Clone)]
pub struct TargetBoard {
    pub fqbn: Fqbn,
    pub platform_dir: PathBuf,
    pub properties: PropertyMap,
    pub core_dir: PathBuf,
    pub variant_dir: Option<PathBuf>,
    /// Platform that provides the core when `build.core` is `vendor:core`.
    pub referenced_platform_dir: Option<PathBuf>,
}

impl TargetBoard {
    pub fn hardware_dir(&self) -> PathBuf {
        self.platform_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.platform_dir.clone())
    }

    pub fn platform_libraries_dir(&self) -> PathBuf {
        self.platform_dir.join("libraries")
    }

    pub fn referenced_libraries_dir(&self) -> Option<PathBuf> {
        self.referenced_platform_dir
            .as_ref()
            .map(|dir| dir.join("libraries"))
    }

    /// The platform folder containing the core sources (the referenced one
    /// when the core is borrowed from another vendor).
    pub fn core_platform_dir(&self) -> &Path {
        self.referenced_platform_dir
            .as_deref()
            .unwrap_or(&self.platform_dir)
    }
}

#[derive(Debug, Default)]
pub struct Hardware {
    platforms: Vec<Platform>,
}

impl Hardware {
    /// Scan every hardware folder. Later folders override earlier ones for
    /// the same `package:arch`.
    pub fn load(dirs: &[PathBuf]) -> Result<Self> {
        let mut platforms = Vec::new();
        for dir in dirs {
            if !dir.is_dir() {
                debug!("Skipping missing hardware folder {}", dir.display());
                continue;
            }
            for package in sorted_subdirs(dir)? {
                let package_name = file_name(&package);
                let bm_layout = package.join("hardware");
                let arch_root = if bm_layout.is_dir() { bm_layout } else { package.clone() };
                for arch_dir in sorted_subdirs(&arch_root)? {
                    let arch = file_name(&arch_dir);
                    if let Some(platform_dir) = platform_root(&arch_dir)? {
                        debug!("Found platform {}:{} in {}", package_name, arch, platform_dir.display());
                        platforms.push(Platform::load(&package_name, &arch, &platform_dir)?);
                    }
                }
            }
        }
        Ok(Self { platforms })
    }

    pub fn platforms(&self) -> &[Platform] {
        &self.platforms
    }

    pub fn platform(&self, package: &str, architecture: &str) -> Option<&Platform> {
        self.platforms
            .iter()
            .rev()
            .find(|p| p.package == package && p.architecture == architecture)
    }

    pub fn resolve(&self, fqbn: &Fqbn) -> Result<TargetBoard> {
        let missing = || BuildError::MissingBoard {
            fqbn: fqbn.to_string(),
        };
        let platform = self
            .platform(&fqbn.package, &fqbn.architecture)
            .ok_or_else(missing)?;
        let mut board = platform.boards.sub_tree(&fqbn.board_id);
        if board.is_empty() {
            return Err(missing().into());
        }
        apply_menu_options(&mut board, fqbn)?;

        let mut properties = platform.properties.clone();
        properties.merge(&board);

        let (core_platform, core) = self.split_reference(platform, properties.get("build.core"))?;
        if core.is_empty() {
            bail!("Board {} does not define build.core", fqbn);
        }
        let core_dir = core_platform.dir.join("cores").join(core);

        let variant_dir = match properties.get("build.variant") {
            "" => None,
            variant => {
                let (variant_platform, name) = self.split_reference(platform, variant)?;
                Some(variant_platform.dir.join("variants").join(name))
            }
        };

        let referenced_platform_dir =
            (core_platform.dir != platform.dir).then(|| core_platform.dir.clone());

        Ok(TargetBoard {
            fqbn: fqbn.clone(),
            platform_dir: platform.dir.clone(),
            properties,
            core_dir,
            variant_dir,
            referenced_platform_dir,
        })
    }

    /// Resolve `vendor:name` references to the platform of the same
    /// architecture from `vendor`.
    fn split_reference<'a, 'b>(
        &'a self,
        platform: &'a Platform,
        value: &'b str,
    ) -> Result<(&'a Platform, &'b str)> {
        match value.split_once(':') {
            Some((vendor, name)) => {
                let referenced = self
                    .platform(vendor, &platform.architecture)
                    .with_context(|| {
                        format!(
                            "Referenced platform {}:{} is not installed",
                            vendor, platform.architecture
                        )
                    })?;
                Ok((referenced, name))
            }
            None => Ok((platform, value)),
        }
    }
}

/// Merge `menu.<option>.<value>.*` keys for the selected options; menus
/// that are not selected fall back to their first value.
fn apply_menu_options(board: &mut PropertyMap, fqbn: &Fqbn) -> Result<()> {
    let menus = board.sub_tree("menu");
    for option in menus.first_level_keys() {
        let choices = menus.sub_tree(&option);
        let selected = match fqbn.configs.iter().find(|(k, _)| *k == option) {
            Some((_, value)) => value.clone(),
            None => match choices.first_level_keys().into_iter().next() {
                Some(first) => first,
                None => continue,
            },
        };
        let overrides = choices.sub_tree(&selected);
        if overrides.is_empty() && !choices.contains_key(&selected) {
            return Err(BuildError::InvalidFqbn {
                fqbn: fqbn.to_string(),
                reason: format!("invalid value '{selected}' for option '{option}'"),
            }
            .into());
        }
        board.merge(&overrides);
    }
    for (option, _) in &fqbn.configs {
        if !menus.first_level_keys().contains(option) {
            return Err(BuildError::InvalidFqbn {
                fqbn: fqbn.to_string(),
                reason: format!("invalid option '{option}'"),
            }
            .into());
        }
    }
    Ok(())
}

/// `arch_dir` itself when it holds a platform, or its highest version
/// subfolder in the boards-manager layout.
fn platform_root(arch_dir: &Path) -> Result<Option<PathBuf>> {
    if arch_dir.join("platform.txt").is_file() || arch_dir.join("boards.txt").is_file() {
        return Ok(Some(arch_dir.to_path_buf()));
    }
    let latest = sorted_subdirs(arch_dir)?
        .into_iter()
        .filter(|v| v.join("platform.txt").is_file() || v.join("boards.txt").is_file())
        .filter_map(|v| Version::parse(&file_name(&v)).ok().map(|version| (version, v)))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, dir)| dir);
    Ok(latest)
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() && !file_name(&path).starts_with('.') {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// `runtime.tools.*` entries for every tool folder under the given roots.
pub fn discover_tools(tools_dirs: &[PathBuf]) -> Result<PropertyMap> {
    let mut tools = PropertyMap::new();
    for root in tools_dirs {
        if !root.is_dir() {
            continue;
        }
        for tool in sorted_subdirs(root)? {
            let name = file_name(&tool);
            tools.set_path(format!("runtime.tools.{name}.path"), &tool);
            let mut latest: Option<(Option<Version>, PathBuf)> = None;
            for version in sorted_subdirs(&tool)? {
                let v = file_name(&version);
                if !v.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                    continue;
                }
                tools.set_path(format!("runtime.tools.{name}-{v}.path"), &version);
                // names that are not semver rank below those that are
                let parsed = Version::parse(&v).ok();
                if latest.as_ref().is_none_or(|(best, _)| parsed >= *best) {
                    latest = Some((parsed, version));
                }
            }
            if let Some((_, version)) = latest {
                tools.set_path(format!("runtime.tools.{name}.path"), &version);
            }
        }
    }
    Ok(tools)
}
