//! Turning recipe templates into commands.

use super::context::Context;
use super::exec::{OutputMode, RecipeCommand, exec_command};
use super::types::Command;
use crate::error::BuildError;
use crate::properties::{PropertyMap, delete_unexpanded, split_quoted};
use anyhow::Result;
use std::path::{Component, Path};
use tracing::debug;

/// Longest command line passed to a tool without shortening its paths.
pub const COMMANDLINE_LIMIT: usize = 30_000;

/// Expand `recipe` from `properties` into a command. Past
/// [`COMMANDLINE_LIMIT`] characters, arguments naming existing paths are
/// rewritten relative to `build.path`, which becomes the working folder.
pub fn prepare_command_for_recipe(
    properties: &PropertyMap,
    recipe: &str,
    remove_unset_properties: bool,
    tool_env: &[(String, String)],
) -> Result<RecipeCommand> {
    let pattern = properties.get(recipe);
    if pattern.is_empty() {
        return Err(BuildError::MissingRecipe {
            recipe: recipe.to_string(),
        }
        .into());
    }

    let mut command_line = properties.expand(pattern);
    if remove_unset_properties {
        command_line = delete_unexpanded(&command_line);
    }

    let mut parts = split_quoted(&command_line, "\"'", false)?;
    if parts.is_empty() {
        return Err(BuildError::MissingRecipe {
            recipe: recipe.to_string(),
        }
        .into());
    }

    let mut cwd = None;
    if command_line.len() > COMMANDLINE_LIMIT
        && let Some(build_path) = properties.get_path("build.path")
    {
        debug!("Command line for {} exceeds the limit, relativizing paths", recipe);
        for part in parts.iter_mut() {
            if let Some(shorter) = relative_if_shorter(part, &build_path) {
                *part = shorter;
            }
        }
        cwd = Some(build_path);
    }

    let program = parts.remove(0);
    Ok(RecipeCommand {
        program,
        args: parts,
        env: tool_env.to_vec(),
        cwd,
    })
}

fn relative_if_shorter(arg: &str, base: &Path) -> Option<String> {
    let path = Path::new(arg);
    if !path.exists() {
        return None;
    }
    let relative = relative_path(base, path)?;
    if relative.components().any(|c| c == Component::ParentDir) {
        return None;
    }
    let relative = relative.to_string_lossy().to_string();
    (relative.len() < arg.len()).then_some(relative)
}

/// `target` expressed relative to `base`, when both are absolute.
fn relative_path(base: &Path, target: &Path) -> Option<std::path::PathBuf> {
    if !base.is_absolute() || !target.is_absolute() {
        return None;
    }
    let base: Vec<_> = base.components().collect();
    let target: Vec<_> = target.components().collect();
    let common = base.iter().zip(&target).take_while(|(a, b)| a == b).count();
    let mut relative = std::path::PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for part in &target[common..] {
        relative.push(part.as_os_str());
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    Some(relative)
}

/// Keys starting with `prefix` and ending with `suffix` that hold a
/// non-empty value, sorted.
pub fn find_recipes(properties: &PropertyMap, prefix: &str, suffix: &str) -> Vec<String> {
    let mut recipes: Vec<String> = properties
        .iter()
        .filter(|(key, value)| key.starts_with(prefix) && key.ends_with(suffix) && !value.is_empty())
        .map(|(key, _)| key.to_string())
        .collect();
    recipes.sort();
    recipes
}

/// Runs every recipe matching `prefix*suffix`, in key order.
pub struct RecipeByPrefixSuffix {
    pub prefix: &'static str,
    pub suffix: &'static str,
    pub skip_if_only_updating_db: bool,
}

impl RecipeByPrefixSuffix {
    pub const fn new(prefix: &'static str, suffix: &'static str) -> Self {
        Self {
            prefix,
            suffix,
            skip_if_only_updating_db: false,
        }
    }

    pub const fn skip_if_only_updating_db(mut self) -> Self {
        self.skip_if_only_updating_db = true;
        self
    }
}

impl Command for RecipeByPrefixSuffix {
    fn run(&self, ctx: &mut Context) -> Result<()> {
        debug!("Looking for recipes like {}*{}", self.prefix, self.suffix);
        let properties = ctx.build_properties.clone();
        for recipe in find_recipes(&properties, self.prefix, self.suffix) {
            debug!("Running recipe: {}", recipe);
            let command = prepare_command_for_recipe(&properties, &recipe, false, &ctx.tool_env)?;
            if ctx.only_update_compilation_database && self.skip_if_only_updating_db {
                if ctx.verbose {
                    ctx.console.info(format!("Skipping: {}", command.printable()));
                }
                return Ok(());
            }
            exec_command(ctx, &command, OutputMode::ShowIfVerbose, OutputMode::Show)?;
        }
        Ok(())
    }
}
