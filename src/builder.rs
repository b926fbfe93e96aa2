//! The full sketch build as an ordered list of stages.

use crate::build::{
    Command, Context, RecipeByPrefixSuffix, clean, includes, options, phases, prototypes, run_commands, setup,
};
use anyhow::Result;

type Stage = (&'static str, Box<dyn Command>);

fn stage(name: &'static str, f: fn(&mut Context) -> Result<()>) -> Stage {
    (name, Box::new(f))
}

fn hook(name: &'static str, prefix: &'static str) -> Stage {
    (name, Box::new(RecipeByPrefixSuffix::new(prefix, ".pattern").skip_if_only_updating_db()))
}

/// Loading the board, tools, libraries and sketch, then checking the build
/// folder against the options it was built with.
pub fn setup_stages() -> Vec<Stage> {
    vec![
        stage("check build path", phases::fail_if_build_path_equals_sketch_path),
        stage("add additional entries", phases::add_additional_entries),
        stage("load hardware", setup::load_hardware),
        stage("load sketch", setup::load_sketch),
        stage("setup build properties", setup::setup_build_properties),
        stage("load libraries", setup::load_libraries),
        stage("create build options", options::create_build_options_map),
        stage("load previous build options", options::load_previous_build_options_map),
        stage("wipe stale build", options::wipeout_build_path_if_build_options_changed),
        stage("store build options", options::store_build_options_map),
    ]
}

/// Everything after setup: preprocessing, compiling, linking and the
/// platform hooks around each phase.
pub fn build_stages() -> Vec<Stage> {
    vec![
        hook("prebuild hooks", "recipe.hooks.prebuild"),
        stage("prepare sketch build path", phases::prepare_sketch_build_path),
        stage("detect libraries", includes::find_includes),
        stage("report library resolution", includes::print_library_resolution_notes),
        stage("remove unused compiled libraries", clean::remove_unused_compiled_libraries),
        stage("preprocess sketch", prototypes::preprocess_sketch),
        hook("sketch prebuild hooks", "recipe.hooks.sketch.prebuild"),
        stage("compile sketch", phases::build_sketch),
        hook("sketch postbuild hooks", "recipe.hooks.sketch.postbuild"),
        hook("libraries prebuild hooks", "recipe.hooks.libraries.prebuild"),
        stage("compile libraries", phases::build_libraries),
        hook("libraries postbuild hooks", "recipe.hooks.libraries.postbuild"),
        hook("core prebuild hooks", "recipe.hooks.core.prebuild"),
        stage("compile core", phases::build_core),
        hook("core postbuild hooks", "recipe.hooks.core.postbuild"),
        hook("prelink hooks", "recipe.hooks.linking.prelink"),
        stage("link", phases::link),
        hook("postlink hooks", "recipe.hooks.linking.postlink"),
        hook("preobjcopy hooks", "recipe.hooks.objcopy.preobjcopy"),
        hook("objcopy", "recipe.objcopy."),
        hook("postobjcopy hooks", "recipe.hooks.objcopy.postobjcopy"),
        stage("save compilation database", phases::save_compilation_database),
        stage("print used libraries", phases::print_used_libraries),
        hook("postbuild hooks", "recipe.hooks.postbuild"),
    ]
}

/// Compile the sketch described by `ctx`.
pub fn compile(ctx: &mut Context) -> Result<()> {
    run_commands(ctx, &setup_stages())?;
    run_commands(ctx, &build_stages())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hooks_surround_their_phase() {
        let names: Vec<&str> = build_stages().iter().map(|(name, _)| *name).collect();
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert!(pos("prepare sketch build path") < pos("detect libraries"));
        assert!(pos("detect libraries") < pos("preprocess sketch"));
        assert!(pos("sketch prebuild hooks") < pos("compile sketch"));
        assert!(pos("compile core") < pos("core postbuild hooks"));
        assert!(pos("prelink hooks") < pos("link"));
        assert!(pos("link") < pos("objcopy"));
        assert_eq!(names.last(), Some(&"postbuild hooks"));
    }

    #[test]
    fn test_setup_checks_build_path_first() {
        let names: Vec<&str> = setup_stages().iter().map(|(name, _)| *name).collect();
        assert_eq!(names[0], "check build path");
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert!(pos("wipe stale build") < pos("store build options"));
    }
}
