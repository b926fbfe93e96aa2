//! Forward declarations for sketch functions.
//!
//! Arduino sketches may call a function before defining it. The merged
//! sketch is run through the preprocessor and ctags, and a prototype for
//! every free function is inserted before the first function definition.

use super::compile::include_args;
use super::context::Context;
use super::ctags::{CtagsParser, Prototype, filter_sketch_source, run_ctags};
use super::exec::{OutputMode, exec_command};
use super::recipe::prepare_command_for_recipe;
use crate::properties::PropertyMap;
use crate::sketch::{quote_cpp_string, write_if_different};
use anyhow::{Context as _, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

const PREPROC_RECIPE: &str = "recipe.preproc.macros";
const PREPROC_FLAGS: &str = "-w -x c++ -E -CC";

/// Insert `prototypes` into `source` before `first_function_line` (a line
/// of the main sketch file, shifted by `line_offset` merged lines). Each
/// prototype is tagged with a `#line` pointing at its definition and a
/// final `#line` restores numbering for the code that follows.
///
/// Without declarable prototypes, or when the line lies past the end of
/// the source, the source is returned untouched.
pub fn prototypes_adder(
    source: &str,
    prototypes: &[Prototype],
    first_function_line: usize,
    line_offset: usize,
) -> String {
    let Some(section) = compose_prototype_section(first_function_line, prototypes) else {
        return source.to_string();
    };
    let source = source.replace("\r\n", "\n").replace('\r', "\n");
    let rows: Vec<&str> = source.split('\n').collect();
    let insertion_line = (first_function_line + line_offset).saturating_sub(1);
    if first_function_line >= rows.len() || insertion_line >= rows.len() {
        debug!("First function at line {first_function_line} is outside of the sketch");
        return source;
    }

    let position = match insertion_line {
        0 => 0,
        n => rows[..n].join("\n").len() + 1,
    };
    format!("{}{section}{}", &source[..position], &source[position..])
}

fn compose_prototype_section(line: usize, prototypes: &[Prototype]) -> Option<String> {
    let mut rows = Vec::new();
    for prototype in prototypes {
        // default arguments may only be given once
        if prototype.prototype.contains('=') {
            continue;
        }
        rows.push(format!("#line {} {}", prototype.line, quote_cpp_string(&prototype.file)));
        if prototype.modifiers.is_empty() {
            rows.push(prototype.prototype.clone());
        } else {
            rows.push(format!("{} {}", prototype.modifiers, prototype.prototype));
        }
    }
    if rows.is_empty() {
        return None;
    }
    let mut section = rows.join("\n");
    section.push_str(&format!("\n#line {line} {}\n", quote_cpp_string(&prototypes[0].file)));
    Some(section)
}

/// Run `recipe.preproc.macros` (or the C++ compile recipe turned into one)
/// over `source`, writing to `target`. Returns false when the platform
/// defines neither recipe.
fn run_preprocessor(ctx: &Context, source: &Path, target: &Path) -> Result<bool> {
    let mut properties = PropertyMap::new();
    properties.set("preproc.macros.flags", PREPROC_FLAGS);
    properties.merge(&ctx.build_properties);
    properties.set("build.library_discovery_phase", "1");
    properties.set_path("source_file", source);
    properties.set_path("preprocessed_file_path", target);
    let mut folders = ctx.include_folders.clone();
    folders.push(ctx.sketch_build_path.clone());
    properties.set("includes", include_args(&folders).join(" "));

    if properties.get(PREPROC_RECIPE).is_empty() {
        let compile = properties.get("recipe.cpp.o.pattern");
        if compile.is_empty() {
            return Ok(false);
        }
        let derived = compile
            .replacen("{compiler.cpp.flags}", "{compiler.cpp.flags} {preproc.macros.flags}", 1)
            .replacen("{object_file}", "{preprocessed_file_path}", 1);
        properties.set(PREPROC_RECIPE, derived);
    }

    let mut command = prepare_command_for_recipe(&properties, PREPROC_RECIPE, true, &ctx.tool_env)?;
    // a dependency file next to the preprocessed output is useless
    command.args.retain(|arg| arg != "-MMD");
    match exec_command(ctx, &command, OutputMode::Capture, OutputMode::Capture) {
        Ok(_) => Ok(true),
        Err(e) if ctx.only_update_compilation_database => {
            ctx.console
                .warn(format!("Sketch preprocessing failed, prototypes are not generated: {e:#}"));
            fs::write(target, "").with_context(|| format!("Failed to write {}", target.display()))?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

/// Generate prototypes for the merged sketch and write the result to
/// `<sketch build path>/<main file>.cpp`.
pub fn preprocess_sketch(ctx: &mut Context) -> Result<()> {
    let sketch = ctx.sketch()?;
    let main_file = sketch.main_file.clone();
    let output = ctx.sketch_build_path.join(format!("{}.cpp", sketch.main_file_name()));
    let mut sketch_files = vec![main_file.to_string_lossy().to_string()];
    sketch_files.extend(sketch.other_sketch_files.iter().map(|f| f.to_string_lossy().to_string()));

    let preproc_dir = ctx.build_path.join("preproc");
    fs::create_dir_all(&preproc_dir)
        .with_context(|| format!("Failed to create {}", preproc_dir.display()))?;
    let merged = preproc_dir.join("sketch_merged.cpp");
    write_if_different(&merged, ctx.sketch_source.as_bytes())?;

    let ctags_target = preproc_dir.join("ctags_target_for_gcc_minus_e.cpp");
    let expanded = if run_preprocessor(ctx, &merged, &ctags_target)? {
        let bytes = fs::read(&ctags_target)
            .with_context(|| format!("Failed to read {}", ctags_target.display()))?;
        String::from_utf8_lossy(&bytes).into_owned()
    } else {
        ctx.sketch_source.clone()
    };
    fs::write(&ctags_target, filter_sketch_source(&expanded, &sketch_files))
        .with_context(|| format!("Failed to write {}", ctags_target.display()))?;

    let source = match run_ctags(ctx, &ctags_target)? {
        Some(tags) => {
            let (prototypes, line) = CtagsParser::parse(&tags, &main_file);
            debug!("Adding {} prototypes before line {line}", prototypes.len());
            prototypes_adder(&ctx.sketch_source, &prototypes, line, ctx.line_offset)
        }
        None => {
            warn!("ctags is not available for this board, function prototypes are not generated");
            ctx.sketch_source.clone()
        }
    };

    write_if_different(&output, source.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "/sketch/Bridge.ino";

    fn proto(text: &str, line: usize) -> Prototype {
        Prototype {
            function_name: String::new(),
            file: FILE.into(),
            prototype: text.into(),
            modifiers: String::new(),
            line,
        }
    }

    fn merged(body: &[&str]) -> String {
        let mut source = format!("#include <Arduino.h>\n#line 1 \"{FILE}\"\n");
        for line in body {
            source.push_str(line);
            source.push('\n');
        }
        source
    }

    #[test]
    fn test_prototypes_inserted_before_first_function() {
        let source = merged(&["int led = 13;", "", "void setup() {", "}", "void loop() {", "  blink();", "}", "void blink() {}"]);
        let prototypes = vec![proto("void setup();", 3), proto("void loop();", 5), proto("void blink();", 8)];
        let out = prototypes_adder(&source, &prototypes, 3, 2);
        let expected = format!(
            "#include <Arduino.h>\n#line 1 \"{FILE}\"\nint led = 13;\n\n\
             #line 3 \"{FILE}\"\nvoid setup();\n#line 5 \"{FILE}\"\nvoid loop();\n#line 8 \"{FILE}\"\nvoid blink();\n#line 3 \"{FILE}\"\n\
             void setup() {{\n}}\nvoid loop() {{\n  blink();\n}}\nvoid blink() {{}}\n"
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn test_modifiers_and_default_arguments() {
        let source = merged(&["static int next() { return 1; }", "void wait(int ms = 10) {}"]);
        let mut stat = proto("int next();", 1);
        stat.modifiers = "static".into();
        let out = prototypes_adder(&source, &[stat, proto("void wait(int ms = 10);", 2)], 1, 2);
        assert!(out.contains(&format!("#line 1 \"{FILE}\"\nstatic int next();\n#line 1 \"{FILE}\"\nstatic int next() {{")));
        assert!(!out.contains("void wait(int ms = 10);"));
    }

    #[test]
    fn test_no_prototypes_is_identity() {
        let source = merged(&["int x;", "", "// nothing to see\r"]);
        assert_eq!(prototypes_adder(&source, &[], 0, 2), source);
        assert_eq!(prototypes_adder(&source, &[], 3, 2), source);
    }

    #[test]
    fn test_only_default_argument_prototypes_is_identity() {
        let source = merged(&["void wait(int ms = 10) {}", "void setup() { wait(); }"]);
        let out = prototypes_adder(&source, &[proto("void wait(int ms = 10);", 1)], 1, 2);
        assert_eq!(out, source);
    }

    #[test]
    fn test_line_outside_source_is_identity() {
        let source = merged(&["void setup() {}"]);
        let out = prototypes_adder(&source, &[proto("void setup();", 40)], 40, 2);
        assert_eq!(out, source);
    }

    #[test]
    fn test_crlf_is_normalized() {
        let source = "#include <Arduino.h>\r\n#line 1 \"/sketch/Bridge.ino\"\r\nvoid setup() {}\r\n";
        let out = prototypes_adder(source, &[proto("void setup();", 1)], 1, 2);
        assert!(!out.contains('\r'));
        assert!(out.contains("void setup();\n#line 1 \"/sketch/Bridge.ino\"\nvoid setup() {}"));
    }
}
