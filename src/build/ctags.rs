//! ctags output parsing and invocation.
//!
//! The tag extractor prints one tab separated record per symbol:
//!
//! ```text
//! setup	/path/Blink.ino	/^void setup() {$/;"	kind:function	line:3	signature:()	returntype:void
//! ```
//!
//! Only `function` and `prototype` records matter. Free functions of the
//! sketch that have no declaration yet become [`Prototype`]s.

use super::context::Context;
use super::exec::{OutputMode, RecipeCommand, exec_command};
use crate::error::BuildError;
use crate::properties::{PropertyMap, split_quoted};
use anyhow::Result;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

const KIND_PROTOTYPE: &str = "prototype";
const KIND_FUNCTION: &str = "function";
const TEMPLATE: &str = "template";
const STATIC: &str = "static";

/// Lines read after a declaration whose argument list is cut short.
const MAX_CONTINUATION_LINES: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CTag {
    pub function_name: String,
    pub kind: String,
    pub line: usize,
    pub code: String,
    pub class: String,
    pub struct_name: String,
    pub namespace: String,
    pub filename: String,
    pub typeref: String,
    pub signature: String,
    pub prototype: String,
    pub prototype_modifiers: String,
    pub skip: bool,
}

/// A forward declaration to add to the sketch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prototype {
    pub function_name: String,
    pub file: String,
    pub prototype: String,
    pub modifiers: String,
    pub line: usize,
}

/// Parse one ctags record.
pub fn parse_tag(row: &str) -> CTag {
    let mut parts = row.split('\t');
    let mut tag = CTag {
        function_name: parts.next().unwrap_or_default().to_string(),
        // ctags keeps gcc's escaping of backslashes in line markers
        filename: parts.next().unwrap_or_default().replace("\\\\", "\\"),
        ..CTag::default()
    };

    let mut return_type = "";
    for part in parts {
        let Some((field, value)) = part.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match field {
            "kind" => tag.kind = value.to_string(),
            "line" => tag.line = value.parse().unwrap_or_default(),
            "typeref" => tag.typeref = value.to_string(),
            "signature" => tag.signature = value.to_string(),
            "returntype" => return_type = value,
            "class" => tag.class = value.to_string(),
            "struct" => tag.struct_name = value.to_string(),
            "namespace" => tag.namespace = value.to_string(),
            _ => {}
        }
    }
    tag.prototype = format!("{return_type} {}{};", tag.function_name, tag.signature);

    if let Some(start) = row.find("/^")
        && let Some(end) = row.find("$/;")
        && start + 2 <= end
    {
        tag.code = row[start + 2..end].to_string();
    }
    tag
}

fn is_known_kind(tag: &CTag) -> bool {
    tag.kind == KIND_PROTOTYPE || tag.kind == KIND_FUNCTION
}

/// Members of classes, structs and namespaces never get prototypes.
fn is_handled(tag: &CTag) -> bool {
    tag.class.is_empty() && tag.struct_name.is_empty() && tag.namespace.is_empty()
}

#[derive(Debug, Default)]
pub struct CtagsParser {
    tags: Vec<CTag>,
    main_file: String,
}

impl CtagsParser {
    /// Parse ctags output for a sketch whose main file is `main_file`.
    /// Returns the prototypes to add and the line before which they go
    /// (0 when no function was found).
    pub fn parse(output: &str, main_file: &Path) -> (Vec<Prototype>, usize) {
        let mut parser = Self {
            tags: output
                .lines()
                .filter(|row| !row.trim().is_empty())
                .map(parse_tag)
                .collect(),
            main_file: main_file.to_string_lossy().to_string(),
        };

        parser.skip_tags_where(|tag| !is_known_kind(tag));
        parser.skip_tags_where(|tag| !is_handled(tag));
        parser.add_prototypes();
        parser.remove_defined_prototypes();
        parser.skip_duplicates();
        parser.skip_tags_where_mut(|tag| !prototype_matches_code(tag));

        let line = parser.find_line_where_to_insert_prototypes();
        (parser.to_prototypes(), line)
    }

    fn skip_tags_where(&mut self, skip: impl Fn(&CTag) -> bool) {
        for tag in self.tags.iter_mut().filter(|t| !t.skip) {
            tag.skip = skip(tag);
        }
    }

    fn skip_tags_where_mut(&mut self, mut skip: impl FnMut(&mut CTag) -> bool) {
        for tag in self.tags.iter_mut().filter(|t| !t.skip) {
            tag.skip = skip(tag);
        }
    }

    fn add_prototypes(&mut self) {
        for tag in self.tags.iter_mut().filter(|t| !t.skip) {
            add_prototype(tag);
        }
    }

    /// A function that already has a `prototype` record needs nothing.
    fn remove_defined_prototypes(&mut self) {
        let declared: HashSet<String> = self
            .tags
            .iter()
            .filter(|t| t.kind == KIND_PROTOTYPE)
            .map(|t| t.prototype.clone())
            .collect();
        for tag in &mut self.tags {
            if declared.contains(&tag.prototype) {
                debug!("{} is already declared", tag.function_name);
                tag.skip = true;
            }
        }
    }

    fn skip_duplicates(&mut self) {
        let mut seen = HashSet::new();
        for tag in &mut self.tags {
            if tag.skip || !seen.insert(tag.prototype.clone()) {
                tag.skip = true;
            }
        }
    }

    fn find_line_where_to_insert_prototypes(&self) -> usize {
        let first_function = self.first_function_at_line();
        let first_pointer = self.first_function_pointer_used_as_argument();
        match (first_function, first_pointer) {
            (Some(a), Some(b)) => a.min(b),
            (Some(line), None) | (None, Some(line)) => line,
            (None, None) => 0,
        }
    }

    fn first_function_at_line(&self) -> Option<usize> {
        self.tags
            .iter()
            .find(|t| {
                is_known_kind(t) && is_handled(t) && t.kind == KIND_FUNCTION && t.filename == self.main_file
            })
            .map(|t| t.line)
    }

    /// Line of the first record passing a sketch function by address, like
    /// `attachInterrupt(0, &isr, RISING)`.
    fn first_function_pointer_used_as_argument(&self) -> Option<usize> {
        let functions: Vec<&CTag> = self
            .tags
            .iter()
            .filter(|t| t.kind == KIND_FUNCTION && !t.skip)
            .collect();
        self.tags
            .iter()
            .find(|tag| {
                functions.iter().any(|f| {
                    tag.line != f.line
                        && (tag.code.contains(&format!("&{}", f.function_name))
                            || tag.code.trim().contains(&format!("({}", f.function_name)))
                })
            })
            .map(|t| t.line)
    }

    fn to_prototypes(&self) -> Vec<Prototype> {
        self.tags
            .iter()
            .filter(|t| !t.skip && !t.prototype.trim().is_empty())
            .map(|t| Prototype {
                function_name: t.function_name.clone(),
                file: t.filename.clone(),
                prototype: t.prototype.clone(),
                modifiers: t.prototype_modifiers.clone(),
                line: t.line,
            })
            .collect()
    }
}

fn add_prototype(tag: &mut CTag) {
    if tag.prototype.starts_with(TEMPLATE) {
        let code = if tag.code.starts_with(TEMPLATE) {
            tag.code.clone()
        } else {
            // the template header sits on an earlier line
            find_template_multiline(tag)
        };
        tag.prototype = format!("{};", declaration_head(&code));
        return;
    }

    tag.prototype_modifiers = if tag.code.contains(&format!("{STATIC} ")) {
        STATIC.to_string()
    } else {
        String::new()
    };
}

/// Code up to the opening brace, or up to the last closing parenthesis.
fn declaration_head(code: &str) -> String {
    let head = match code.find('{') {
        Some(brace) => &code[..brace],
        None => match code.rfind(')') {
            Some(paren) => &code[..=paren],
            None => code,
        },
    };
    head.trim().to_string()
}

fn find_template_multiline(tag: &CTag) -> String {
    let Some(lines) = read_lines(&tag.filename) else {
        return tag.code.clone();
    };
    let mut code = tag.code.trim().to_string();
    let mut in_comment = false;
    let mut index = tag.line.saturating_sub(1).min(lines.len());
    while index > 0 && !code.contains(TEMPLATE) {
        index -= 1;
        let (text, still_in_comment) = remove_comments(&lines[index], in_comment);
        in_comment = still_in_comment;
        code = format!("{} {code}", text.trim()).trim().to_string();
    }
    code
}

/// Whether the declaration ctags saw really is the prototype computed for
/// it. Declarations spread over several lines are re-read from the source
/// file; when the prototype starts on an earlier line, `tag.line` moves
/// there.
fn prototype_matches_code(tag: &mut CTag) -> bool {
    let prototype = remove_spaces_and_tabs(&tag.prototype);
    let prototype = prototype.trim_end_matches(';');
    let mut code = remove_spaces_and_tabs(&tag.code);

    if !code.contains(')') {
        code = read_following_lines(tag, code);
    }
    if code.contains(prototype) {
        return true;
    }

    let head = remove_everything_after_closing_round_bracket(&code);
    let Some(missing) = prototype.find(head.as_str()).filter(|n| *n > 0) else {
        return false;
    };
    let (code, line) = read_previous_characters(tag, head, missing);
    if code.contains(prototype) {
        tag.line = line;
        return true;
    }
    false
}

fn read_following_lines(tag: &CTag, mut code: String) -> String {
    let Some(lines) = read_lines(&tag.filename) else {
        return code;
    };
    let mut in_comment = false;
    for line in lines.iter().skip(tag.line).take(MAX_CONTINUATION_LINES) {
        let (text, still_in_comment) = remove_comments_forward(line, in_comment);
        in_comment = still_in_comment;
        code.push_str(&remove_spaces_and_tabs(&text));
        if code.contains(')') {
            break;
        }
    }
    code
}

/// Prepend earlier source lines to `code` until `missing` more
/// non-blank characters were gathered. Returns the code and the 1-based
/// line it now starts on.
fn read_previous_characters(tag: &CTag, mut code: String, missing: usize) -> (String, usize) {
    let Some(lines) = read_lines(&tag.filename) else {
        return (code, tag.line);
    };
    let expected = code.len() + missing;
    let mut in_comment = false;
    let mut index = tag.line.saturating_sub(1).min(lines.len());
    while index > 0 && code.len() < expected {
        index -= 1;
        let (text, still_in_comment) = remove_comments(&lines[index], in_comment);
        in_comment = still_in_comment;
        code = remove_spaces_and_tabs(&format!("{text}{code}"));
    }
    (code, index + 1)
}

fn read_lines(file: &str) -> Option<Vec<String>> {
    let text = fs::read(file).ok()?;
    Some(
        String::from_utf8_lossy(&text)
            .lines()
            .map(str::to_string)
            .collect(),
    )
}

fn remove_spaces_and_tabs(s: &str) -> String {
    s.chars().filter(|c| *c != ' ' && *c != '\t').collect()
}

fn remove_everything_after_closing_round_bracket(s: &str) -> String {
    match s.rfind(')') {
        Some(i) => s[..=i].to_string(),
        None => s.to_string(),
    }
}

/// Strip comments from a line while walking the file backwards.
/// `in_comment` means a block comment closing further down is still open.
fn remove_comments(text: &str, in_comment: bool) -> (String, bool) {
    let text = match text.find("//") {
        Some(i) => &text[..i],
        None => text,
    };
    if in_comment {
        return match text.find("/*") {
            Some(i) => (text[..i].to_string(), false),
            None => (String::new(), true),
        };
    }
    match (text.find("/*"), text.find("*/")) {
        (Some(open), Some(close)) if open < close => {
            (format!("{}{}", &text[..open], &text[close + 2..]), false)
        }
        (_, Some(close)) => (text[close + 2..].to_string(), true),
        _ => (text.to_string(), false),
    }
}

/// Same as [`remove_comments`] walking forwards.
fn remove_comments_forward(text: &str, in_comment: bool) -> (String, bool) {
    if in_comment {
        return match text.find("*/") {
            Some(i) => remove_comments_forward(&text[i + 2..], false),
            None => (String::new(), true),
        };
    }
    let text = match text.find("//") {
        Some(i) => &text[..i],
        None => text,
    };
    match text.find("/*") {
        Some(open) => {
            let (rest, open_comment) = remove_comments_forward(&text[open + 2..], true);
            (format!("{}{rest}", &text[..open]), open_comment)
        }
        None => (text.to_string(), false),
    }
}

/// Parse a C string literal at the start of `line`. Returns the unquoted
/// string and the remaining text.
pub fn parse_cpp_string(line: &str) -> Option<(String, &str)> {
    let mut chars = line.char_indices();
    if chars.next()?.1 != '"' {
        return None;
    }
    let mut out = String::new();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => match chars.next()? {
                (_, e @ ('\\' | '"')) => out.push(e),
                _ => return None,
            },
            '"' => return Some((out, &line[i + 1..])),
            _ => out.push(c),
        }
    }
    None
}

/// File named by a `#line 12 "file"` or `# 12 "file" 3` marker.
pub fn parse_line_marker(line: &str) -> Option<String> {
    let mut split = line.splitn(3, ' ');
    let hash = split.next()?;
    let number = split.next()?;
    let rest = split.next()?;
    if !hash.starts_with('#') || number.parse::<u64>().is_err() {
        return None;
    }
    let (file, tail) = parse_cpp_string(rest)?;
    (tail.is_empty() || tail.starts_with(' ')).then_some(file)
}

/// Keep only the lines of preprocessor output that come from one of
/// `sketch_files`, line markers included.
pub fn filter_sketch_source(source: &str, sketch_files: &[String]) -> String {
    let mut filtered = String::new();
    let mut in_sketch = false;
    for line in source.lines() {
        if let Some(file) = parse_line_marker(line) {
            in_sketch = sketch_files.iter().any(|f| *f == file);
        }
        if in_sketch {
            filtered.push_str(line);
            filtered.push('\n');
        }
    }
    filtered
}

/// Properties for the ctags tool: defaults, then the build properties,
/// then everything under `tools.ctags.`.
pub fn ctags_properties(build_properties: &PropertyMap, source_file: &Path) -> PropertyMap {
    let mut properties = PropertyMap::new();
    properties.set("tools.ctags.path", "{runtime.tools.ctags.path}");
    properties.set("tools.ctags.cmd.path", "{path}/ctags");
    properties.set(
        "tools.ctags.pattern",
        "\"{cmd.path}\" -u --language-force=c++ -f - --c++-kinds=svpf --fields=KSTtzns --line-directives \"{source_file}\"",
    );
    properties.merge(build_properties);
    let tool = properties.sub_tree("tools.ctags");
    properties.merge(&tool);
    properties.set_path("source_file", source_file);
    properties
}

/// Run ctags over `source_file`. `Ok(None)` when no ctags tool is
/// installed for this build.
pub fn run_ctags(ctx: &Context, source_file: &Path) -> Result<Option<String>> {
    let properties = ctags_properties(&ctx.build_properties, source_file);
    let pattern = properties.get("pattern");
    if pattern.is_empty() {
        return Err(BuildError::MissingRecipe {
            recipe: "ctags".into(),
        }
        .into());
    }
    let command_line = properties.expand(pattern);
    if command_line.contains("{runtime.tools.ctags.path}") {
        return Ok(None);
    }

    let mut parts = split_quoted(&command_line, "\"'", false)?.into_iter();
    let Some(program) = parts.next() else {
        return Err(BuildError::MissingRecipe {
            recipe: "ctags".into(),
        }
        .into());
    };
    let command = RecipeCommand {
        program,
        args: parts.collect(),
        env: ctx.tool_env.clone(),
        cwd: None,
    };
    let output = exec_command(ctx, &command, OutputMode::Capture, OutputMode::Capture).map_err(|e| {
        BuildError::CtagsFailed {
            message: format!("{e:#}"),
        }
    })?;
    Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
}
