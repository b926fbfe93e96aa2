//! Ordered build properties and `{key}` expansion.
//!
//! Platform vendors describe their toolchain in `key=value` text files
//! (`platform.txt`, `boards.txt`, ...). Values may reference other keys with
//! `{key}` placeholders, which are expanded lazily when a recipe is turned
//! into a command line.

use crate::error::BuildError;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Upper bound on nested expansion passes; cyclic definitions stop here.
const MAX_EXPANSION_PASSES: usize = 10;

static UNEXPANDED_PROPERTY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^{}]*\}").expect("static regex"));

/// Insertion-ordered `key -> value` map. Setting an existing key keeps its
/// original position and overwrites the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyMap {
    order: Vec<String>,
    values: HashMap<String, String>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a property file, applying host OS overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read properties from {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    /// Load a property file if it exists, otherwise return an empty map.
    pub fn load_if_exists(path: &Path) -> Result<Self> {
        if path.is_file() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    pub fn parse(text: &str) -> Self {
        Self::parse_for_os(text, host_os())
    }

    /// Parse `key=value` lines. Keys suffixed with `.<os>` replace the plain
    /// key when `<os>` matches `os`; suffixes for other systems are kept
    /// verbatim but never promoted.
    pub fn parse_for_os(text: &str, os: &str) -> Self {
        let mut map = Self::new();
        let mut overrides = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            map.set(key, value);
            if let Some(base) = key.strip_suffix(&format!(".{os}")) {
                overrides.push((base.to_string(), value.to_string()));
            }
        }
        for (key, value) in overrides {
            map.set(key, value);
        }
        map
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if !self.values.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.values.insert(key, value.into());
    }

    pub fn set_path(&mut self, key: impl Into<String>, path: &Path) {
        self.set(key, path.to_string_lossy());
    }

    /// Value for `key`, or the empty string when unset.
    pub fn get(&self, key: &str) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn get_opt(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        match self.get(key) {
            "" => None,
            value => Some(PathBuf::from(value)),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let removed = self.values.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order
            .iter()
            .map(|k| (k.as_str(), self.values[k].as_str()))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Copy every entry of `other` into `self`, later values winning.
    pub fn merge(&mut self, other: &PropertyMap) {
        for (key, value) in other.iter() {
            self.set(key, value);
        }
    }

    /// Entries under `prefix.`, with the prefix stripped.
    pub fn sub_tree(&self, prefix: &str) -> PropertyMap {
        let dotted = format!("{prefix}.");
        let mut tree = PropertyMap::new();
        for (key, value) in self.iter() {
            if let Some(rest) = key.strip_prefix(&dotted) {
                tree.set(rest, value);
            }
        }
        tree
    }

    /// Distinct first dot-separated segments, in insertion order.
    pub fn first_level_keys(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for key in self.keys() {
            let first = key.split('.').next().unwrap_or(key);
            if !seen.iter().any(|s| s == first) {
                seen.push(first.to_string());
            }
        }
        seen
    }

    /// Replace `{key}` tokens with their values, recursively. Unknown tokens
    /// are left untouched.
    pub fn expand(&self, template: &str) -> String {
        let mut current = template.to_string();
        for _ in 0..MAX_EXPANSION_PASSES {
            let next = self.expand_once(&current);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    fn expand_once(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let name = &after[..close];
                    if !name.contains('{')
                        && let Some(value) = self.values.get(name)
                    {
                        out.push_str(value);
                        rest = &after[close + 1..];
                    } else {
                        out.push('{');
                        rest = after;
                    }
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PropertyMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = PropertyMap::new();
        for (k, v) in iter {
            map.set(k, v);
        }
        map
    }
}

/// Strip every `{...}` token still present after expansion.
pub fn delete_unexpanded(text: &str) -> String {
    UNEXPANDED_PROPERTY.replace_all(text, "").into_owned()
}

/// Split a command line on spaces. A word starting with one of
/// `quote_chars` opens a quoted argument closed by the first word ending
/// with the same char; the quotes themselves are removed.
pub fn split_quoted(
    src: &str,
    quote_chars: &str,
    accept_empty: bool,
) -> Result<Vec<String>, BuildError> {
    let mut result = Vec::new();
    let mut quote: Option<char> = None;
    let mut quoted = String::new();

    for word in src.split(' ') {
        let mut word = word;
        match quote {
            None => {
                let Some(first) = word.chars().next() else {
                    continue;
                };
                if !quote_chars.contains(first) {
                    result.push(word.to_string());
                    continue;
                }
                quote = Some(first);
                word = &word[first.len_utf8()..];
            }
            Some(_) => quoted.push(' '),
        }

        quoted.push_str(word);
        if let Some(q) = quote
            && quoted.ends_with(q)
        {
            quoted.pop();
            if !quoted.is_empty() || accept_empty {
                result.push(std::mem::take(&mut quoted));
            }
            quoted.clear();
            quote = None;
        }
    }

    if let Some(q) = quote {
        return Err(BuildError::InvalidQuoting {
            quote: q,
            text: src.to_string(),
        });
    }
    Ok(result)
}

/// Name of the running OS as used in property file suffixes.
pub fn host_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "macosx",
        "windows" => "windows",
        "freebsd" => "freebsd",
        _ => "linux",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> PropertyMap {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_expand_nested() {
        let map = props(&[
            ("compiler.path", "{runtime.tools.gcc.path}/bin/"),
            ("runtime.tools.gcc.path", "/opt/gcc"),
            ("recipe", "\"{compiler.path}gcc\" -c"),
        ]);
        assert_eq!(map.expand("{recipe}"), "\"/opt/gcc/bin/gcc\" -c");
    }

    #[test]
    fn test_expand_keeps_unknown_tokens() {
        let map = props(&[("a", "1")]);
        assert_eq!(map.expand("{a} {b} {"), "1 {b} {");
        assert_eq!(delete_unexpanded(&map.expand("{a} {b}")), "1 ");
    }

    #[test]
    fn test_expand_cycle_terminates() {
        let map = props(&[("a", "{b}"), ("b", "{a}")]);
        let out = map.expand("{a}");
        assert!(out == "{a}" || out == "{b}");
    }

    #[test]
    fn test_expand_handles_brace_in_value() {
        let map = props(&[("a", "x{"), ("b", "y")]);
        assert_eq!(map.expand("{a}{b}"), "x{y");
    }

    #[test]
    fn test_parse_skips_comments_and_trims() {
        let map = PropertyMap::parse_for_os(
            "# comment\n\n name = Uno \nbuild.mcu=atmega328p\nbad line\n",
            "linux",
        );
        assert_eq!(map.get("name"), "Uno");
        assert_eq!(map.get("build.mcu"), "atmega328p");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_parse_os_override() {
        let text = "tool.cmd.linux=gcc-linux\ntool.cmd=gcc\ntool.cmd.windows=gcc.exe\n";
        let linux = PropertyMap::parse_for_os(text, "linux");
        assert_eq!(linux.get("tool.cmd"), "gcc-linux");
        let windows = PropertyMap::parse_for_os(text, "windows");
        assert_eq!(windows.get("tool.cmd"), "gcc.exe");
    }

    #[test]
    fn test_set_keeps_insertion_order() {
        let mut map = props(&[("b", "1"), ("a", "2")]);
        map.set("b", "3");
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(map.get("b"), "3");
        assert_eq!(map.get("missing"), "");
    }

    #[test]
    fn test_sub_tree_and_first_level() {
        let map = props(&[
            ("uno.name", "Arduino Uno"),
            ("uno.build.mcu", "atmega328p"),
            ("mega.name", "Arduino Mega"),
        ]);
        assert_eq!(map.first_level_keys(), vec!["uno", "mega"]);
        let uno = map.sub_tree("uno");
        assert_eq!(uno.get("build.mcu"), "atmega328p");
        assert_eq!(uno.len(), 2);
    }

    #[test]
    fn test_split_quoted() {
        let parts = split_quoted(
            "\"/opt/my tools/gcc\" -c  '-DNAME=\"x\"' -DPLAIN=\"y\" \"-I/a b\"",
            "\"'",
            false,
        )
        .unwrap();
        assert_eq!(
            parts,
            vec![
                "/opt/my tools/gcc",
                "-c",
                "-DNAME=\"x\"",
                "-DPLAIN=\"y\"",
                "-I/a b"
            ]
        );
    }

    #[test]
    fn test_split_quoted_empty_args() {
        assert_eq!(
            split_quoted("a \"\" b", "\"", false).unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(
            split_quoted("a \"\" b", "\"", true).unwrap(),
            vec!["a", "", "b"]
        );
    }

    #[test]
    fn test_split_quoted_unclosed() {
        let err = split_quoted("gcc \"unterminated arg", "\"", false).unwrap_err();
        assert!(matches!(err, BuildError::InvalidQuoting { quote: '"', .. }));
    }
}
