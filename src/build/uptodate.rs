//! Deciding whether an object file can be reused.
//!
//! The compiler writes a make-style depfile next to every object:
//!
//! ```text
//! /build/sketch/Blink.ino.cpp.o: \
//!  /build/sketch/Blink.ino.cpp \
//!  /hardware/avr/cores/arduino/Arduino.h
//! ```
//!
//! The object is fresh when neither the source nor any listed header is
//! newer than it.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

/// Modification time, `None` when the file does not exist.
fn mtime(path: &Path) -> Result<Option<SystemTime>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(
            meta.modified()
                .with_context(|| format!("Failed to read mtime of {}", path.display()))?,
        )),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    }
}

/// `Ok(false)` means the object must be rebuilt. I/O errors other than a
/// missing file are returned as errors.
pub fn obj_file_is_up_to_date(
    source: &Path,
    object: Option<&Path>,
    depfile: Option<&Path>,
) -> Result<bool> {
    let (Some(object), Some(depfile)) = (object, depfile) else {
        return Ok(false);
    };
    debug!("Checking previous results for {}", source.display());

    let source_time = fs::metadata(source)
        .and_then(|m| m.modified())
        .with_context(|| format!("Failed to stat {}", source.display()))?;

    let Some(object_time) = mtime(object)? else {
        debug!("Not found: {}", object.display());
        return Ok(false);
    };
    let Some(depfile_time) = mtime(depfile)? else {
        debug!("Not found: {}", depfile.display());
        return Ok(false);
    };

    if source_time > object_time || source_time > depfile_time {
        debug!("{} newer than {}", source.display(), object.display());
        return Ok(false);
    }

    let text = fs::read_to_string(depfile)
        .with_context(|| format!("Failed to read {}", depfile.display()))?;
    let rows: Vec<String> = text
        .lines()
        .map(|row| unescape_dep(remove_ending_backslash(row).trim()))
        .filter(|row| !row.is_empty())
        .collect();

    let Some(first) = rows.first() else {
        return Ok(true);
    };
    let Some(declared_object) = first.strip_suffix(':') else {
        debug!("Depfile is malformed: {}", depfile.display());
        return Ok(false);
    };
    if Path::new(declared_object) != object {
        debug!("Depfile is about a different object: {}", declared_object);
        return Ok(false);
    }

    let Some(declared_source) = rows.get(1) else {
        return Ok(true);
    };
    if Path::new(declared_source) != source {
        debug!("Depfile is about a different source: {}", declared_source);
        return Ok(false);
    }

    for row in &rows[2..] {
        match fs::metadata(row).and_then(|m| m.modified()) {
            Ok(time) if time > object_time => {
                debug!("{} newer than {}", row, object.display());
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Failed to stat dependency {}: {}", row, e);
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn remove_ending_backslash(row: &str) -> &str {
    row.strip_suffix('\\').unwrap_or(row)
}

/// Undo make escaping in a depfile row.
pub fn unescape_dep(row: &str) -> String {
    row.replace("\\ ", " ")
        .replace("\\\t", "\t")
        .replace("\\#", "#")
        .replace("$$", "$")
        .replace("\\\\", "\\")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        source: std::path::PathBuf,
        header: std::path::PathBuf,
        object: std::path::PathBuf,
        depfile: std::path::PathBuf,
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("sketch.cpp");
        let header = tmp.path().join("my header.h");
        let object = tmp.path().join("sketch.cpp.o");
        let depfile = tmp.path().join("sketch.cpp.d");
        fs::write(&source, "int x;").unwrap();
        fs::write(&header, "").unwrap();
        fs::write(&object, "obj").unwrap();
        fs::write(
            &depfile,
            format!(
                "{}: \\\n {} \\\n {}\n",
                object.display(),
                source.display(),
                header.display().to_string().replace(' ', "\\ ")
            ),
        )
        .unwrap();
        let base = SystemTime::now() - Duration::from_secs(100);
        set_mtime(&source, base);
        set_mtime(&header, base);
        set_mtime(&object, base + Duration::from_secs(10));
        set_mtime(&depfile, base + Duration::from_secs(10));
        Fixture {
            _tmp: tmp,
            source,
            header,
            object,
            depfile,
        }
    }

    fn check(f: &Fixture) -> bool {
        obj_file_is_up_to_date(&f.source, Some(&f.object), Some(&f.depfile)).unwrap()
    }

    #[test]
    fn test_fresh_object() {
        let f = fixture();
        assert!(check(&f));
    }

    #[test]
    fn test_missing_paths() {
        let f = fixture();
        assert!(!obj_file_is_up_to_date(&f.source, None, Some(&f.depfile)).unwrap());
        assert!(!obj_file_is_up_to_date(&f.source, Some(&f.object), None).unwrap());
        fs::remove_file(&f.object).unwrap();
        assert!(!check(&f));
    }

    #[test]
    fn test_missing_depfile() {
        let f = fixture();
        fs::remove_file(&f.depfile).unwrap();
        assert!(!check(&f));
    }

    #[test]
    fn test_missing_source_is_error() {
        let f = fixture();
        fs::remove_file(&f.source).unwrap();
        assert!(obj_file_is_up_to_date(&f.source, Some(&f.object), Some(&f.depfile)).is_err());
    }

    #[test]
    fn test_source_newer_than_object_or_depfile() {
        let f = fixture();
        set_mtime(&f.source, SystemTime::now());
        assert!(!check(&f));

        let f = fixture();
        set_mtime(&f.depfile, SystemTime::now() - Duration::from_secs(200));
        assert!(!check(&f));
    }

    #[test]
    fn test_header_newer_or_missing() {
        let f = fixture();
        set_mtime(&f.header, SystemTime::now());
        assert!(!check(&f));

        let f = fixture();
        fs::remove_file(&f.header).unwrap();
        assert!(!check(&f));
    }

    #[test]
    fn test_malformed_or_foreign_depfile() {
        let f = fixture();
        fs::write(&f.depfile, "garbage line\n").unwrap();
        set_mtime(&f.depfile, SystemTime::now() - Duration::from_secs(50));
        assert!(!check(&f));

        fs::write(&f.depfile, format!("/other/object.o: \\\n {}\n", f.source.display())).unwrap();
        set_mtime(&f.depfile, SystemTime::now() - Duration::from_secs(50));
        assert!(!check(&f));

        fs::write(&f.depfile, format!("{}: \\\n /other/source.cpp\n", f.object.display())).unwrap();
        set_mtime(&f.depfile, SystemTime::now() - Duration::from_secs(50));
        assert!(!check(&f));
    }

    #[test]
    fn test_empty_depfile_is_fresh() {
        let f = fixture();
        fs::write(&f.depfile, "\n\n").unwrap();
        set_mtime(&f.depfile, SystemTime::now() - Duration::from_secs(50));
        assert!(check(&f));

        fs::write(&f.depfile, format!("{}: \\\n {}\n", f.object.display(), f.source.display())).unwrap();
        set_mtime(&f.depfile, SystemTime::now() - Duration::from_secs(50));
        assert!(check(&f));
    }

    #[test]
    fn test_unescape_dep() {
        assert_eq!(unescape_dep("a\\ b\\#c$$d\\\\e"), "a b#c$d\\e");
        assert_eq!(unescape_dep("tab\\\there"), "tab\there");
        let plain = "/path/with/nothing/special.h";
        assert_eq!(unescape_dep(plain), plain);
        assert_eq!(unescape_dep(&unescape_dep(plain)), plain);
    }
}
