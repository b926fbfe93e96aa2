use super::context::Context;
use crate::library::Library;
use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Who owns a compilable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Sketch,
    Library(Library),
}

impl Origin {
    pub fn source_root(&self, ctx: &Context) -> PathBuf {
        match self {
            Origin::Sketch => ctx.sketch_build_path.clone(),
            Origin::Library(lib) => lib.source_dir.clone(),
        }
    }

    pub fn build_root(&self, ctx: &Context) -> PathBuf {
        match self {
            Origin::Sketch => ctx.sketch_build_path.clone(),
            Origin::Library(lib) => ctx.libraries_build_path.join(lib.dir_name()),
        }
    }
}

/// One translation unit, relative to its origin's source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub origin: Origin,
    pub relative_path: PathBuf,
}

impl SourceFile {
    pub fn new(origin: Origin, root: &Path, path: &Path) -> Result<Self> {
        let relative_path = path
            .strip_prefix(root)
            .with_context(|| format!("{} is not inside {}", path.display(), root.display()))?
            .to_path_buf();
        Ok(Self {
            origin,
            relative_path,
        })
    }

    pub fn source_path(&self, ctx: &Context) -> PathBuf {
        self.origin.source_root(ctx).join(&self.relative_path)
    }

    pub fn object_path(&self, ctx: &Context) -> PathBuf {
        with_suffix(&self.origin.build_root(ctx).join(&self.relative_path), ".o")
    }

    pub fn depfile_path(&self, ctx: &Context) -> PathBuf {
        with_suffix(&self.origin.build_root(ctx).join(&self.relative_path), ".d")
    }
}

/// `foo.cpp` + `.o` gives `foo.cpp.o`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// A pipeline stage.
pub trait Command {
    fn run(&self, ctx: &mut Context) -> Result<()>;
}

impl<F> Command for F
where
    F: Fn(&mut Context) -> Result<()>,
{
    fn run(&self, ctx: &mut Context) -> Result<()> {
        self(ctx)
    }
}

/// Run stages in order, stopping at the first error.
pub fn run_commands(ctx: &mut Context, commands: &[(&str, Box<dyn Command>)]) -> Result<()> {
    for (name, command) in commands {
        debug!("Running stage {}", name);
        command.run(ctx).with_context(|| format!("{name} failed"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::LibraryLocation;

    #[test]
    fn test_source_file_paths() {
        let mut ctx = Context::new("/s", "a:b:c", "/b");
        ctx.sketch_build_path = PathBuf::from("/b/sketch");
        ctx.libraries_build_path = PathBuf::from("/b/libraries");

        let file = SourceFile::new(
            Origin::Sketch,
            Path::new("/b/sketch"),
            Path::new("/b/sketch/src/util.cpp"),
        )
        .unwrap();
        assert_eq!(file.object_path(&ctx), PathBuf::from("/b/sketch/src/util.cpp.o"));
        assert_eq!(file.depfile_path(&ctx), PathBuf::from("/b/sketch/src/util.cpp.d"));

        let lib = Library {
            name: "Servo".into(),
            dir: PathBuf::from("/libs/Servo"),
            source_dir: PathBuf::from("/libs/Servo/src"),
            layout: crate::library::LibraryLayout::Recursive,
            version: String::new(),
            architectures: vec!["*".into()],
            dot_a_linkage: false,
            location: LibraryLocation::User,
        };
        let file = SourceFile::new(
            Origin::Library(lib.clone()),
            &lib.source_dir,
            Path::new("/libs/Servo/src/avr/Servo.cpp"),
        )
        .unwrap();
        assert_eq!(file.source_path(&ctx), PathBuf::from("/libs/Servo/src/avr/Servo.cpp"));
        assert_eq!(
            file.object_path(&ctx),
            PathBuf::from("/b/libraries/Servo/avr/Servo.cpp.o")
        );
        assert_ne!(
            file,
            SourceFile::new(Origin::Sketch, Path::new("/libs/Servo/src"), Path::new("/libs/Servo/src/avr/Servo.cpp")).unwrap()
        );
        assert!(SourceFile::new(Origin::Sketch, Path::new("/x"), Path::new("/y/a.c")).is_err());
    }

    #[test]
    fn test_run_commands_stops_on_error() {
        let mut ctx = Context::new("/s", "a:b:c", "/b");
        let commands: Vec<(&str, Box<dyn Command>)> = vec![
            ("first", Box::new(|ctx: &mut Context| -> Result<()> {
                ctx.line_offset += 1;
                Ok(())
            })),
            ("fails", Box::new(|_: &mut Context| -> Result<()> { anyhow::bail!("boom") })),
            ("never", Box::new(|ctx: &mut Context| -> Result<()> {
                ctx.line_offset += 10;
                Ok(())
            })),
        ];
        let err = run_commands(&mut ctx, &commands).unwrap_err();
        assert_eq!(ctx.line_offset, 1);
        assert!(format!("{err:#}").contains("fails failed: boom"));
    }
}
