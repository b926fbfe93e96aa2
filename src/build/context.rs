//! Build session state shared by every stage.

use super::compdb::CompilationDatabase;
use crate::hardware::TargetBoard;
use crate::library::{Library, LibraryIndex, LibraryResolutionResult};
use crate::properties::PropertyMap;
use crate::sketch::Sketch;
use anyhow::{Result, anyhow};
use colored::*;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_WARNINGS_LEVEL: &str = "none";

/// Everything a build needs, passed explicitly to every stage.
pub struct Context {
    // Inputs
    pub hardware_dirs: Vec<PathBuf>,
    pub tools_dirs: Vec<PathBuf>,
    pub builtin_libraries_dirs: Vec<PathBuf>,
    pub other_libraries_dirs: Vec<PathBuf>,
    pub sketch_location: PathBuf,
    pub fqbn: String,
    pub build_path: PathBuf,
    /// Root of the shared core archive cache; `None` disables it.
    pub core_cache_path: Option<PathBuf>,
    pub custom_build_properties: Vec<String>,
    /// Parallel compile jobs; 0 means one per CPU.
    pub jobs: usize,
    pub warnings_level: String,
    pub verbose: bool,
    pub progress: bool,
    pub only_update_compilation_database: bool,
    pub recipe_timeout: Option<Duration>,
    /// Extra environment for every spawned tool.
    pub tool_env: Vec<(String, String)>,
    pub console: Console,

    // Filled in by the pipeline
    pub sketch: Option<Sketch>,
    pub target: Option<TargetBoard>,
    pub build_properties: PropertyMap,
    pub sketch_build_path: PathBuf,
    pub libraries_build_path: PathBuf,
    pub core_build_path: PathBuf,
    pub library_index: LibraryIndex,
    pub imported_libraries: Vec<Library>,
    pub library_resolution_results: BTreeMap<String, LibraryResolutionResult>,
    pub include_folders: Vec<PathBuf>,
    pub line_offset: usize,
    /// Merged sketch source, kept in memory until the final write.
    pub sketch_source: String,
    pub sketch_object_files: Vec<PathBuf>,
    pub library_object_files: Vec<PathBuf>,
    pub core_object_files: Vec<PathBuf>,
    pub core_archive_file: Option<PathBuf>,
    pub build_options_json: String,
    pub build_options_json_previous: String,
    pub compilation_database: Option<CompilationDatabase>,
}

impl Context {
    pub fn new(sketch_location: impl Into<PathBuf>, fqbn: impl Into<String>, build_path: impl Into<PathBuf>) -> Self {
        Self {
            hardware_dirs: Vec::new(),
            tools_dirs: Vec::new(),
            builtin_libraries_dirs: Vec::new(),
            other_libraries_dirs: Vec::new(),
            sketch_location: sketch_location.into(),
            fqbn: fqbn.into(),
            build_path: build_path.into(),
            core_cache_path: None,
            custom_build_properties: Vec::new(),
            jobs: 0,
            warnings_level: String::new(),
            verbose: false,
            progress: false,
            only_update_compilation_database: false,
            recipe_timeout: None,
            tool_env: vec![(
                "INOX_USER_AGENT".to_string(),
                format!("inox/{}", env!("CARGO_PKG_VERSION")),
            )],
            console: Console::stdio(),
            sketch: None,
            target: None,
            build_properties: PropertyMap::new(),
            sketch_build_path: PathBuf::new(),
            libraries_build_path: PathBuf::new(),
            core_build_path: PathBuf::new(),
            library_index: LibraryIndex::default(),
            imported_libraries: Vec::new(),
            library_resolution_results: BTreeMap::new(),
            include_folders: Vec::new(),
            line_offset: 0,
            sketch_source: String::new(),
            sketch_object_files: Vec::new(),
            library_object_files: Vec::new(),
            core_object_files: Vec::new(),
            core_archive_file: None,
            build_options_json: String::new(),
            build_options_json_previous: String::new(),
            compilation_database: None,
        }
    }

    pub fn sketch(&self) -> Result<&Sketch> {
        self.sketch.as_ref().ok_or_else(|| anyhow!("Sketch has not been loaded"))
    }

    pub fn target(&self) -> Result<&TargetBoard> {
        self.target
            .as_ref()
            .ok_or_else(|| anyhow!("Target board has not been resolved"))
    }

    /// Worker count for parallel compilation.
    pub fn effective_jobs(&self) -> usize {
        if self.jobs > 0 {
            self.jobs
        } else {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        }
    }
}

type Sink = Mutex<Box<dyn Write + Send>>;

/// Where user-facing output goes. Each stream is behind its own lock so
/// parallel compile jobs never interleave partial writes.
pub struct Console {
    stdout: Sink,
    stderr: Sink,
}

impl Console {
    pub fn stdio() -> Self {
        Self {
            stdout: Mutex::new(Box::new(io::stdout())),
            stderr: Mutex::new(Box::new(io::stderr())),
        }
    }

    /// A console writing into in-memory buffers.
    pub fn captured() -> (Self, SharedBuffer, SharedBuffer) {
        let out = SharedBuffer::default();
        let err = SharedBuffer::default();
        let console = Self {
            stdout: Mutex::new(Box::new(out.clone())),
            stderr: Mutex::new(Box::new(err.clone())),
        };
        (console, out, err)
    }

    pub fn write_stdout(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut out = self.stdout.lock();
        let _ = out.write_all(data);
        let _ = out.flush();
    }

    pub fn write_stderr(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut err = self.stderr.lock();
        let _ = err.write_all(data);
        let _ = err.flush();
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.write_stdout(format!("{}\n", message.as_ref()).as_bytes());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.write_stderr(format!("{} {}\n", "!".yellow(), message.as_ref()).as_bytes());
    }
}

/// Cloneable in-memory writer.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
