//! `compile_commands.json` for editors and language servers.

use super::exec::RecipeCommand;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationCommand {
    pub directory: String,
    pub arguments: Vec<String>,
    pub file: String,
}

#[derive(Debug)]
pub struct CompilationDatabase {
    file: PathBuf,
    entries: Mutex<Vec<CompilationCommand>>,
}

impl CompilationDatabase {
    pub fn new(file: PathBuf) -> Self {
        Self {
            file,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Record the command that compiles `source`.
    pub fn add(&self, source: &Path, command: &RecipeCommand) {
        let directory = match &command.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().unwrap_or_default(),
        };
        self.entries.lock().push(CompilationCommand {
            directory: directory.to_string_lossy().to_string(),
            arguments: command.argv(),
            file: source.to_string_lossy().to_string(),
        });
    }

    pub fn entries(&self) -> Vec<CompilationCommand> {
        self.entries.lock().clone()
    }

    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&*self.entries.lock())?;
        fs::write(&self.file, json)
            .with_context(|| format!("Failed to write {}", self.file.display()))?;
        Ok(())
    }
}
