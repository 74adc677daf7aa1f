//! The managed script: a private, mutable copy of the user's script.
//!
//! The copy lives in its own temporary directory which is removed when the
//! [`ManagedScript`] is dropped, on every exit path. The user's file is read
//! once and never written.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::{BisectError, Result};
use crate::metadata::{self, DependencyBlock, ScriptMetadata};

const TEMP_PREFIX: &str = "script_bisect_";

/// Private working copy of a script plus the fixes accumulated on it.
#[derive(Debug)]
pub struct ManagedScript {
    _dir: TempDir,
    path: PathBuf,
    /// Script text with all accumulated dependency fixes but no pin.
    base_text: String,
    added: Vec<String>,
}

impl ManagedScript {
    /// Copy `original` into a fresh temporary directory.
    pub fn from_file(original: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(original).map_err(|e| {
            BisectError::Parse(format!("cannot read script {}: {e}", original.display()))
        })?;
        let file_name = original
            .file_name()
            .map(|n| safe_filename(&n.to_string_lossy()))
            .unwrap_or_else(|| "script.py".to_string());
        Self::from_text(&file_name, text)
    }

    /// Managed copy built from in-memory text.
    pub fn from_text(file_name: &str, text: String) -> Result<Self> {
        ScriptMetadata::parse(&text)?;
        let dir = tempfile::Builder::new().prefix(TEMP_PREFIX).tempdir()?;
        let path = dir.path().join(safe_filename(file_name));
        std::fs::write(&path, &text)?;
        Ok(Self {
            _dir: dir,
            path,
            base_text: text,
            added: Vec::new(),
        })
    }

    /// Location of the file the test command runs.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current dependency block, including accumulated fixes.
    pub fn dependencies(&self) -> Result<DependencyBlock> {
        Ok(ScriptMetadata::parse(&self.base_text)?.dependencies)
    }

    /// Packages appended by fixes so far, in the order they were added.
    pub fn added_packages(&self) -> &[String] {
        &self.added
    }

    /// Write the script pinned to `reference` and return the block that was
    /// written.
    pub fn write_pinned(
        &self,
        package: &str,
        source: &str,
        reference: &str,
    ) -> Result<DependencyBlock> {
        let text = metadata::update(&self.base_text, package, source, reference)?;
        std::fs::write(&self.path, &text)?;
        Ok(ScriptMetadata::parse(&text)?.dependencies)
    }

    /// Record `block` as the new base dependency set.
    ///
    /// Only additions are expected here; the fixes persist for every later
    /// probe.
    pub fn accumulate(&mut self, block: &DependencyBlock, added: &[String]) -> Result<()> {
        self.base_text = metadata::render(&self.base_text, block)?;
        self.added.extend(added.iter().cloned());
        Ok(())
    }
}

/// Replace anything other than alphanumerics, `-`, `_` and `.` with `_`.
pub fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
