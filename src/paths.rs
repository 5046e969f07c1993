//! Filesystem access rooted at the procfly directory.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Default config file name inside the procfly directory.
pub const CONFIG_FILE: &str = "procfly.toml";

/// Mode for files rendered from inline templates.
pub const INLINE_MODE: u32 = 0o660;
/// Mode for files rendered from template files.
pub const FILE_MODE: u32 = 0o600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// The procfly directory. Relative paths resolve against it.
    pub root: PathBuf,
    /// The config file.
    pub config_file: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let config_file = root.join(CONFIG_FILE);
        Self { root, config_file }
    }

    /// Uses `config_file` instead of the default file in the root.
    pub fn with_config_file(mut self, config_file: impl AsRef<Path>) -> Self {
        self.config_file = self.resolve(config_file);
        self
    }

    /// Joins `path` onto the root unless it is absolute.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn read(&self, path: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(self.resolve(path))
    }

    /// Creates or truncates `path`, creating missing parent directories.
    ///
    /// `mode` only applies when the file is created.
    pub fn write(&self, path: impl AsRef<Path>, contents: &[u8], mode: u32) -> io::Result<PathBuf> {
        let path = self.resolve(path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&path)?;
        file.write_all(contents)?;
        Ok(path)
    }
}
