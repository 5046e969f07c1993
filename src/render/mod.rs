//! Template rendering and change detection.
//!
//! Templates are [minijinja] sources rendered against [`Vars`]. Each distinct
//! source text is compiled once per [`Renderer`], no matter how many
//! destinations use it.
//!
//! [`Renderer::render_all`] writes every configured template to its
//! destination in destination order and returns a [`ContentHash`] over
//! everything written. Comparing hashes between passes tells the watch loop
//! whether any rendered file changed.

mod funcs;
mod vars;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use sha2::{Digest, Sha256};
use tokio::runtime::Handle;
use tracing::debug;

use crate::command::Command;
use crate::discovery::Discovery;
use crate::error::RenderError;
use crate::paths::{Paths, FILE_MODE, INLINE_MODE};

pub use funcs::LOOKUP_TIMEOUT;
pub use vars::{process_env, FlyVars, ProcflyVars, Vars};

/// The two template sets, keyed by destination path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Templates {
    /// Destination -> template text.
    pub inline: BTreeMap<String, String>,
    /// Destination -> path of a template source file.
    pub files: BTreeMap<String, String>,
}

impl Templates {
    /// Destinations that appear in both sets.
    pub fn conflicts(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inline
            .keys()
            .filter(|k| self.files.contains_key(*k))
            .chain(self.files.keys().filter(|k| self.inline.contains_key(*k)))
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Aggregate SHA-256 over one rendering pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

enum Source<'a> {
    Inline(&'a str),
    File(&'a str),
}

pub struct Renderer {
    env: Environment<'static>,
    compiled: HashSet<String>,
    paths: Paths,
}

impl Renderer {
    /// Creates a renderer whose `lookup` function runs on the current tokio
    /// runtime, if there is one.
    pub fn new(paths: Paths, discovery: Arc<dyn Discovery>) -> Self {
        Self::with_runtime(paths, discovery, Handle::try_current().ok(), LOOKUP_TIMEOUT)
    }

    pub fn with_runtime(
        paths: Paths,
        discovery: Arc<dyn Discovery>,
        runtime: Option<Handle>,
        lookup_timeout: Duration,
    ) -> Self {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        // Printing a missing field fails; tests like `is defined` still work.
        env.set_undefined_behavior(UndefinedBehavior::SemiStrict);
        funcs::register(&mut env, discovery, runtime, lookup_timeout);
        Self {
            env,
            compiled: HashSet::new(),
            paths,
        }
    }

    /// Number of distinct template sources compiled so far.
    pub fn compiled(&self) -> usize {
        self.compiled.len()
    }

    /// Renders `source` against `vars`. `label` names the template in errors.
    pub fn render(&mut self, label: &str, source: &str, vars: &Vars) -> Result<String, RenderError> {
        let template_error = |source: minijinja::Error| RenderError::Template {
            name: label.to_string(),
            source,
        };

        let key = hex::encode(Sha256::digest(source.as_bytes()));
        if !self.compiled.contains(&key) {
            self.env
                .add_template_owned(key.clone(), source.to_string())
                .map_err(template_error)?;
            self.compiled.insert(key.clone());
        }
        let template = self.env.get_template(&key).map_err(template_error)?;
        template.render(vars).map_err(template_error)
    }

    /// Renders and writes every template, returning the aggregate hash.
    ///
    /// Fails with [`RenderError::Conflict`] before writing anything when a
    /// destination is configured twice.
    pub fn render_all(&mut self, templates: &Templates, vars: &Vars) -> Result<ContentHash, RenderError> {
        let conflicts = templates.conflicts();
        if !conflicts.is_empty() {
            return Err(RenderError::Conflict { names: conflicts });
        }

        let mut ordered: BTreeMap<&str, Source<'_>> = BTreeMap::new();
        for (dest, text) in &templates.inline {
            ordered.insert(dest, Source::Inline(text));
        }
        for (dest, path) in &templates.files {
            ordered.insert(dest, Source::File(path));
        }

        let mut hasher = Sha256::new();
        for (dest, source) in ordered {
            let (text, mode) = match source {
                Source::Inline(text) => (text.to_string(), INLINE_MODE),
                Source::File(path) => {
                    let text = self.paths.read(path).map_err(|source| RenderError::Io {
                        path: self.paths.resolve(path),
                        source,
                    })?;
                    (text, FILE_MODE)
                }
            };

            let rendered = self.render(dest, &text, vars)?;
            self.paths
                .write(dest, rendered.as_bytes(), mode)
                .map_err(|source| RenderError::Io {
                    path: self.paths.resolve(dest),
                    source,
                })?;

            hasher.update(dest.as_bytes());
            hasher.update([0u8]);
            hasher.update((rendered.len() as u64).to_le_bytes());
            hasher.update(rendered.as_bytes());
        }

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        let hash = ContentHash(digest);
        debug!(%hash, compiled = self.compiled(), "rendered templates");
        Ok(hash)
    }

    /// Renders command templates and parses the results.
    ///
    /// Commands are not part of the aggregate hash.
    pub fn commands(
        &mut self,
        commands: &BTreeMap<String, String>,
        vars: &Vars,
    ) -> Result<BTreeMap<String, Command>, RenderError> {
        let mut parsed = BTreeMap::new();
        for (name, text) in commands {
            let rendered = self.render(name, text, vars)?;
            let command = Command::parse(&rendered);
            if command.name.trim().is_empty() {
                return Err(RenderError::Template {
                    name: name.clone(),
                    source: minijinja::Error::new(
                        ErrorKind::InvalidOperation,
                        "rendered to an empty command",
                    ),
                });
            }
            parsed.insert(name.clone(), command);
        }
        Ok(parsed)
    }
}
