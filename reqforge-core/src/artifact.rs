//! Generated artifact: a relative-path to UTF-8 content mapping
//!
//! Paths are normalized to forward slashes on insert; empty paths and
//! `..` traversal are rejected so the committer can join them under its
//! working copy without escaping it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("artifact path is empty")]
    EmptyPath,
    #[error("artifact path '{0}' is absolute")]
    AbsolutePath(String),
    #[error("artifact path '{0}' contains a parent-directory segment")]
    Traversal(String),
}

/// Map from relative file path to file content.
///
/// Backed by a `BTreeMap` so iteration (and therefore staging and the
/// changed-files list) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    files: BTreeMap<String, String>,
}

impl Artifact {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file, normalizing separators and validating the path.
    pub fn insert(
        &mut self,
        path: impl AsRef<str>,
        content: impl Into<String>,
    ) -> Result<(), ArtifactError> {
        let path = Self::normalize(path.as_ref())?;
        self.files.insert(path, content.into());
        Ok(())
    }

    /// Normalize a model-produced path: backslashes become `/`, leading
    /// `./` and duplicate slashes are dropped.
    fn normalize(raw: &str) -> Result<String, ArtifactError> {
        let cleaned = raw.trim().replace('\\', "/");
        if cleaned.starts_with('/') {
            return Err(ArtifactError::AbsolutePath(raw.to_string()));
        }
        let segments: Vec<&str> = cleaned
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        if segments.is_empty() {
            return Err(ArtifactError::EmptyPath);
        }
        if segments.contains(&"..") {
            return Err(ArtifactError::Traversal(raw.to_string()));
        }
        Ok(segments.join("/"))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    /// File names (final path segment), used for coverage matching.
    pub fn file_names(&self) -> Vec<&str> {
        self.files
            .keys()
            .filter_map(|p| p.rsplit('/').next())
            .collect()
    }
}

impl FromIterator<(String, String)> for Artifact {
    /// Collect, silently dropping invalid paths. Callers that must
    /// surface path errors use [`Artifact::insert`].
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut artifact = Artifact::new();
        for (path, content) in iter {
            let _ = artifact.insert(path, content);
        }
        artifact
    }
}
