//! Repository lookups for `extends = "<kind>/<path>"` references.

use crate::document::{parse_document, AppDoc, CommandDoc, ServiceDoc};
use crate::merge::Merge;
use crate::report::{IssueKind, ValidationReport};
use serde::de::DeserializeOwned;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Ordered repository roots; the first one containing a reference wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Repositories {
    roots: Vec<PathBuf>,
}

impl Repositories {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Map `repos` entries from the system config to local directories.
    /// Remote URLs live under `<config_dir>/repos/<sanitized url>`; relative
    /// paths are taken relative to the config directory.
    pub fn from_entries(config_dir: &Path, entries: &[String]) -> Self {
        let roots = entries
            .iter()
            .map(|entry| repository_root(config_dir, entry))
            .collect();
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn find(&self, reference: &str) -> Option<PathBuf> {
        let rel = Path::new(reference);
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return None;
        }
        self.roots
            .iter()
            .map(|root| root.join(format!("{reference}.toml")))
            .find(|candidate| candidate.is_file())
    }
}

pub fn repository_root(config_dir: &Path, entry: &str) -> PathBuf {
    if entry.contains("://") {
        let sanitized: String = entry
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        config_dir.join("repos").join(sanitized)
    } else {
        config_dir.join(entry)
    }
}

/// Documents that may inherit from a repository entry.
pub trait Extendable: Merge + DeserializeOwned + Default {
    fn extends(&self) -> Option<&str>;
    fn clear_extends(&mut self);
}

macro_rules! extendable {
    ($($ty:ty),*) => {
        $(
            impl Extendable for $ty {
                fn extends(&self) -> Option<&str> {
                    self.extends.as_deref()
                }
                fn clear_extends(&mut self) {
                    self.extends = None;
                }
            }
        )*
    };
}

extendable!(AppDoc, ServiceDoc, CommandDoc);

/// Merge the `extends` chain of `doc` underneath it. Problems are recorded at
/// `path` and the document is returned with whatever could be resolved.
pub fn expand<T: Extendable>(
    doc: T,
    repos: &Repositories,
    path: &str,
    report: &mut ValidationReport,
) -> T {
    expand_traced(doc, repos, path, report).0
}

/// Like [`expand`], also returning the folders of the repository files the
/// chain was read from, nearest first.
pub fn expand_traced<T: Extendable>(
    doc: T,
    repos: &Repositories,
    path: &str,
    report: &mut ValidationReport,
) -> (T, Vec<PathBuf>) {
    let mut layers = vec![doc];
    let mut folders = Vec::new();
    let mut seen: Vec<String> = Vec::new();

    while let Some(reference) = layers.last().and_then(|d| d.extends()).map(str::to_owned) {
        if seen.contains(&reference) {
            seen.push(reference);
            report.push(
                format!("{path}.extends"),
                IssueKind::Cycle,
                format!("extends chain revisits a reference: {}", seen.join(" -> ")),
            );
            break;
        }
        seen.push(reference.clone());

        let Some(file) = repos.find(&reference) else {
            report.push(
                format!("{path}.extends"),
                IssueKind::UnknownReference,
                format!("'{reference}' not found in any repository"),
            );
            break;
        };
        debug!("{path}: extending from {}", file.display());

        let parent = match std::fs::read_to_string(&file) {
            Ok(text) => parse_document::<T>(&text).map_err(|e| e.message().to_owned()),
            Err(e) => Err(e.to_string()),
        };
        match parent {
            Ok(parent) => {
                layers.push(parent);
                if let Some(folder) = file.parent().filter(|f| !folders.iter().any(|x| x == f)) {
                    folders.push(folder.to_path_buf());
                }
            }
            Err(message) => {
                report.push(
                    format!("{path}.extends"),
                    IssueKind::Parse,
                    format!("{}: {message}", file.display()),
                );
                break;
            }
        }
    }

    let mut merged = T::default();
    for mut layer in layers.into_iter().rev() {
        layer.clear_extends();
        merged = merged.merge(layer);
    }
    (merged, folders)
}
