//! Tracked files, and the registry which names them.

use crate::arena::{Arena, Handle};
use crate::link::TrackingLink;
use crate::MAX_WEIGHT;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub type FileId = Handle<TrackedFile>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("track_file {0} is already defined")]
    DuplicateName(Name),
}

/// Describes the name of a tracked file.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct Name(pub Arc<str>);

impl Name {
    pub fn new(name: impl ToString) -> Self {
        Self(name.to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Name {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl From<&'_ str> for Name {
    fn from(s: &'_ str) -> Self {
        Self(s.into())
    }
}

impl std::borrow::Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// How a tracked file should be created before it is first read.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct InitFile {
    pub value: i64,
    /// Rewrite the file even when it already exists.
    pub overwrite: bool,
}

/// An external file whose content encodes a status.
///
/// A tracked file is shared by every [TrackingLink] which names it. Only
/// status propagation and reload reconciliation modify its status.
#[derive(Debug)]
pub struct TrackedFile {
    pub name: Name,
    pub path: PathBuf,

    /// Weight applied by trackers which do not override it.
    pub weight: i64,
    pub weight_reverse: bool,

    pub init: Option<InitFile>,

    // 0 is both "never read" and "healthy".
    pub(crate) last_status: i64,

    // Set when a checker tracking this file was unchanged by the last
    // reload, meaning the inherited status is already reflected by the
    // trackers.
    pub(crate) reloaded: bool,

    pub(crate) trackers: Vec<Handle<TrackingLink>>,
    pub(crate) propagations: u64,
}

impl TrackedFile {
    fn new(name: Name, path: PathBuf) -> Self {
        Self {
            name,
            path,
            weight: 1,
            weight_reverse: false,
            init: None,
            last_status: 0,
            reloaded: false,
            trackers: Vec::new(),
            propagations: 0,
        }
    }

    pub fn last_status(&self) -> i64 {
        self.last_status
    }

    pub fn reloaded(&self) -> bool {
        self.reloaded
    }

    pub fn trackers(&self) -> &[Handle<TrackingLink>] {
        &self.trackers
    }

    /// The number of times a status change has been pushed to the trackers.
    pub fn propagations(&self) -> u64 {
        self.propagations
    }
}

/// Owns every tracked file of a configuration, indexed by name.
#[derive(Debug, Default)]
pub struct Registry {
    files: Arena<TrackedFile>,
    by_name: BTreeMap<Name, FileId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a tracked file by the name it was declared with.
    pub fn resolve(&self, name: &str) -> Option<FileId> {
        self.by_name.get(name).copied()
    }

    /// Declares a new tracked file, with the default weight policy.
    pub fn register(
        &mut self,
        name: impl Into<Name>,
        path: impl Into<PathBuf>,
    ) -> Result<FileId, Error> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(Error::DuplicateName(name));
        }
        let id = self.files.insert(TrackedFile::new(name.clone(), path.into()));
        self.by_name.insert(name, id);
        Ok(id)
    }

    /// Removes a tracked file which nothing tracks yet.
    pub(crate) fn unregister(&mut self, id: FileId) -> Option<TrackedFile> {
        let file = self.files.remove(id)?;
        debug_assert!(file.trackers.is_empty());
        self.by_name.remove(&file.name);
        Some(file)
    }

    /// Returns every tracked file reading from `path`.
    pub fn by_path(&self, path: &Path) -> Vec<FileId> {
        self.files
            .iter()
            .filter(|(_, file)| file.path == path)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn get(&self, id: FileId) -> Option<&TrackedFile> {
        self.files.get(id)
    }

    pub fn get_mut(&mut self, id: FileId) -> Option<&mut TrackedFile> {
        self.files.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FileId, &TrackedFile)> {
        self.files.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (FileId, &mut TrackedFile)> {
        self.files.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl std::ops::Index<FileId> for Registry {
    type Output = TrackedFile;

    fn index(&self, id: FileId) -> &TrackedFile {
        &self.files[id]
    }
}

impl std::ops::IndexMut<FileId> for Registry {
    fn index_mut(&mut self, id: FileId) -> &mut TrackedFile {
        &mut self.files[id]
    }
}

/// Interprets the content of a tracked file as a status.
///
/// The status is the leading (optionally signed) decimal integer, after
/// any whitespace. Anything else reads as 0. The result is clamped to
/// `[-MAX_WEIGHT, MAX_WEIGHT]`.
pub fn parse_status(contents: &str) -> i64 {
    let s = contents.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return 0;
    }

    // Anything too long for an i64 is well past the clamp anyway.
    let magnitude = digits[..end].parse::<i64>().unwrap_or(i64::MAX);
    let status = if negative { -magnitude } else { magnitude };
    status.clamp(-MAX_WEIGHT, MAX_WEIGHT)
}
