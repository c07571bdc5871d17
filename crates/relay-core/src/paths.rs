//! Typed filesystem paths
//!
//! Two path kinds appear at relay API boundaries: [`AbsolutePath`], a
//! validated platform-native absolute path, and [`RelativeUnixPath`], a
//! `/`-separated relative path used as the wire, tar, and hash-key
//! representation on every OS. Keeping the two distinct removes
//! separator ambiguity at the seams between the cache, the hasher, and
//! the executor.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PathError;

/// A validated platform-native absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AbsolutePath(PathBuf);

impl AbsolutePath {
    /// Checked constructor: fails when the input is not absolute.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, PathError> {
        let path = path.into();
        if path.is_absolute() {
            Ok(Self(path))
        } else {
            Err(PathError::NotAbsolute(path))
        }
    }

    /// Trusted constructor. The caller asserts the path is absolute.
    pub fn new_unchecked(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// The current working directory.
    pub fn cwd() -> io::Result<Self> {
        Ok(Self(std::env::current_dir()?))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Join one or more native relative segments.
    pub fn join(&self, segment: impl AsRef<Path>) -> Self {
        Self(self.0.join(segment))
    }

    /// Join a POSIX-separator relative path, converting separators to
    /// the host convention first.
    pub fn join_unix(&self, rel: &RelativeUnixPath) -> Self {
        Self(self.0.join(rel.to_system_path()))
    }

    pub fn parent(&self) -> Option<Self> {
        self.0.parent().map(|p| Self(p.to_path_buf()))
    }

    /// Whether anything exists at this path, without following a
    /// trailing symlink.
    pub fn exists(&self) -> bool {
        self.0.symlink_metadata().is_ok()
    }

    pub fn is_dir(&self) -> bool {
        self.0.is_dir()
    }

    pub fn symlink_metadata(&self) -> io::Result<fs::Metadata> {
        self.0.symlink_metadata()
    }

    pub fn metadata(&self) -> io::Result<fs::Metadata> {
        self.0.metadata()
    }

    pub fn read_link(&self) -> io::Result<PathBuf> {
        self.0.read_link()
    }

    /// Create a symlink at this path pointing at `target`.
    #[cfg(unix)]
    pub fn symlink_to(&self, target: impl AsRef<Path>) -> io::Result<()> {
        std::os::unix::fs::symlink(target, &self.0)
    }

    /// Create a symlink at this path pointing at `target`.
    #[cfg(windows)]
    pub fn symlink_to(&self, target: impl AsRef<Path>) -> io::Result<()> {
        let target = target.as_ref();
        if self.0.parent().map_or(false, |p| p.join(target).is_dir()) {
            std::os::windows::fs::symlink_dir(target, &self.0)
        } else {
            std::os::windows::fs::symlink_file(target, &self.0)
        }
    }

    /// Create a hard link at `link` referring to this path.
    pub fn hard_link_to(&self, link: &AbsolutePath) -> io::Result<()> {
        fs::hard_link(&self.0, &link.0)
    }

    /// Derive the relative path from `base` to this path, in POSIX
    /// form. Fails when this path is not contained in `base`,
    /// including paths that re-escape through `..` segments.
    pub fn relative_to(&self, base: &AbsolutePath) -> Result<RelativeUnixPath, PathError> {
        let not_contained = || PathError::NotContained {
            path: self.0.clone(),
            base: base.0.clone(),
        };
        let rel = self.0.strip_prefix(&base.0).map_err(|_| not_contained())?;
        if rel.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(not_contained());
        }
        RelativeUnixPath::from_system_path(rel)
    }

    pub fn create_dir_all(&self) -> io::Result<()> {
        fs::create_dir_all(&self.0)
    }

    /// Ensure the parent directory of this path exists.
    pub fn ensure_parent_dir(&self) -> io::Result<()> {
        match self.0.parent() {
            Some(parent) => fs::create_dir_all(parent),
            None => Ok(()),
        }
    }

    pub fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.0)
    }

    pub fn read_to_string(&self) -> io::Result<String> {
        fs::read_to_string(&self.0)
    }

    pub fn write(&self, contents: impl AsRef<[u8]>) -> io::Result<()> {
        fs::write(&self.0, contents)
    }

    pub fn remove_file(&self) -> io::Result<()> {
        fs::remove_file(&self.0)
    }

    pub fn to_string_lossy(&self) -> std::borrow::Cow<'_, str> {
        self.0.to_string_lossy()
    }
}

impl fmt::Display for AbsolutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for AbsolutePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// A relative path using `/` as separator on every platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelativeUnixPath(String);

impl RelativeUnixPath {
    /// Checked constructor: fails when the input is absolute.
    pub fn new(path: impl Into<String>) -> Result<Self, PathError> {
        let path = path.into();
        if path.starts_with('/') {
            return Err(PathError::NotRelative(path));
        }
        Ok(Self(path))
    }

    /// Convert a platform-native relative path to POSIX form.
    pub fn from_system_path(path: &Path) -> Result<Self, PathError> {
        let mut segments = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(seg) => {
                    let seg = seg
                        .to_str()
                        .ok_or_else(|| PathError::InvalidUnicode(path.to_path_buf()))?;
                    segments.push(seg);
                }
                Component::CurDir => {}
                Component::ParentDir => segments.push(".."),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PathError::NotRelative(path.display().to_string()))
                }
            }
        }
        Ok(Self(segments.join("/")))
    }

    /// Convert to a platform-native relative path.
    pub fn to_system_path(&self) -> PathBuf {
        self.0.split('/').collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn join(&self, segment: &str) -> Self {
        if self.0.is_empty() {
            Self(segment.to_string())
        } else {
            Self(format!("{}/{}", self.0, segment))
        }
    }
}

impl fmt::Display for RelativeUnixPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
