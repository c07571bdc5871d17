//! SCM provider for relay
//!
//! The task hasher asks the SCM which files a package contains so it
//! can fingerprint exactly what the repository tracks, ignoring build
//! output and editor droppings. When the workspace is not a git
//! repository the hasher falls back to walking the directory.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use git2::Repository;
use thiserror::Error;
use tracing::{debug, instrument};

use relay_core::paths::{AbsolutePath, RelativeUnixPath};

/// Errors from the SCM provider.
#[derive(Debug, Error)]
pub enum ScmError {
    /// The workspace is not inside a supported repository. Callers are
    /// expected to fall back to a directory walk.
    #[error("not a git repository: {0}")]
    NotARepository(PathBuf),

    /// Underlying git error
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// A tracked path was outside the requested package directory in a
    /// way that could not be expressed relative to it
    #[error("unrepresentable tracked path: {0}")]
    BadPath(String),
}

/// Handle to the repository containing the workspace.
///
/// The repository sits behind a mutex: libgit2 handles may move
/// between threads but must not be used from two at once, and the
/// hasher shares one `Scm` across its worker pool.
pub struct Scm {
    repo: Mutex<Repository>,
    workdir: PathBuf,
}

impl Scm {
    /// Open the repository containing `root`, searching parent
    /// directories the way git itself does.
    #[instrument(skip_all, fields(root = %root))]
    pub fn open(root: &AbsolutePath) -> Result<Self, ScmError> {
        let repo = Repository::discover(root.as_path()).map_err(|e| {
            if e.code() == git2::ErrorCode::NotFound {
                ScmError::NotARepository(root.as_path().to_path_buf())
            } else {
                ScmError::Git(e)
            }
        })?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| ScmError::NotARepository(root.as_path().to_path_buf()))?
            .to_path_buf();
        Ok(Self {
            repo: Mutex::new(repo),
            workdir,
        })
    }

    /// List index-tracked files under `package_dir`, as paths relative
    /// to the package directory in POSIX form.
    pub fn tracked_files(
        &self,
        package_dir: &AbsolutePath,
    ) -> Result<Vec<RelativeUnixPath>, ScmError> {
        let package_prefix = self.repo_relative_prefix(package_dir)?;
        let repo = self.repo.lock().expect("repository lock poisoned");
        let index = repo.index()?;

        let mut files = Vec::new();
        for entry in index.iter() {
            let tracked = String::from_utf8(entry.path.clone())
                .map_err(|_| ScmError::BadPath(String::from_utf8_lossy(&entry.path).into()))?;
            let relative = if package_prefix.is_empty() {
                tracked.as_str()
            } else if let Some(rest) = tracked
                .strip_prefix(&package_prefix)
                .and_then(|r| r.strip_prefix('/'))
            {
                rest
            } else {
                continue;
            };
            files.push(
                RelativeUnixPath::new(relative.to_string())
                    .map_err(|_| ScmError::BadPath(tracked.clone()))?,
            );
        }
        debug!(
            package = %package_dir,
            count = files.len(),
            "listed tracked files"
        );
        Ok(files)
    }

    /// The package directory relative to the repository workdir, in
    /// index (POSIX) form. Empty when the package is the workdir.
    fn repo_relative_prefix(&self, package_dir: &AbsolutePath) -> Result<String, ScmError> {
        let rel: &Path = package_dir
            .as_path()
            .strip_prefix(&self.workdir)
            .map_err(|_| ScmError::BadPath(package_dir.to_string_lossy().into()))?;
        let unix = RelativeUnixPath::from_system_path(rel)
            .map_err(|_| ScmError::BadPath(package_dir.to_string_lossy().into()))?;
        Ok(unix.as_str().to_string())
    }
}
