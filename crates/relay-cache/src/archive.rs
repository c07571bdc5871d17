//! Cache artifact packaging
//!
//! An artifact is a gzip-compressed tar stream carrying one task's
//! output file set. Headers are normalized so the byte stream is a
//! pure function of file contents: every timestamp is pinned to
//! 2000-01-01T00:00:00Z, ownership is the `nobody` user, and entry
//! names are workspace-relative POSIX paths.

use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType, Header};
use tracing::warn;

use relay_core::paths::{AbsolutePath, RelativeUnixPath};

use crate::CacheError;

/// The fixed modification time stamped on every entry.
const ARTIFACT_MTIME: u64 = 946_684_800; // 2000-01-01T00:00:00Z

/// uid/gid of the `nobody` user.
const NOBODY: u64 = 65534;

/// Build a gzip tar artifact from `files`, which must all live under
/// `root`. Directory entries, regular files, and symlinks are
/// supported; a symlink's referent is stored verbatim and never
/// expanded.
pub fn create(root: &AbsolutePath, files: &[AbsolutePath]) -> Result<Vec<u8>, CacheError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);

    for file in files {
        append_entry(&mut builder, root, file)?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn append_entry(
    builder: &mut Builder<GzEncoder<Vec<u8>>>,
    root: &AbsolutePath,
    file: &AbsolutePath,
) -> Result<(), CacheError> {
    let metadata = file.symlink_metadata()?;
    let rel = file.relative_to(root)?;

    let mut header = Header::new_gnu();
    header.set_mtime(ARTIFACT_MTIME);
    header.set_uid(NOBODY);
    header.set_gid(NOBODY);
    header.set_username("nobody").map_err(CacheError::Io)?;
    header.set_groupname("nobody").map_err(CacheError::Io)?;
    header.set_mode(entry_mode(&metadata));

    if metadata.file_type().is_symlink() {
        let target = file.read_link()?;
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, rel.to_system_path(), posix_link_target(&target))?;
    } else if metadata.is_dir() {
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        builder.append_data(&mut header, rel.to_system_path(), io::empty())?;
    } else {
        header.set_entry_type(EntryType::Regular);
        header.set_size(metadata.len());
        let reader = std::fs::File::open(file.as_path())?;
        builder.append_data(&mut header, rel.to_system_path(), reader)?;
    }
    Ok(())
}

#[cfg(unix)]
fn entry_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn entry_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

/// A symlink target in POSIX form. Relative targets stay relative:
/// they are what makes a restored tree self-contained.
fn posix_link_target(target: &Path) -> PathBuf {
    if let Ok(rel) = RelativeUnixPath::from_system_path(target) {
        rel.to_system_path()
    } else {
        target.to_path_buf()
    }
}

/// Unpack a gzip tar artifact into `root`, returning the restored
/// paths.
///
/// Symlinks whose target does not exist yet are deferred and replayed
/// after the final entry, so a link may precede its referent in the
/// stream. Symlinks to directories restore like any other link.
pub fn extract(root: &AbsolutePath, bytes: &[u8]) -> Result<Vec<AbsolutePath>, CacheError> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut restored = Vec::new();
    let mut deferred_links: Vec<(AbsolutePath, PathBuf)> = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| CacheError::CorruptArtifact(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| CacheError::CorruptArtifact(e.to_string()))?;
        let name = entry
            .path()
            .map_err(|e| CacheError::CorruptArtifact(e.to_string()))?
            .into_owned();
        let dest = root.join(&name);
        restored.push(dest.clone());

        match entry.header().entry_type() {
            EntryType::Directory => dest.create_dir_all()?,
            EntryType::Regular => {
                dest.ensure_parent_dir()?;
                let mode = entry.header().mode().unwrap_or(0o644);
                let mut out = std::fs::File::create(dest.as_path())?;
                io::copy(&mut entry, &mut out)?;
                set_file_mode(&dest, mode)?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| CacheError::CorruptArtifact(e.to_string()))?
                    .ok_or_else(|| {
                        CacheError::CorruptArtifact(format!(
                            "symlink entry {} has no target",
                            name.display()
                        ))
                    })?
                    .into_owned();
                if !try_restore_symlink(&dest, &target)? {
                    // Target not materialized yet; retry after EOF.
                    deferred_links.push((dest, target));
                }
            }
            other => {
                warn!(entry = %name.display(), kind = ?other, "skipping unhandled tar entry type");
            }
        }
    }

    for (dest, target) in deferred_links {
        if !try_restore_symlink(&dest, &target)? {
            return Err(CacheError::CorruptArtifact(format!(
                "symlink {} points at missing target {}",
                dest,
                target.display()
            )));
        }
    }

    Ok(restored)
}

/// Create the symlink when its target exists; report `false` when the
/// target is not there yet.
fn try_restore_symlink(link: &AbsolutePath, target: &Path) -> Result<bool, CacheError> {
    link.ensure_parent_dir()?;

    let resolved = if target.is_absolute() {
        AbsolutePath::new_unchecked(target)
    } else {
        match link.parent() {
            Some(parent) => parent.join(target),
            None => AbsolutePath::new_unchecked(target),
        }
    };
    if !resolved.exists() {
        return Ok(false);
    }

    if link.exists() {
        link.remove_file()?;
    }
    link.symlink_to(target)?;
    Ok(true)
}

#[cfg(unix)]
fn set_file_mode(path: &AbsolutePath, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path.as_path(), std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &AbsolutePath, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Decode an artifact and list its entries without touching the
/// filesystem. Used by header tests and diagnostics.
#[cfg(test)]
fn list_entries(bytes: &[u8]) -> Result<Vec<(String, u64, u64, String)>, CacheError> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut out = Vec::new();
    for entry in archive
        .entries()
        .map_err(|e| CacheError::CorruptArtifact(e.to_string()))?
    {
        let entry = entry.map_err(|e| CacheError::CorruptArtifact(e.to_string()))?;
        let header = entry.header();
        out.push((
            entry.path().unwrap().to_string_lossy().to_string(),
            header.mtime().unwrap(),
            header.uid().unwrap(),
            header.username().unwrap().unwrap_or("").to_string(),
        ));
    }
    Ok(out)
}
