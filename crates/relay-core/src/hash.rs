//! Content hashing primitives
//!
//! One digest per concern, and both are load-bearing for cache
//! compatibility across versions:
//!
//! - file contents use the git blob form, `sha1("blob <len>\0<content>")`,
//!   so a stored file hash can be checked against `git hash-object`;
//! - structured values (task definitions, env bindings, file-hash lists)
//!   use SHA-256 over a canonical JSON serialization, truncated to 16
//!   bytes of hex. Canonical means object keys in lexicographic order
//!   and set-like arrays sorted before serialization, so insertion
//!   order never reaches the digest.

use serde_json::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::HashError;
use crate::paths::{AbsolutePath, RelativeUnixPath};

/// Number of hex characters kept from a truncated SHA-256 digest.
const VALUE_HASH_LEN: usize = 32;

/// Hash raw content the way git hashes a blob object.
pub fn git_blob_hash(content: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(b"blob ");
    hasher.update(content.len().to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Git-blob hash of a file on disk.
pub fn hash_file_blob(path: &AbsolutePath) -> Result<String, HashError> {
    let content = path.read().map_err(|source| HashError::FileRead {
        path: path.as_path().to_path_buf(),
        source,
    })?;
    Ok(git_blob_hash(&content))
}

/// Aggregate a set of `(path, blob-hash)` pairs into one digest.
///
/// The pairs are sorted by path first, so callers may supply them in
/// any order.
pub fn hash_file_list(mut entries: Vec<(RelativeUnixPath, String)>) -> String {
    entries.sort();
    let mut hasher = Sha256::new();
    for (path, blob) in &entries {
        hasher.update(path.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(blob.as_bytes());
        hasher.update(b"\0");
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..VALUE_HASH_LEN].to_string()
}

/// Hash a structured value via its canonical JSON serialization.
///
/// `serde_json` objects serialize with keys in lexicographic order, so
/// any value assembled from `serde_json::Map`s is canonical by
/// construction. Arrays are serialized as given: callers sort
/// set-valued arrays before building the value.
pub fn hash_value(value: &Value) -> String {
    let serialized = value.to_string();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..VALUE_HASH_LEN].to_string()
}

/// Compute the run-global hash: the root manifest plus every file
/// matched by the configured global dependency globs.
pub fn global_hash(
    root: &AbsolutePath,
    global_dependencies: &[String],
) -> Result<String, HashError> {
    let mut entries = Vec::new();

    let root_manifest = root.join("package.json");
    if root_manifest.exists() {
        entries.push((
            RelativeUnixPath::new("package.json").expect("static relative path"),
            hash_file_blob(&root_manifest)?,
        ));
    }

    for pattern in global_dependencies {
        let full_pattern = root.join_unix(
            &RelativeUnixPath::new(pattern.clone()).map_err(HashError::Path)?,
        );
        let Ok(matches) = glob::glob(&full_pattern.to_string_lossy()) else {
            continue;
        };
        for entry in matches.flatten() {
            if !entry.is_file() {
                continue;
            }
            let abs = AbsolutePath::new_unchecked(entry);
            let rel = abs.relative_to(root)?;
            let blob = hash_file_blob(&abs)?;
            entries.push((rel, blob));
        }
    }

    Ok(hash_file_list(entries))
}
