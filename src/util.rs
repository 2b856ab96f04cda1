use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Cut `s` to at most `max` characters, marking the cut with "...".
pub fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => s.to_string(),
        Some(_) if max <= 3 => s.chars().take(max).collect(),
        Some(_) => {
            let mut out: String = s.chars().take(max - 3).collect();
            out.push_str("...");
            out
        }
    }
}

/// Keep the last `max` characters. Error text usually ends with the useful part.
pub fn tail(s: &str, max: usize) -> String {
    let skip = s.chars().count().saturating_sub(max);
    s.chars().skip(skip).collect()
}

#[derive(Debug, Error)]
pub enum PathError {
    #[error("empty artifact path")]
    Empty,
    #[error("artifact path must be relative: {0}")]
    Absolute(String),
    #[error("artifact path climbs out of the repository: {0}")]
    Traversal(String),
    #[error("artifact path resolves outside the repository: {0}")]
    Escapes(String),
    #[error("cannot resolve {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A path known to sit inside the repository.
#[derive(Debug, Clone)]
pub struct RepoPath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Resolve `candidate` against `repo_root` and refuse anything that would land
/// outside it, symlinked parents included. The file itself may not exist yet.
pub fn confine_path(repo_root: &Path, candidate: &Path) -> Result<RepoPath, PathError> {
    let shown = || candidate.display().to_string();
    if candidate.as_os_str().is_empty() {
        return Err(PathError::Empty);
    }
    if candidate.is_absolute() {
        return Err(PathError::Absolute(shown()));
    }
    if candidate.components().any(|c| c == Component::ParentDir) {
        return Err(PathError::Traversal(shown()));
    }

    let root = canonical(repo_root)?;
    let absolute = root.join(candidate);

    // Walk up to the deepest ancestor that exists; that is what a symlink could redirect.
    let mut anchor = absolute.parent().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
    while !anchor.exists() && anchor.pop() {}
    if !canonical(&anchor)?.starts_with(&root) {
        return Err(PathError::Escapes(shown()));
    }

    Ok(RepoPath {
        relative: candidate.to_path_buf(),
        absolute,
    })
}

fn canonical(path: &Path) -> Result<PathBuf, PathError> {
    path.canonicalize().map_err(|source| PathError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// sha256 of the given bytes, hex encoded.
pub fn hash_bytes(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

pub fn hash_str(content: &str) -> String {
    hash_bytes(content.as_bytes())
}
