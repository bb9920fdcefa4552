/*!
Mapping of a URL path plus a root directory onto a local file.

The resolver is the security boundary between the request and the
filesystem: a returned path is always a descendant of the root it was
given, and any path carrying a traversal segment is rejected before the
filesystem is ever consulted.
*/

use std::{
    fs::Metadata,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use hyper::StatusCode;

use crate::GateErr;

/// Resolution failure, categorized for the status mapping.
#[derive(Debug)]
pub enum ResolveError {
    /// No such entry under the root.
    NotFound,
    /// Malformed or traversal path; the filesystem was not touched.
    Invalid,
    /// Exists but is inaccessible, unreadable, or has the wrong type.
    Failed,
}

impl From<ResolveError> for GateErr {
    fn from(e: ResolveError) -> GateErr {
        match e {
            ResolveError::NotFound => {
                GateErr::from(StatusCode::NOT_FOUND).wrap("no such file or directory")
            }
            ResolveError::Invalid => {
                GateErr::from(StatusCode::BAD_REQUEST).wrap("invalid request path")
            }
            ResolveError::Failed => {
                GateErr::from(StatusCode::FORBIDDEN).wrap("file not accessible")
            }
        }
    }
}

/// A successfully resolved local target. Immutable once produced.
#[derive(Debug)]
pub struct ResolvedTarget {
    /// Absolute path, always under the root passed to `resolve`.
    pub path: PathBuf,
    pub metadata: Metadata,
    /// URL path remainder below the matched script; feeds PATH_INFO.
    /// Empty in static mode.
    pub path_info: String,
}

async fn stat(p: &Path, follow_symlinks: bool) -> Result<Metadata, ResolveError> {
    let res = if follow_symlinks {
        tokio::fs::metadata(p).await
    } else {
        tokio::fs::symlink_metadata(p).await
    };
    // Any stat failure other than plain absence means the entry isn't
    // available to the client, whatever the underlying errno says.
    res.map_err(|e| match e.kind() {
        ErrorKind::NotFound => ResolveError::NotFound,
        _ => ResolveError::Failed,
    })
}

fn confine(root: &Path, p: &Path) -> Result<(), ResolveError> {
    if p.starts_with(root) {
        Ok(())
    } else {
        Err(ResolveError::Invalid)
    }
}

/// Maps `url_path` onto a file under `root`.
///
/// Static mode requires the full path to name an existing regular file.
/// Execution mode walks the path for the nearest leading run of segments
/// naming a regular file; the rest of the URL path becomes `path_info`.
pub async fn resolve(
    root: &Path,
    url_path: &str,
    static_mode: bool,
    follow_symlinks: bool,
) -> Result<ResolvedTarget, ResolveError> {
    let decoded = urlencoding::decode(url_path).map_err(|_| ResolveError::Invalid)?;

    let mut segments: Vec<&str> = Vec::new();
    for seg in decoded.split('/') {
        if seg.is_empty() {
            continue;
        }
        // Rejects "..", ".", and dotfiles alike, before any stat call.
        if seg.starts_with('.') || seg.contains('\0') {
            return Err(ResolveError::Invalid);
        }
        segments.push(seg);
    }

    if static_mode {
        let mut path = root.to_path_buf();
        for seg in &segments {
            path.push(seg);
        }
        confine(root, &path)?;
        let metadata = stat(&path, follow_symlinks).await?;
        if !metadata.is_file() {
            return Err(ResolveError::Failed);
        }
        return Ok(ResolvedTarget {
            path,
            metadata,
            path_info: String::new(),
        });
    }

    let mut path = root.to_path_buf();
    for (i, seg) in segments.iter().enumerate() {
        path.push(seg);
        confine(root, &path)?;
        let metadata = stat(&path, follow_symlinks).await?;
        if metadata.is_file() {
            let mut path_info = String::new();
            for rest in &segments[i + 1..] {
                path_info.push('/');
                path_info.push_str(rest);
            }
            return Ok(ResolvedTarget {
                path,
                metadata,
                path_info,
            });
        }
        if !metadata.is_dir() {
            return Err(ResolveError::Failed);
        }
    }

    // The URL named a directory, or nothing at all.
    if segments.is_empty() {
        Err(ResolveError::NotFound)
    } else {
        Err(ResolveError::Failed)
    }
}
