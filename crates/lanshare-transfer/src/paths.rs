//! Receive-side filesystem rules: name sanitization, batch directories,
//! `.part` staging with collision suffixes, and the no-overwrite rename.

use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::fs;
use tracing::debug;

use crate::TransferError;

/// Attempts at a collision-free name or batch directory.
const NAME_ATTEMPTS: u32 = 20;

/// Validate a sender-supplied relative name and split it into components.
///
/// Rejected outright: empty names, `:` anywhere (drive letters, alternate
/// streams), absolute or rooted paths, and any `..` segment. Both slash
/// flavors count as separators regardless of the sender's platform.
pub fn sanitize_relative(name: &str) -> Result<Vec<String>, TransferError> {
    if name.is_empty() || name.contains(':') {
        return Err(TransferError::UnsafeName(name.into()));
    }
    let mut parts = Vec::new();
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => {
                // An empty leading part means the name was rooted.
                if parts.is_empty() && part.is_empty() {
                    return Err(TransferError::UnsafeName(name.into()));
                }
            }
            ".." => return Err(TransferError::UnsafeName(name.into())),
            _ => parts.push(part.to_string()),
        }
    }
    if parts.is_empty() {
        return Err(TransferError::UnsafeName(name.into()));
    }
    Ok(parts)
}

/// `name` with `-i` spliced in front of the last dot (`report.txt` →
/// `report-1.txt`); appended when there is no dot.
fn variant(name: &str, i: u32) -> String {
    if i == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) => format!("{}-{}{}", &name[..dot], i, &name[dot..]),
        None => format!("{name}-{i}"),
    }
}

/// A freshly created `.part` file plus the final path it will be renamed to.
pub struct StagedFile {
    pub file: fs::File,
    pub part_path: PathBuf,
    pub final_path: PathBuf,
}

/// Create `<root>/<rel>.part` for writing, never clobbering anything: both
/// the final name and the `.part` sibling must be free, with up to 20
/// suffixed variants tried. Nested directories in `rel` are created under
/// `root` only.
pub async fn stage_file(root: &Path, rel: &[String]) -> Result<StagedFile, TransferError> {
    let (leaf, dirs) = rel.split_last().expect("sanitized names are non-empty");

    let mut dir = root.to_path_buf();
    for part in dirs {
        dir.push(part);
    }
    fs::create_dir_all(&dir).await?;

    for i in 0..NAME_ATTEMPTS {
        let candidate = variant(leaf, i);
        let final_path = dir.join(&candidate);
        let part_path = dir.join(format!("{candidate}.part"));

        if fs::try_exists(&final_path).await? {
            continue;
        }
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .await
        {
            Ok(file) => {
                return Ok(StagedFile {
                    file,
                    part_path,
                    final_path,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(TransferError::TooManyCollisions)
}

/// Create the timestamped directory a batch lands in.
pub async fn make_batch_dir(root: &Path) -> Result<PathBuf, TransferError> {
    let stamp = Local::now().format("%Y-%m-%d %H-%M-%S").to_string();
    fs::create_dir_all(root).await?;
    for i in 0..NAME_ATTEMPTS {
        let name = if i == 0 {
            stamp.clone()
        } else {
            format!("{stamp}-{i}")
        };
        let path = root.join(name);
        match fs::create_dir(&path).await {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(TransferError::TooManyCollisions)
}

/// Promote a validated `.part` to its final name. The rename is refused when
/// something now sits at the final name — the `.part` lives on for
/// diagnosis, and nothing is ever overwritten.
pub async fn promote(part: &Path, final_path: &Path) -> Result<bool, TransferError> {
    if fs::try_exists(final_path).await? {
        debug!("{} already exists, keeping {}", final_path.display(), part.display());
        return Ok(false);
    }
    fs::rename(part, final_path).await?;
    Ok(true)
}

/// Enumerate a flat directory for a batch send. A subdirectory anywhere in
/// it rejects the whole batch; this is the deliberate one-level limit.
pub async fn list_flat_dir(dir: &Path) -> Result<Vec<String>, TransferError> {
    let mut names = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            return Err(TransferError::NestedDirectory);
        }
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}
