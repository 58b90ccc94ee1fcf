use crate::fingerprint::{Fingerprint, FingerprintProvider};
use std::io;
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;
// Flat directory enumeration: regular files directly under the root only

/// Regular file with its content fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    pub name: String,
    pub fingerprint: Fingerprint,
}

/// Names of the regular files directly under `root`, sorted by name.
/// Subdirectories and symlinks are skipped; an unreadable root is an error.
pub fn list_regular_files(root: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();

    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if e.depth() == 0 => {
                return Err(e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::other("directory walk failed")));
            }
            Err(e) => {
                warn!("skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.file_name().to_str() {
            Some(name) => names.push(name.to_string()),
            None => warn!("skipping non UTF-8 filename {:?}", entry.file_name()),
        }
    }

    Ok(names)
}

/// Fingerprint every regular file under `root`. Files whose content cannot be
/// read are left out of the result.
pub fn fingerprint_directory(
    root: &Path,
    provider: &dyn FingerprintProvider,
) -> io::Result<Vec<FileFingerprint>> {
    let names = list_regular_files(root)?;
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        match provider.fingerprint_file(&root.join(&name)) {
            Ok(fingerprint) => out.push(FileFingerprint { name, fingerprint }),
            Err(e) => warn!("skipping {}: cannot fingerprint: {}", name, e),
        }
    }
    Ok(out)
}
