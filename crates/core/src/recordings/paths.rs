use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// One receiver-root to local-root translation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    /// Absolute path as the receiver sees it (e.g. `/media/hdd/movie`)
    pub receiver_root: PathBuf,
    /// Absolute path where that tree is mounted locally
    pub local_root: PathBuf,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("service reference carries no path")]
    NoPathInReference,
    #[error("receiver path is not absolute")]
    RelativePath,
    #[error("receiver path contains parent traversal")]
    ParentTraversal,
    #[error("no mapping covers {0}")]
    NoMapping(String),
    #[error("resolved path escapes its mapped root")]
    OutsideRoot,
    #[error("io: {0}")]
    Io(String),
}

/// Translates receiver recording paths into confined local paths.
///
/// Selection is longest-prefix over the configured mappings; the resolved
/// candidate must stay inside its mapping's local root after full symlink
/// resolution.
pub struct RecordingPaths {
    mappings: Vec<PathMapping>,
}

impl RecordingPaths {
    pub fn new(mappings: Vec<PathMapping>) -> Result<Self> {
        for m in &mappings {
            for (side, p) in [
                ("receiver_root", &m.receiver_root),
                ("local_root", &m.local_root),
            ] {
                if p.as_os_str().is_empty() {
                    bail!("{side} must not be empty");
                }
                if !p.is_absolute() {
                    bail!("{side} must be absolute: {}", p.display());
                }
                if p == Path::new("/") {
                    bail!("{side} must not be the filesystem root");
                }
            }
        }
        Ok(Self { mappings })
    }

    /// Trailing `/absolute/path` segment of a service reference, if any
    pub fn extract_receiver_path(service_ref: &str) -> Option<&str> {
        service_ref.find(":/").map(|idx| &service_ref[idx + 1..])
    }

    /// Resolve and confine; the file must exist.
    pub fn resolve_existing(&self, service_ref: &str) -> Result<PathBuf, ResolveError> {
        let (mapping, candidate) = self.candidate_for(service_ref)?;

        let resolved_root = mapping
            .local_root
            .canonicalize()
            .map_err(|e| ResolveError::Io(e.to_string()))?;
        let resolved = candidate
            .canonicalize()
            .map_err(|e| ResolveError::Io(e.to_string()))?;

        // Component-wise prefix check keeps /mnt/foo2 out of /mnt/foo
        if !resolved.starts_with(&resolved_root) {
            return Err(ResolveError::OutsideRoot);
        }
        Ok(resolved)
    }

    /// Pre-resolution candidate path. Never hand this to file access; it is
    /// for display and existence-independent bookkeeping only.
    pub fn resolve_unsafe(&self, service_ref: &str) -> Result<PathBuf, ResolveError> {
        self.candidate_for(service_ref).map(|(_, p)| p)
    }

    fn candidate_for(
        &self,
        service_ref: &str,
    ) -> Result<(&PathMapping, PathBuf), ResolveError> {
        let raw =
            Self::extract_receiver_path(service_ref).ok_or(ResolveError::NoPathInReference)?;
        let cleaned = clean_path(raw)?;

        let mapping = self
            .mappings
            .iter()
            .filter(|m| cleaned.starts_with(&m.receiver_root))
            .max_by_key(|m| m.receiver_root.components().count())
            .ok_or_else(|| ResolveError::NoMapping(cleaned.display().to_string()))?;

        let rel = cleaned
            .strip_prefix(&mapping.receiver_root)
            .expect("prefix was just matched");
        let candidate = if rel.as_os_str().is_empty() {
            mapping.local_root.clone()
        } else {
            mapping.local_root.join(rel)
        };
        Ok((mapping, candidate))
    }
}

/// POSIX-clean an absolute receiver path: collapse `.` and duplicate
/// separators, refuse anything relative or containing `..`.
fn clean_path(raw: &str) -> Result<PathBuf, ResolveError> {
    let p = Path::new(raw);
    if !p.is_absolute() {
        return Err(ResolveError::RelativePath);
    }
    let mut out = PathBuf::from("/");
    for comp in p.components() {
        match comp {
            Component::RootDir => {}
            Component::CurDir => {}
            Component::ParentDir => return Err(ResolveError::ParentTraversal),
            Component::Normal(seg) => out.push(seg),
            Component::Prefix(_) => return Err(ResolveError::RelativePath),
        }
    }
    Ok(out)
}
