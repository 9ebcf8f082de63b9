//! Mount resolution: user-declared mount intents become validated specs.
//!
//! Mounts are applied in declaration order. If two declarations target the
//! same in-container path, the engine applies the last one — last wins.

use std::path::{Path, PathBuf};

use tracing::warn;

/// Access mode of a mount, as seen from inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

impl AccessMode {
    fn suffix(self) -> &'static str {
        match self {
            AccessMode::ReadWrite => "rw",
            AccessMode::ReadOnly => "ro",
        }
    }
}

/// A mount as declared by the user: host path not yet validated.
#[derive(Debug, Clone)]
pub struct MountDecl {
    pub host: String,
    pub container: String,
    pub mode: AccessMode,
}

impl MountDecl {
    pub fn new(host: impl Into<String>, container: impl Into<String>, mode: AccessMode) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            mode,
        }
    }
}

/// A validated mount: absolute, normalized host directory.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub host: PathBuf,
    pub container: String,
    pub mode: AccessMode,
}

impl MountSpec {
    /// The engine's `-v host:container:mode` argument.
    pub fn volume_arg(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host.display(),
            self.container,
            self.mode.suffix()
        )
    }
}

/// Turns declared mounts into validated specs.
///
/// Tilde and relative paths are expanded to absolute host paths. A host
/// path that does not exist or is not a directory is dropped with a
/// warning, never a fatal error. `no_mount` opts out entirely and yields
/// an empty list regardless of the declarations.
pub fn resolve(declared: &[MountDecl], no_mount: bool) -> Vec<MountSpec> {
    if no_mount {
        return Vec::new();
    }

    let mut specs = Vec::with_capacity(declared.len());
    for decl in declared {
        let expanded = shellexpand::tilde(&decl.host);
        match normalize(Path::new(expanded.as_ref())) {
            Some(host) if host.is_dir() => {
                specs.push(MountSpec {
                    host,
                    container: decl.container.clone(),
                    mode: decl.mode,
                });
            }
            _ => {
                warn!(
                    host = %decl.host,
                    container = %decl.container,
                    "mount skipped: host path missing or not a directory"
                );
            }
        }
    }
    specs
}

/// Absolute, symlink-free form of the path. None if it does not exist.
fn normalize(path: &Path) -> Option<PathBuf> {
    std::fs::canonicalize(path).ok()
}
