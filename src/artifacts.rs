//! Local directory receiving salvaged logs, bugreports and tombstones.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while preparing or writing artifacts.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to write artifact {path}: {message}")]
pub struct ArtifactError {
    /// Path that could not be written.
    pub path: Utf8PathBuf,
    /// Operating system error string.
    pub message: String,
}

/// A per-session subdirectory of the configured artifact root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactDir {
    root: Utf8PathBuf,
}

impl ArtifactDir {
    /// Creates `<base>/<session>` where `session` is a fresh identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError`] when the directory cannot be created.
    pub fn create(base: &Utf8Path) -> Result<Self, ArtifactError> {
        let session = format!("session-{}", Uuid::new_v4().simple());
        Self::create_named(base, &session)
    }

    /// Creates `<base>/<name>`.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError`] when the directory cannot be created.
    pub fn create_named(base: &Utf8Path, name: &str) -> Result<Self, ArtifactError> {
        let root = base.join(name);
        let to_error = |err: std::io::Error| ArtifactError {
            path: root.clone(),
            message: err.to_string(),
        };
        Dir::create_ambient_dir_all(&root, ambient_authority()).map_err(to_error)?;
        Ok(Self { root })
    }

    /// Root of this session's artifacts.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Local path an artifact called `name` is stored at. Path separators in
    /// `name` are flattened.
    #[must_use]
    pub fn path_for(&self, name: &str) -> Utf8PathBuf {
        self.root.join(sanitise(name))
    }

    /// Writes `contents` to the artifact `name` and returns its path.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError`] when the file cannot be written.
    pub fn write(&self, name: &str, contents: &str) -> Result<Utf8PathBuf, ArtifactError> {
        let file_name = sanitise(name);
        let path = self.root.join(&file_name);
        let to_error = |err: std::io::Error| ArtifactError {
            path: path.clone(),
            message: err.to_string(),
        };
        let dir = Dir::open_ambient_dir(&self.root, ambient_authority()).map_err(to_error)?;
        dir.write(&file_name, contents).map_err(to_error)?;
        Ok(path)
    }
}

fn sanitise(name: &str) -> String {
    name.trim_start_matches('/')
        .chars()
        .map(|ch| if ch == '/' || ch == '\\' { '_' } else { ch })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
        (dir, path)
    }

    #[test]
    fn write_flattens_remote_paths() {
        let (_guard, base) = base();
        let artifacts = ArtifactDir::create_named(&base, "run").expect("create");

        let path = artifacts
            .write("/var/log/kern.log", "kernel")
            .expect("write");

        assert_eq!(path, base.join("run").join("var_log_kern.log"));
        let written = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(written, "kernel");
    }

    #[test]
    fn create_uses_unique_session_directories() {
        let (_guard, base) = base();
        let first = ArtifactDir::create(&base).expect("first");
        let second = ArtifactDir::create(&base).expect("second");
        assert_ne!(first.root(), second.root());
        assert!(first.root().is_dir());
    }
}
