use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

/// Where uploaded video bytes live.
pub trait VideoFileStore: Send + Sync {
    fn save(&self, video_id: &str, filename: &str, bytes: &[u8]) -> Result<PathBuf>;

    /// Remove everything stored for a video. Missing files are not an error.
    fn remove(&self, video_id: &str) -> Result<()>;
}

/// Stores uploads under `<root>/<video_id>/<filename>`.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Keep only the final path component so a filename cannot escape the root.
fn safe_file_name(filename: &str) -> String {
    let name = Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::trim)
        .unwrap_or_default();
    if name.is_empty() || name == "." || name == ".." {
        "upload.bin".to_string()
    } else {
        name.to_string()
    }
}

impl VideoFileStore for LocalFileStore {
    fn save(&self, video_id: &str, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.root.join(video_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create upload directory {}", dir.display()))?;

        let path = dir.join(safe_file_name(filename));
        let tmp_path = path.with_extension("partial");
        fs::write(&tmp_path, bytes)
            .with_context(|| format!("failed to write upload to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to move upload into {}", path.display()))?;
        Ok(path)
    }

    fn remove(&self, video_id: &str) -> Result<()> {
        let dir = self.root.join(video_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", dir.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saves_under_video_directory_and_strips_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        let path = store.save("v1", "../../etc/clip.mp4", b"bytes").unwrap();
        assert_eq!(path, dir.path().join("v1").join("clip.mp4"));
        assert_eq!(fs::read(&path).unwrap(), b"bytes");

        store.remove("v1").unwrap();
        assert!(!path.exists());
        store.remove("v1").unwrap();
    }
}
