use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;

const SUFFIX_LEN: usize = 6;
const CREATE_ATTEMPTS: usize = 5;

/// A scratch directory owned by exactly one invocation
///
/// The directory is removed by [`Workspace::remove`], or on drop if the
/// invocation never got that far.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Creates a fresh, uniquely named directory under `root`
    pub async fn create(root: &Path) -> io::Result<Self> {
        tokio::fs::create_dir_all(root).await?;

        let mut last_err = None;
        for _ in 0..CREATE_ATTEMPTS {
            let dir = root.join(unique_name());
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => {
                    return Ok(Self {
                        dir,
                        removed: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    log::debug!("Workspace {} already exists, retrying", dir.display());
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| io::Error::other("unable to create workspace")))
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Writes a file into the workspace and returns its path
    pub async fn write_file(&self, name: &str, content: &str) -> io::Result<PathBuf> {
        let path = self.dir.join(name);
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }

    /// Removes the directory and everything in it, swallowing failures
    pub async fn remove(mut self) {
        self.removed = true;
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to remove workspace {}: {e}", self.dir.display());
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to remove workspace {}: {e}", self.dir.display());
            }
        }
    }
}

/// `<unix millis>-<random lowercase alphanumerics>`
fn unique_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}-{suffix}", Utc::now().timestamp_millis())
}
