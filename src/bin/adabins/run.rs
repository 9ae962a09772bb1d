use log::warn;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunDirError {
    #[error("model directory {0:?} already exists (pass --overwrite to replace it)")]
    Exists(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// `<logging_root>/<exp_name>` with its `summaries/` and `checkpoints/` children.
#[derive(Debug, Clone)]
pub struct RunDir {
    pub root: PathBuf,
    pub summaries: PathBuf,
    pub checkpoints: PathBuf,
}

impl RunDir {
    pub fn create(root: impl AsRef<Path>, overwrite: bool) -> Result<Self, RunDirError> {
        let root = root.as_ref().to_path_buf();

        if root.exists() {
            if !overwrite {
                return Err(RunDirError::Exists(root));
            }
            warn!("removing existing model directory {}", root.display());
            fs::remove_dir_all(&root)?;
        }

        let summaries = root.join("summaries");
        let checkpoints = root.join("checkpoints");
        fs::create_dir_all(&summaries)?;
        fs::create_dir_all(&checkpoints)?;

        Ok(Self {
            root,
            summaries,
            checkpoints,
        })
    }

    pub fn current_checkpoint(&self) -> PathBuf {
        self.checkpoints.join("model_current.pth")
    }

    pub fn epoch_checkpoint(&self, epoch: usize) -> PathBuf {
        self.checkpoints.join(format!("model_epoch_{epoch:04}.pth"))
    }

    pub fn final_checkpoint(&self) -> PathBuf {
        self.checkpoints.join("model_final.pth")
    }
}
