//! Deployment directory layout

use std::path::PathBuf;

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Name of the env file consumed by the launched container
pub const ENV_FILE_NAME: &str = ".env";

/// Container-side mount points for the service's state
pub const CONTAINER_DATA_DIR: &str = "/app/data";
pub const CONTAINER_LOGS_DIR: &str = "/app/logs";

/// Files and directories under the deployment directory.
///
/// Only the env file belongs to the deployer. `data/` and `logs/` hold the
/// service's database and logs; the deployer only makes sure they exist.
#[derive(Debug, Clone)]
pub struct DeploymentLayout {
    /// Base directory for the deployment
    pub base_dir: PathBuf,
}

impl DeploymentLayout {
    /// Create a new layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn base(&self) -> Dir {
        Dir::new(&self.base_dir)
    }

    /// Runtime configuration file, rewritten every run
    pub fn env_file(&self) -> File {
        self.base().file(ENV_FILE_NAME)
    }

    /// Service database directory
    pub fn data_dir(&self) -> Dir {
        self.base().subdir("data")
    }

    /// Service log directory
    pub fn logs_dir(&self) -> Dir {
        self.base().subdir("logs")
    }

    /// Bind mounts for the service container
    pub fn volumes(&self) -> Vec<(PathBuf, String)> {
        vec![
            (self.data_dir().path().to_path_buf(), CONTAINER_DATA_DIR.to_string()),
            (self.logs_dir().path().to_path_buf(), CONTAINER_LOGS_DIR.to_string()),
        ]
    }

    /// Create missing directories; existing contents are left alone
    pub async fn setup(&self) -> Result<(), DeployError> {
        self.base().create().await?;
        self.data_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for DeploymentLayout {
    fn default() -> Self {
        Self::new("/opt/bot")
    }
}
