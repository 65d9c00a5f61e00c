use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "state.lock";

/// Directory layout for one backend under the unikit home.
///
/// ```text
/// <home>/<backend>/state.json
/// <home>/<backend>/images/<name>/{boot.img,program.bin,cmdline}
/// <home>/<backend>/instances/<name>/stdout
/// <home>/<backend>/volumes/<name>/data.img
/// ```
///
/// Subdirectories are created on [`initialize`](Self::initialize) or on demand
/// by the writers.
#[derive(Debug, Clone)]
pub struct BackendLayout {
    root: PathBuf,
}

impl BackendLayout {
    pub fn new(home: impl AsRef<Path>, backend: &str) -> Self {
        Self {
            root: home.as_ref().join(backend),
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn state_file(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    #[inline]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    #[inline]
    pub fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }

    #[inline]
    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    #[inline]
    pub fn image_dir(&self, name: &str) -> PathBuf {
        self.images_dir().join(name)
    }

    #[inline]
    pub fn boot_image_path(&self, name: &str) -> PathBuf {
        self.image_dir(name).join("boot.img")
    }

    /// Kernel binary handed to the VMM with `-kernel`.
    #[inline]
    pub fn kernel_path(&self, name: &str) -> PathBuf {
        self.image_dir(name).join("program.bin")
    }

    /// Boot descriptor stored next to the kernel at stage time.
    #[inline]
    pub fn cmdline_path(&self, name: &str) -> PathBuf {
        self.image_dir(name).join("cmdline")
    }

    #[inline]
    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.instances_dir().join(name)
    }

    #[inline]
    pub fn instance_log_path(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join("stdout")
    }

    #[inline]
    pub fn volume_dir(&self, name: &str) -> PathBuf {
        self.volumes_dir().join(name)
    }

    #[inline]
    pub fn volume_image_path(&self, name: &str) -> PathBuf {
        self.volume_dir(name).join("data.img")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.images_dir())?;
        fs::create_dir_all(self.instances_dir())?;
        fs::create_dir_all(self.volumes_dir())?;
        Ok(())
    }
}
