//! Scene collaborators: how volumes and transforms reach the engine's disk format.

use super::{is_readable_transform_file, read_nrrd, read_transform_file, write_nrrd, write_transform_file, Volume};
use crate::spatial::{Transform, TransformNode};
use anyhow::{bail, Context};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A volume handed to the orchestrator, either already on disk or held in memory.
#[derive(Debug, Clone)]
pub enum VolumeNode {
    File(PathBuf),
    Memory { name: String, volume: Arc<Volume> },
}

impl VolumeNode {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        VolumeNode::File(path.into())
    }

    pub fn memory(name: impl Into<String>, volume: Volume) -> Self {
        VolumeNode::Memory {
            name: name.into(),
            volume: Arc::new(volume),
        }
    }

    pub fn name(&self) -> String {
        match self {
            VolumeNode::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            VolumeNode::Memory { name, .. } => name.clone(),
        }
    }

    /// True when the node carries no image data at all.
    pub fn is_empty(&self) -> bool {
        match self {
            VolumeNode::File(path) => path.as_os_str().is_empty(),
            VolumeNode::Memory { volume, .. } => volume.is_empty(),
        }
    }

    /// File extension the exported copy will use (`nrrd` for in-memory volumes).
    pub fn extension(&self) -> String {
        match self {
            VolumeNode::File(path) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_ascii_lowercase())
                    .unwrap_or_default();
                if name.ends_with(".nii.gz") {
                    "nii.gz".to_string()
                } else {
                    path.extension()
                        .map(|e| e.to_string_lossy().to_ascii_lowercase())
                        .unwrap_or_else(|| "nrrd".to_string())
                }
            }
            VolumeNode::Memory { .. } => "nrrd".to_string(),
        }
    }
}

/// Export and import operations the orchestrator performs around an engine run.
///
/// All methods are synchronous and are called on the caller's thread before
/// the engine is launched or after it has exited.
pub trait SceneIo {
    fn export_volume(&self, volume: &VolumeNode, path: &Path) -> crate::Result<()>;

    fn export_transform(&self, transform: &TransformNode, path: &Path) -> crate::Result<()>;

    /// Load a transform artifact; `Ok(None)` when the file holds no transform.
    fn import_transform(&self, path: &Path) -> crate::Result<Option<Transform>>;

    /// Whether `import_transform` understands the file's format. Readable
    /// artifacts are preferred when several could be the result.
    fn can_import(&self, _path: &Path) -> bool {
        true
    }

    fn load_volume(&self, volume: &VolumeNode) -> crate::Result<Arc<Volume>>;
}

/// Filesystem-backed [`SceneIo`].
#[derive(Debug, Clone, Default)]
pub struct FileSceneIo {
    /// Compress NRRD files written from in-memory volumes.
    pub gzip: bool,
}

impl FileSceneIo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SceneIo for FileSceneIo {
    fn export_volume(&self, volume: &VolumeNode, path: &Path) -> crate::Result<()> {
        match volume {
            VolumeNode::File(source) => {
                if !source.is_file() {
                    bail!("Volume file {} does not exist", source.display());
                }
                if volume.extension() == "nhdr" {
                    bail!(
                        "Detached NRRD header {} cannot be staged; convert it to a single .nrrd file",
                        source.display()
                    );
                }
                fs::copy(source, path)
                    .with_context(|| format!("copying {} to {}", source.display(), path.display()))?;
                Ok(())
            }
            VolumeNode::Memory { volume, .. } => write_nrrd(volume, path, self.gzip),
        }
    }

    fn export_transform(&self, transform: &TransformNode, path: &Path) -> crate::Result<()> {
        write_transform_file(&transform.transform(), path)
    }

    fn import_transform(&self, path: &Path) -> crate::Result<Option<Transform>> {
        read_transform_file(path)
    }

    fn can_import(&self, path: &Path) -> bool {
        is_readable_transform_file(path)
    }

    fn load_volume(&self, volume: &VolumeNode) -> crate::Result<Arc<Volume>> {
        match volume {
            VolumeNode::File(path) => {
                let ext = volume.extension();
                if ext != "nrrd" {
                    bail!("Only NRRD volumes can be loaded, got '{}'", path.display());
                }
                Ok(Arc::new(read_nrrd(path)?))
            }
            VolumeNode::Memory { volume, .. } => Ok(Arc::clone(volume)),
        }
    }
}
