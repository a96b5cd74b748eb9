//! Model creation and mesh validation seams, plus file-based implementations.
//!
//! Mesh generation and repair live outside this crate. The orchestrator only sees
//! these two traits; callers plug in whatever produces and checks their models.

use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::print_job::{ModelFormat, ShapeParams};

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("model creation failed: {0}")]
    Creation(String),
    #[error("model file not found: {0}")]
    NotFound(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces a model file for the given shape.
pub trait ModelSource: Send + Sync {
    fn create_model(&self, params: &ShapeParams, format: ModelFormat) -> Result<PathBuf, CollaboratorError>;
}

/// Checks a model file. `Err` carries human-readable issues.
pub trait MeshValidator: Send + Sync {
    fn validate_mesh(&self, path: &Path) -> Result<(), Vec<String>>;
}

/// "Creates" a model by resolving an existing file: `params.source_path` when set,
/// otherwise `{model_dir}/{shape}.{ext}`.
#[derive(Debug, Clone, Default)]
pub struct FileModelSource {
    model_dir: Option<PathBuf>,
}

impl FileModelSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_dir(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: Some(model_dir.into()),
        }
    }
}

impl ModelSource for FileModelSource {
    fn create_model(&self, params: &ShapeParams, format: ModelFormat) -> Result<PathBuf, CollaboratorError> {
        let path = match (&params.source_path, &self.model_dir) {
            (Some(path), _) => path.clone(),
            (None, Some(dir)) => dir.join(format!("{}.{}", params.shape, format.extension())),
            (None, None) => {
                return Err(CollaboratorError::Creation(format!(
                    "no model file for shape '{}' and no model directory configured",
                    params.shape
                )))
            }
        };
        if !path.is_file() {
            return Err(CollaboratorError::NotFound(path));
        }
        Ok(path)
    }
}

/// Cheap structural checks that catch truncated or mislabelled files.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicMeshValidator;

const STL_HEADER_LEN: u64 = 84;
const STL_TRIANGLE_LEN: u64 = 50;

impl BasicMeshValidator {
    fn check_stl(path: &Path, len: u64, issues: &mut Vec<String>) -> std::io::Result<()> {
        let mut head = Vec::with_capacity(STL_HEADER_LEN as usize);
        std::fs::File::open(path)?
            .take(STL_HEADER_LEN)
            .read_to_end(&mut head)?;

        if len >= STL_HEADER_LEN {
            let declared = u32::from_le_bytes([head[80], head[81], head[82], head[83]]) as u64;
            if STL_HEADER_LEN + declared * STL_TRIANGLE_LEN == len {
                if declared == 0 {
                    issues.push("binary STL declares no triangles".to_string());
                }
                return Ok(());
            }
            if !head.starts_with(b"solid") {
                issues.push(format!(
                    "binary STL declares {} triangles but holds {} bytes",
                    declared, len
                ));
                return Ok(());
            }
        }

        if head.starts_with(b"solid") {
            let text = std::fs::read_to_string(path).unwrap_or_default();
            if !text.contains("facet") {
                issues.push("ASCII STL contains no facets".to_string());
            }
            if !text.trim_end().contains("endsolid") {
                issues.push("ASCII STL is truncated (no endsolid)".to_string());
            }
        } else {
            issues.push("file is neither ASCII nor binary STL".to_string());
        }
        Ok(())
    }

    fn check_3mf(path: &Path, issues: &mut Vec<String>) -> std::io::Result<()> {
        let mut magic = [0u8; 4];
        let read = std::fs::File::open(path)?.read(&mut magic)?;
        if read < 4 || &magic != b"PK\x03\x04" {
            issues.push("3MF file is not a zip archive".to_string());
        }
        Ok(())
    }

    fn check_obj(path: &Path, issues: &mut Vec<String>) -> std::io::Result<()> {
        let text = std::fs::read_to_string(path)?;
        if !text.lines().any(|line| line.trim_start().starts_with("v ")) {
            issues.push("OBJ file has no vertices".to_string());
        }
        if !text.lines().any(|line| line.trim_start().starts_with("f ")) {
            issues.push("OBJ file has no faces".to_string());
        }
        Ok(())
    }
}

impl MeshValidator for BasicMeshValidator {
    fn validate_mesh(&self, path: &Path) -> Result<(), Vec<String>> {
        let len = match std::fs::metadata(path) {
            Ok(metadata) => metadata.len(),
            Err(e) => return Err(vec![format!("cannot read {}: {}", path.display(), e)]),
        };
        if len == 0 {
            return Err(vec!["model file is empty".to_string()]);
        }

        let mut issues = Vec::new();
        let checked = match ModelFormat::from_path(path) {
            Some(ModelFormat::Stl) => Self::check_stl(path, len, &mut issues),
            Some(ModelFormat::ThreeMf) => Self::check_3mf(path, &mut issues),
            Some(ModelFormat::Obj) => Self::check_obj(path, &mut issues),
            None => {
                issues.push(format!("unknown model extension: {}", path.display()));
                Ok(())
            }
        };
        if let Err(e) = checked {
            issues.push(format!("cannot read {}: {}", path.display(), e));
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}
