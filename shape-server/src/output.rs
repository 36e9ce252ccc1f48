use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use shape_core::TriMesh;
use uuid::Uuid;

const FILE_PREFIX: &str = "shap_e_output_";

/// Generated meshes on the local filesystem, one OBJ file per request.
#[derive(Debug, Clone)]
pub struct OutputStore {
    dir: PathBuf,
}

impl OutputStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `mesh` under a fresh id and returns that id.
    pub async fn persist(&self, mesh: TriMesh) -> Result<Uuid> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let id = Uuid::new_v4();
        let path = self.dir.join(format!("{FILE_PREFIX}{id}.obj"));
        let bytes = tokio::task::spawn_blocking(move || mesh.to_obj_bytes())
            .await
            .context("mesh serialization task failed")??;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        tracing::info!("saved mesh to {}", path.display());
        Ok(id)
    }

    /// Path of a previously written file, or `None` if `filename` is not a
    /// plain file name or nothing was written under it.
    pub async fn resolve(&self, filename: &str) -> Option<PathBuf> {
        if !is_plain_file_name(filename) {
            return None;
        }
        let path = self.dir.join(format!("{FILE_PREFIX}{filename}"));
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(path),
            _ => None,
        }
    }
}

fn is_plain_file_name(filename: &str) -> bool {
    if filename.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(filename).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> OutputStore {
        OutputStore::new(std::env::temp_dir().join(format!("shape-server-{}", Uuid::new_v4())))
    }

    #[test]
    fn plain_file_names() {
        assert!(is_plain_file_name("0b7c.obj"));
        assert!(!is_plain_file_name(""));
        assert!(!is_plain_file_name("."));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name("../secret"));
        assert!(!is_plain_file_name("a/b.obj"));
        assert!(!is_plain_file_name("..\\b.obj"));
        assert!(!is_plain_file_name("/etc/passwd"));
    }

    #[tokio::test]
    async fn persist_then_resolve() {
        let store = temp_store();
        let mesh = TriMesh::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![[0, 1, 2]],
        );
        let id = store.persist(mesh).await.unwrap();

        let path = store.resolve(&format!("{id}.obj")).await.unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            format!("shap_e_output_{id}.obj")
        );
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("f 1 2 3"));

        assert!(store.resolve("missing.obj").await.is_none());
        std::fs::remove_dir_all(store.dir()).unwrap();
    }
}
