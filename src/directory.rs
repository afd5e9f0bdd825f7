use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::ArtifactRef;

/// Catalog collaborator. The engine never stores resource metadata; it asks
/// the directory whether a resource exists, who owns it, and what to call it
/// on the rendered token.
#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    async fn exists(&self, resource_id: Ulid) -> bool;
    async fn owner(&self, resource_id: Ulid) -> Option<Ulid>;
    async fn name(&self, resource_id: Ulid) -> Option<String>;
}

/// Token artifact collaborator (e.g. a barcode renderer writing image files).
/// `release` is fire-and-forget from the engine's point of view: a `false`
/// return is logged, never retried.
#[async_trait]
pub trait ArtifactRenderer: Send + Sync {
    async fn render(&self, payload: &str) -> std::io::Result<ArtifactRef>;
    async fn release(&self, artifact: &ArtifactRef) -> bool;
}

// ── In-memory implementations ────────────────────────────────────

#[derive(Debug, Clone)]
struct ResourceEntry {
    name: String,
    owner: Ulid,
}

/// Map-backed directory for tests and single-process embedders.
#[derive(Default)]
pub struct InMemoryDirectory {
    entries: DashMap<Ulid, ResourceEntry>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, resource_id: Ulid, name: impl Into<String>, owner: Ulid) {
        self.entries.insert(
            resource_id,
            ResourceEntry {
                name: name.into(),
                owner,
            },
        );
    }

    pub fn remove(&self, resource_id: Ulid) {
        self.entries.remove(&resource_id);
    }
}

#[async_trait]
impl ResourceDirectory for InMemoryDirectory {
    async fn exists(&self, resource_id: Ulid) -> bool {
        self.entries.contains_key(&resource_id)
    }

    async fn owner(&self, resource_id: Ulid) -> Option<Ulid> {
        self.entries.get(&resource_id).map(|e| e.owner)
    }

    async fn name(&self, resource_id: Ulid) -> Option<String> {
        self.entries.get(&resource_id).map(|e| e.name.clone())
    }
}

/// Renderer that keeps payloads in a map instead of rendering images.
#[derive(Default)]
pub struct InMemoryRenderer {
    artifacts: DashMap<String, String>,
}

impl InMemoryRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload behind a live artifact, if any. Lets tests replay what a
    /// scanner would read off the rendered token.
    pub fn payload_of(&self, artifact: &ArtifactRef) -> Option<String> {
        self.artifacts.get(artifact.as_str()).map(|p| p.clone())
    }

    pub fn live_artifacts(&self) -> usize {
        self.artifacts.len()
    }
}

#[async_trait]
impl ArtifactRenderer for InMemoryRenderer {
    async fn render(&self, payload: &str) -> std::io::Result<ArtifactRef> {
        let artifact = ArtifactRef(format!("artifact/{}", Ulid::new()));
        self.artifacts.insert(artifact.0.clone(), payload.to_string());
        Ok(artifact)
    }

    async fn release(&self, artifact: &ArtifactRef) -> bool {
        self.artifacts.remove(artifact.as_str()).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_lookups() {
        let dir = InMemoryDirectory::new();
        let rid = Ulid::new();
        let owner = Ulid::new();
        dir.add(rid, "Tennis Court", owner);

        assert!(dir.exists(rid).await);
        assert_eq!(dir.owner(rid).await, Some(owner));
        assert_eq!(dir.name(rid).await.as_deref(), Some("Tennis Court"));

        dir.remove(rid);
        assert!(!dir.exists(rid).await);
        assert_eq!(dir.owner(rid).await, None);
    }

    #[tokio::test]
    async fn renderer_render_and_release() {
        let renderer = InMemoryRenderer::new();
        let artifact = renderer.render("payload-bytes").await.unwrap();
        assert_eq!(renderer.payload_of(&artifact).as_deref(), Some("payload-bytes"));
        assert_eq!(renderer.live_artifacts(), 1);

        assert!(renderer.release(&artifact).await);
        assert_eq!(renderer.live_artifacts(), 0);
        // Second release finds nothing
        assert!(!renderer.release(&artifact).await);
    }
}
