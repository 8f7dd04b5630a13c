use facegallery_store::{GalleryStore, StoreError};
use std::sync::Arc;
use std::time::Instant;
use zbus::interface;

pub const BUS_NAME: &str = "org.facegallery.Gallery1";
pub const OBJECT_PATH: &str = "/org/facegallery/Gallery1";

/// D-Bus review service for the face gallery.
///
/// Bus name: org.facegallery.Gallery1
/// Object path: /org/facegallery/Gallery1
pub struct GalleryService {
    store: Arc<GalleryStore>,
    mode: &'static str,
    started: Instant,
}

impl GalleryService {
    pub fn new(store: Arc<GalleryStore>, mode: &'static str) -> Self {
        Self {
            store,
            mode,
            started: Instant::now(),
        }
    }

    /// Run a store operation on the blocking pool; store calls take a
    /// mutex and may hit the disk.
    async fn blocking<T, F>(&self, op: F) -> zbus::fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&GalleryStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("store task failed: {e}")))?
            .map_err(to_fdo)
    }
}

fn to_fdo(e: StoreError) -> zbus::fdo::Error {
    match e {
        StoreError::PersonNotFound(_) | StoreError::SampleNotFound { .. } | StoreError::InvalidThreshold(_) => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        other => {
            tracing::warn!(error = %other, "review operation failed");
            zbus::fdo::Error::Failed(other.to_string())
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.facegallery.Gallery1")]
impl GalleryService {
    /// JSON array of persons with their samples (no embeddings).
    async fn list_persons(&self, only_unknowns: bool) -> zbus::fdo::Result<String> {
        tracing::info!(only_unknowns, "list_persons requested");
        let persons = self.blocking(move |s| s.list_persons(only_unknowns)).await?;
        to_json(&persons)
    }

    async fn rename(&self, global_id: &str, name: &str) -> zbus::fdo::Result<()> {
        tracing::info!(global_id, name, "rename requested");
        let (id, name) = (global_id.to_string(), name.to_string());
        self.blocking(move |s| s.rename(&id, &name)).await
    }

    /// Returns true if the person was removed with its last sample.
    async fn remove_sample(&self, global_id: &str, sample_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(global_id, sample_id, "remove_sample requested");
        let (id, sample) = (global_id.to_string(), sample_id.to_string());
        self.blocking(move |s| s.remove_sample(&id, &sample)).await
    }

    async fn delete_person(&self, global_id: &str) -> zbus::fdo::Result<()> {
        tracing::info!(global_id, "delete_person requested");
        let id = global_id.to_string();
        self.blocking(move |s| s.delete_person(&id)).await
    }

    async fn set_threshold(&self, global_id: &str, threshold: f64) -> zbus::fdo::Result<()> {
        tracing::info!(global_id, threshold, "set_threshold requested");
        let id = global_id.to_string();
        self.blocking(move |s| s.set_threshold(&id, threshold as f32)).await
    }

    /// Recalibrate every threshold; returns the number of persons updated.
    async fn calibrate(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("calibrate requested");
        let updated = self.blocking(|s| s.recalibrate()).await?;
        Ok(u32::try_from(updated).unwrap_or(u32::MAX))
    }

    /// JSON 2-D projection of the gallery.
    async fn project(&self) -> zbus::fdo::Result<String> {
        let projection = self.blocking(|s| s.project()).await?;
        to_json(&projection)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let stats = self.blocking(|s| s.stats()).await?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "mode": self.mode,
            "uptime_secs": self.started.elapsed().as_secs(),
            "database": self.store.db_path().display().to_string(),
            "persons": stats.persons,
            "unknown_persons": stats.unknown_persons,
            "samples": stats.samples,
        })
        .to_string())
    }
}

/// Register the service on the session bus.
pub async fn serve(service: GalleryService) -> zbus::Result<zbus::Connection> {
    zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegallery_core::Embedding;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_methods_without_bus() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(GalleryStore::open(dir.path().join("db"), dir.path().join("faces")).unwrap());
        let img = store.new_sample_path("jpeg");
        std::fs::write(&img, b"x").unwrap();
        let p = store.create_person(&Embedding::new(vec![1.0, 0.0]), &img, 0, None).unwrap();

        let service = GalleryService::new(Arc::clone(&store), "run");
        let listed: serde_json::Value = serde_json::from_str(&service.list_persons(true).await.unwrap()).unwrap();
        assert_eq!(listed[0]["global_id"], p.global_id);

        service.rename(&p.global_id, "Alice").await.unwrap();
        assert_eq!(store.get_by_id(&p.global_id).unwrap().unwrap().name, "Alice");

        assert!(matches!(
            service.set_threshold(&p.global_id, 2.0).await,
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
        assert!(matches!(
            service.delete_person("nope").await,
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));

        let status: serde_json::Value = serde_json::from_str(&service.status().await.unwrap()).unwrap();
        assert_eq!(status["persons"], 1);
        assert_eq!(status["unknown_persons"], 0);

        assert!(service.remove_sample(&p.global_id, &p.faces[0].id).await.unwrap());
        assert_eq!(store.count().unwrap(), 0);
    }
}
