use async_trait::async_trait;
use forge_engine::{EngineError, ProgressStream};
use futures::StreamExt;
use tracing::{debug, info};

/// Reports progress of a long image operation while driving it to completion
#[async_trait]
pub trait Loader: Send + Sync {
    async fn loading(&self, name: &str, progress: ProgressStream) -> Result<(), EngineError>;
}

/// Drains the progress and returns the first error
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLoader;

#[async_trait]
impl Loader for NoopLoader {
    async fn loading(&self, _name: &str, mut progress: ProgressStream) -> Result<(), EngineError> {
        while let Some(record) = progress.next().await {
            record?;
        }
        Ok(())
    }
}

/// Like [`NoopLoader`], also logging every record
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLoader;

#[async_trait]
impl Loader for TracingLoader {
    async fn loading(&self, name: &str, mut progress: ProgressStream) -> Result<(), EngineError> {
        info!("{}: started", name);
        while let Some(record) = progress.next().await {
            let record = record?;
            match (record.current, record.total) {
                (Some(current), Some(total)) => debug!(
                    "{}: {} {} ({}/{})",
                    name,
                    record.id.as_deref().unwrap_or_default(),
                    record.status,
                    current,
                    total
                ),
                _ => debug!(
                    "{}: {} {}",
                    name,
                    record.id.as_deref().unwrap_or_default(),
                    record.status
                ),
            }
        }
        info!("{}: done", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_engine::Progress;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn progress(records: Vec<Result<Progress, EngineError>>) -> ProgressStream {
        stream::iter(records).boxed()
    }

    #[test]
    fn test_noop_loader_drains_everything() {
        let polled = Arc::new(AtomicUsize::new(0));
        let counter = polled.clone();
        let records = stream::iter(0..3)
            .map(move |i| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Progress::status(format!("step {}", i)))
            })
            .boxed();

        tokio_test::block_on(NoopLoader.loading("Image", records)).unwrap();
        assert_eq!(polled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_noop_loader_returns_first_error() {
        let records = progress(vec![
            Ok(Progress::status("Pulling fs layer")),
            Err(EngineError::Other("manifest unknown".to_string())),
            Err(EngineError::Cancelled),
        ]);

        let err = NoopLoader.loading("Image", records).await.unwrap_err();
        assert!(matches!(err, EngineError::Other(msg) if msg == "manifest unknown"));
    }

    #[tokio::test]
    async fn test_tracing_loader_accepts_partial_records() {
        let records = progress(vec![
            Ok(Progress {
                id: Some("a1b2".to_string()),
                status: "Downloading".to_string(),
                current: Some(10),
                total: Some(100),
            }),
            Ok(Progress::status("Step 1/3 : FROM stack")),
        ]);

        TracingLoader.loading("Image", records).await.unwrap();
    }
}
