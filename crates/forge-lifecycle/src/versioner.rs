use crate::VersionError;
use async_trait::async_trait;

/// Resolves a buildpack's download URL against its version metadata endpoint
#[async_trait]
pub trait Versioner: Send + Sync {
    async fn build(&self, url: &str, version_url: &str) -> Result<String, VersionError>;
}

/// Uses each buildpack's URL as given, for catalogs pinned to fixed releases
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticVersioner;

#[async_trait]
impl Versioner for StaticVersioner {
    async fn build(&self, url: &str, _version_url: &str) -> Result<String, VersionError> {
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_versioner_passes_url_through() {
        let url = StaticVersioner
            .build("https://example.com/go.zip", "https://example.com/latest")
            .await
            .unwrap();
        assert_eq!(url, "https://example.com/go.zip");
    }
}
