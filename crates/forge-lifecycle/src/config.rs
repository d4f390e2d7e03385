use crate::app_config::Buildpacks;
use crate::units::to_megabytes;
use crate::ForgeError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_IMAGE_TAG: &str = "forge";
pub const DEFAULT_QUOTA: &str = "1024m";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgeConfig {
    /// Tag of the staging image built from the stack and system buildpacks
    pub image_tag: String,
    pub default_memory: String,
    pub default_disk_quota: String,
    #[serde(default)]
    pub buildpacks: Buildpacks,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            image_tag: DEFAULT_IMAGE_TAG.to_string(),
            default_memory: DEFAULT_QUOTA.to_string(),
            default_disk_quota: DEFAULT_QUOTA.to_string(),
            buildpacks: Buildpacks::default(),
        }
    }
}

impl ForgeConfig {
    /// Defaults overlaid with `FORGE_*` environment variables
    pub fn from_env() -> Result<Self, ForgeError> {
        let defaults = Self::default();
        let config = Self {
            image_tag: std::env::var("FORGE_IMAGE_TAG")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.image_tag),
            default_memory: std::env::var("FORGE_DEFAULT_MEMORY")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.default_memory),
            default_disk_quota: std::env::var("FORGE_DEFAULT_DISK_QUOTA")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.default_disk_quota),
            buildpacks: defaults.buildpacks,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_buildpacks(mut self, buildpacks: impl Into<Buildpacks>) -> Self {
        self.buildpacks = buildpacks.into();
        self
    }

    pub fn validate(&self) -> Result<(), ForgeError> {
        if self.image_tag.trim().is_empty() {
            return Err(ForgeError::Config("image tag must not be empty".to_string()));
        }
        to_megabytes(&self.default_memory)?;
        to_megabytes(&self.default_disk_quota)?;
        Ok(())
    }
}
