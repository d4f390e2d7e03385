//! Staging pipeline: build the staging image, run the builder against the app
//! source and hand back the droplet.

use crate::app_config::{AppConfig, Colorizer};
use crate::config::ForgeConfig;
use crate::env::{map_to_env, merge_maps, staging_env};
use crate::loader::{Loader, NoopLoader};
use crate::script::{self, BuildpackInfo, StagingScript};
use crate::versioner::Versioner;
use crate::{close_container, ForgeError};
use async_trait::async_trait;
use forge_engine::{
    stdout_sink, Container, ContainerEngine, ContainerSpec, HostSpec, Image, LogSink, Stream,
};
use std::collections::BTreeMap;
use std::io::{self, SeekFrom};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite};
use tracing::{info, warn};

/// Build cache carried between stagings: read once, then reset and rewritten
#[async_trait]
pub trait CacheStore: Send {
    async fn reset(&mut self) -> io::Result<()>;

    fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin);

    fn writer(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin);
}

#[async_trait]
impl CacheStore for tokio::fs::File {
    async fn reset(&mut self) -> io::Result<()> {
        self.set_len(0).await?;
        self.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }

    fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        self
    }

    fn writer(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        self
    }
}

#[async_trait]
impl CacheStore for io::Cursor<Vec<u8>> {
    async fn reset(&mut self) -> io::Result<()> {
        self.get_mut().clear();
        self.set_position(0);
        Ok(())
    }

    fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        self
    }

    fn writer(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        self
    }
}

pub struct StageConfig<'a> {
    /// Application source as a (possibly compressed) tar
    pub app_tar: Box<dyn AsyncRead + Send + Unpin>,
    pub cache: &'a mut dyn CacheStore,
    /// Skip seeding `/tmp/cache` from `cache`
    pub cache_empty: bool,
    /// Custom buildpack zips keyed by checksum
    pub buildpack_zips: BTreeMap<String, Stream>,
    /// Lifecycle binaries to place at `/lifecycle` when the image lacks them
    pub lifecycle: Option<Stream>,
    pub stack: String,
    pub app_dir: Option<String>,
    pub force_detect: bool,
    pub rsync: bool,
    pub color: Colorizer,
    pub app_config: AppConfig,
}

pub struct Stager {
    config: ForgeConfig,
    logs: LogSink,
    loader: Arc<dyn Loader>,
    versioner: Arc<dyn Versioner>,
    engine: Arc<dyn ContainerEngine>,
    image: Arc<dyn Image>,
}

impl Stager {
    pub fn new(
        config: ForgeConfig,
        engine: Arc<dyn ContainerEngine>,
        image: Arc<dyn Image>,
        versioner: Arc<dyn Versioner>,
    ) -> Self {
        Self {
            config,
            logs: stdout_sink(),
            loader: Arc::new(NoopLoader),
            versioner,
            engine,
            image,
        }
    }

    pub fn with_logs(mut self, logs: LogSink) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn image_tag(&self) -> &str {
        &self.config.image_tag
    }

    /// Stage the app and return its droplet. The staging container is removed
    /// once the droplet has been consumed, or immediately on failure.
    pub async fn stage(&self, config: StageConfig<'_>) -> Result<Stream, ForgeError> {
        let StageConfig {
            mut app_tar,
            cache,
            cache_empty,
            buildpack_zips,
            lifecycle,
            stack,
            app_dir,
            force_detect,
            rsync,
            color,
            app_config,
        } = config;

        self.build_dockerfile(&stack).await?;

        let checksums: Vec<String> = buildpack_zips.keys().cloned().collect();
        let spec = self
            .container_spec(&app_config, &checksums, force_detect, rsync)
            .await?;
        let remote_dir = if rsync { "/tmp/local" } else { "/tmp/app" };
        let host = app_dir
            .as_deref()
            .filter(|dir| !dir.is_empty())
            .map(|dir| HostSpec::bind(dir, remote_dir));

        let contr = self
            .engine
            .new_container(&format!("{}-staging", app_config.name), spec, host)
            .await?;

        let prefix = color(&format!("[{}] ", app_config.name));
        let staged = self
            .run_builder(
                contr.as_ref(),
                lifecycle,
                buildpack_zips,
                &mut *app_tar,
                cache,
                cache_empty,
                &prefix,
            )
            .await;

        let droplet = match staged {
            Ok(()) => contr
                .stream_file_from("/droplet")
                .await
                .map_err(ForgeError::from),
            Err(e) => Err(e),
        };

        match droplet {
            Ok(droplet) => Ok(droplet.bind_container(contr)),
            Err(e) => {
                close_container(contr).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_builder(
        &self,
        contr: &dyn Container,
        lifecycle: Option<Stream>,
        buildpack_zips: BTreeMap<String, Stream>,
        app_tar: &mut (dyn AsyncRead + Send + Unpin),
        cache: &mut dyn CacheStore,
        cache_empty: bool,
        prefix: &str,
    ) -> Result<(), ForgeError> {
        if let Some(lifecycle) = lifecycle {
            contr.mkdir("/lifecycle").await?;
            contr.stream_tar_to(lifecycle, "/lifecycle").await?;
        }
        for (checksum, zip) in buildpack_zips {
            contr
                .stream_file_to(zip, &format!("/tmp/{}.zip", checksum))
                .await?;
        }

        contr.extract_to(app_tar, "/tmp/app").await?;
        if !cache_empty {
            contr.extract_to(cache.reader(), "/tmp/cache").await?;
        }

        let status = contr.start(prefix, self.logs.clone(), None).await?;
        if status != 0 {
            return Err(ForgeError::ContainerExited { status });
        }

        cache.reset().await?;
        let output_cache = contr.stream_file_from("/tmp/output-cache").await?;
        output_cache.out(cache.writer()).await?;
        Ok(())
    }

    async fn container_spec(
        &self,
        app: &AppConfig,
        checksums: &[String],
        force_detect: bool,
        rsync: bool,
    ) -> Result<ContainerSpec, ForgeError> {
        let (buildpacks, detect) = if app.buildpack.is_empty() && app.buildpacks.is_empty() {
            (self.config.buildpacks.names(), true)
        } else if !app.buildpacks.is_empty() {
            (app.buildpacks.clone(), false)
        } else {
            (vec![app.buildpack.clone()], false)
        };
        let detect = detect || force_detect;

        if detect {
            (self.logs)("Buildpack: will detect".to_string()).await;
        } else {
            let plurality = if buildpacks.len() > 1 { "s" } else { "" };
            (self.logs)(format!("Buildpack{}: {}", plurality, buildpacks.join(", "))).await;
        }

        let env = merge_maps([&staging_env(app)?, &app.staging_env, &app.env]);
        let script = script::staging(&StagingScript {
            rsync,
            buildpack_checksums: checksums,
        });

        Ok(ContainerSpec {
            hostname: Some(app.name.clone()),
            user: Some("root".to_string()),
            env: map_to_env(&env),
            image: self.config.image_tag.clone(),
            working_dir: Some("/root".to_string()),
            entrypoint: Some(vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                script,
                buildpacks.join(","),
                (!detect).to_string(),
            ]),
            cmd: None,
            exposed_ports: Vec::new(),
        })
    }

    /// Read a single file out of the staging image
    pub async fn download(&self, path: &str, stack: &str) -> Result<Stream, ForgeError> {
        let contr = self.download_container(stack).await?;
        match contr.stream_file_from(path).await {
            Ok(stream) => Ok(stream.bind_container(contr)),
            Err(e) => {
                close_container(contr).await;
                Err(e.into())
            }
        }
    }

    /// Read a directory of the staging image as a tar archive
    pub async fn download_tar(&self, path: &str, stack: &str) -> Result<Stream, ForgeError> {
        let contr = self.download_container(stack).await?;
        match contr.stream_tar_from(path).await {
            Ok(stream) => Ok(stream.bind_container(contr)),
            Err(e) => {
                close_container(contr).await;
                Err(e.into())
            }
        }
    }

    async fn download_container(&self, stack: &str) -> Result<Box<dyn Container>, ForgeError> {
        self.build_dockerfile(stack).await?;
        let spec = ContainerSpec {
            hostname: Some("download".to_string()),
            user: Some("root".to_string()),
            image: self.config.image_tag.clone(),
            entrypoint: Some(vec!["read".to_string()]),
            ..Default::default()
        };
        Ok(self.engine.new_container("download", spec, None).await?)
    }

    async fn build_dockerfile(&self, stack: &str) -> Result<(), ForgeError> {
        let buildpacks = match self.resolve_buildpacks().await {
            Ok(buildpacks) => buildpacks,
            Err(e) if e.is_degraded() => {
                warn!("Using existing staging image {}: {}", self.config.image_tag, e);
                (self.logs)(format!("Warning: cannot build image: {}", e)).await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "Building staging image {} from {} with {} buildpacks",
            self.config.image_tag,
            stack,
            buildpacks.len()
        );
        let dockerfile = Stream::from_bytes(script::dockerfile(stack, &buildpacks));
        self.loader
            .loading("Image", self.image.build(&self.config.image_tag, dockerfile))
            .await?;
        Ok(())
    }

    async fn resolve_buildpacks(&self) -> Result<Vec<BuildpackInfo>, crate::VersionError> {
        let mut buildpacks = Vec::new();
        for buildpack in self.config.buildpacks.iter() {
            let url = self
                .versioner
                .build(&buildpack.url, &buildpack.version_url)
                .await?;
            buildpacks.push(BuildpackInfo::new(&buildpack.name, &url));
        }
        Ok(buildpacks)
    }
}
