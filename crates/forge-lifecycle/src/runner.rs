//! Run pipeline: execute a droplet in a platform-shaped container, or commit
//! that container to an image.

use crate::app_config::{AppConfig, Colorizer, NetworkConfig};
use crate::config::ForgeConfig;
use crate::env::{map_to_env, merge_maps, running_env};
use crate::loader::{Loader, NoopLoader};
use crate::script::{self, RunningScript};
use crate::units::to_megabytes;
use crate::{close_container, ForgeError};
use forge_engine::{
    stdout_sink, Container, ContainerEngine, ContainerSpec, HostSpec, Image, LogSink,
    RestartSignal, StdioTty, Stream, Tty, APP_PORT,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct RunConfig {
    pub droplet: Stream,
    /// Tar of the launcher and shell binaries
    pub lifecycle: Stream,
    pub stack: String,
    pub app_dir: Option<String>,
    pub rsync: bool,
    /// Attach an interactive shell instead of supervising the app
    pub shell: bool,
    pub restart: Option<RestartSignal>,
    /// Receives health status changes while the app runs
    pub health: Option<LogSink>,
    pub color: Colorizer,
    pub app_config: AppConfig,
    pub network_config: NetworkConfig,
}

pub struct ExportConfig {
    pub droplet: Stream,
    pub lifecycle: Stream,
    pub stack: String,
    pub reference: String,
    pub app_config: AppConfig,
}

pub struct Runner {
    config: ForgeConfig,
    logs: LogSink,
    tty: Arc<dyn Tty>,
    loader: Arc<dyn Loader>,
    engine: Arc<dyn ContainerEngine>,
    image: Arc<dyn Image>,
}

impl Runner {
    pub fn new(config: ForgeConfig, engine: Arc<dyn ContainerEngine>, image: Arc<dyn Image>) -> Self {
        Self {
            config,
            logs: stdout_sink(),
            tty: Arc::new(StdioTty::new()),
            loader: Arc::new(NoopLoader),
            engine,
            image,
        }
    }

    pub fn with_logs(mut self, logs: LogSink) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_tty(mut self, tty: Arc<dyn Tty>) -> Self {
        self.tty = tty;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = loader;
        self
    }

    /// Run the droplet and return the app's exit status. Shell sessions
    /// always report 0.
    pub async fn run(&self, config: RunConfig) -> Result<i64, ForgeError> {
        self.pull(&config.stack).await?;

        let app = self.with_defaults(config.app_config);
        let networked = config.network_config.peer().is_some();
        let spec = self.container_spec(&app, &config.stack, config.rsync, networked)?;
        let memory = to_megabytes(&app.memory)?;
        let remote_dir = if config.rsync { "/local" } else { "/app" };
        let host = host_spec(
            &config.network_config,
            memory,
            config.app_dir.as_deref(),
            remote_dir,
        );

        let contr = self.engine.new_container(&app.name, spec, Some(host)).await?;
        let prefix = (config.color)(&format!("[{}] ", app.name));

        let result = self
            .launch(
                contr.as_ref(),
                config.lifecycle,
                config.droplet,
                &prefix,
                config.shell,
                config.restart,
                config.health,
            )
            .await;
        close_container(contr).await;
        result
    }

    /// Build the run container without starting it and commit it as
    /// `reference`, returning the image id.
    pub async fn export(&self, config: ExportConfig) -> Result<String, ForgeError> {
        self.pull(&config.stack).await?;

        let app = self.with_defaults(config.app_config);
        let spec = self.container_spec(&app, &config.stack, false, false)?;
        let contr = self.engine.new_container(&app.name, spec, None).await?;

        let result: Result<String, ForgeError> = async {
            inject(contr.as_ref(), config.lifecycle, config.droplet).await?;
            info!("Exporting {} as {}", app.name, config.reference);
            Ok(contr.commit(&config.reference).await?)
        }
        .await;
        close_container(contr).await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn launch(
        &self,
        contr: &dyn Container,
        lifecycle: Stream,
        droplet: Stream,
        prefix: &str,
        shell: bool,
        restart: Option<RestartSignal>,
        health: Option<LogSink>,
    ) -> Result<i64, ForgeError> {
        inject(contr, lifecycle, droplet).await?;

        if !shell {
            let watcher = health.map(|sink| watch_health(contr, prefix, sink));
            let status = contr.start(prefix, self.logs.clone(), restart).await;
            if let Some(watcher) = watcher {
                watcher.abort();
            }
            return Ok(status?);
        }

        contr.background().await?;
        contr.shell(self.tty.as_ref(), &["/lifecycle/shell"]).await?;
        Ok(0)
    }

    async fn pull(&self, stack: &str) -> Result<(), ForgeError> {
        self.loader.loading("Image", self.image.pull(stack)).await?;
        Ok(())
    }

    fn with_defaults(&self, app: AppConfig) -> AppConfig {
        app.with_defaults(&self.config.default_memory, &self.config.default_disk_quota)
    }

    fn container_spec(
        &self,
        app: &AppConfig,
        stack: &str,
        rsync: bool,
        networked: bool,
    ) -> Result<ContainerSpec, ForgeError> {
        let memory = to_megabytes(&app.memory)?;
        let disk = to_megabytes(&app.disk_quota)?;

        let env = merge_maps([&running_env(app, memory, disk)?, &app.running_env, &app.env]);
        let script = script::running(&RunningScript { rsync });

        // a container sharing a peer's network takes its hostname and ports
        let (hostname, exposed_ports) = if networked {
            (None, Vec::new())
        } else {
            (Some(app.name.clone()), vec![APP_PORT.to_string()])
        };

        Ok(ContainerSpec {
            hostname,
            user: Some("root".to_string()),
            env: map_to_env(&env),
            image: stack.to_string(),
            working_dir: Some("/app".to_string()),
            entrypoint: None,
            cmd: Some(vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                script,
                "launcher".to_string(),
                app.command.clone(),
            ]),
            exposed_ports,
        })
    }
}

async fn inject(contr: &dyn Container, lifecycle: Stream, droplet: Stream) -> Result<(), ForgeError> {
    contr.mkdir("/lifecycle").await?;
    contr.stream_tar_to(lifecycle, "/lifecycle").await?;
    contr.stream_file_to(droplet, "/droplet").await?;
    Ok(())
}

fn host_spec(
    network: &NetworkConfig,
    memory: i64,
    app_dir: Option<&str>,
    remote_dir: &str,
) -> HostSpec {
    let mut host = match app_dir.filter(|dir| !dir.is_empty()) {
        Some(dir) => HostSpec::bind(dir, remote_dir),
        None => HostSpec::default(),
    };
    host.memory = Some(memory * 1024 * 1024);

    match network.peer() {
        Some(peer) => host.join_network(peer),
        None => host.publish(&network.host_ip, &network.host_port),
    }
}

/// Forward health status changes until aborted or the sequence ends
fn watch_health(contr: &dyn Container, prefix: &str, sink: LogSink) -> JoinHandle<()> {
    let mut statuses = contr.health_check();
    let prefix = prefix.to_string();
    let id = contr.id().to_string();

    tokio::spawn(async move {
        let mut last: Option<String> = None;
        while let Some(status) = statuses.next().await {
            if last.as_deref() != Some(status.as_str()) {
                debug!("Container {} health: {}", id, status);
                sink(format!("{}health: {}", prefix, status)).await;
                last = Some(status);
            }
        }
    })
}
