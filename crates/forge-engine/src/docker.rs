//! Docker implementation of the ContainerEngine, Container and Image traits

use crate::{
    Container, ContainerEngine, ContainerSpec, EngineError, HostSpec, Image, LogSink,
    OutputStream, Progress, ProgressStream, RestartSignal, Stream, Tty,
};
use async_trait::async_trait;
use bollard::{
    body_full,
    models::{ContainerCreateBody, ContainerInspectResponse, HostConfig},
    query_parameters::{
        BuildImageOptions, CommitContainerOptions, CreateContainerOptionsBuilder,
        CreateImageOptions, DownloadFromContainerOptions, InspectContainerOptions, LogsOptions,
        RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
        UploadToContainerOptions, WaitContainerOptions,
    },
    Docker,
};
use futures::stream::BoxStream;
use futures::{Stream as FuturesStream, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grace period for the log forwarder to flush after the process exits
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Race an engine call against the process-wide cancellation signal
async fn guarded<T, F>(exit: &CancellationToken, call: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, bollard::errors::Error>>,
{
    tokio::select! {
        _ = exit.cancelled() => Err(EngineError::Cancelled),
        result = call => result.map_err(EngineError::from),
    }
}

async fn concat_byte_stream<S>(s: S) -> Result<Vec<u8>, bollard::errors::Error>
where
    S: FuturesStream<Item = Result<bytes::Bytes, bollard::errors::Error>>,
{
    s.try_fold(Vec::new(), |mut acc, chunk| async move {
        acc.extend_from_slice(&chunk[..]);
        Ok(acc)
    })
    .await
}

/// Split `/a/b/c` into (`/a/b`, `c`)
fn split_path(path: &str) -> Result<(String, String), EngineError> {
    let path = Path::new(path);
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| EngineError::Other(format!("Invalid file path: {}", path.display())))?;
    let dir = path
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string());
    Ok((dir, name.to_string()))
}

/// Tar archive holding a single file
fn file_archive(name: &str, contents: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o755);
    builder.append_data(&mut header, name, contents)?;
    builder.into_inner()
}

/// Tar archive holding a single directory entry, relative to `/`
fn dir_archive(path: &str) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    let relative = format!("{}/", path.trim_matches('/'));
    builder.append_data(&mut header, relative, std::io::empty())?;
    builder.into_inner()
}

/// Contents of the first entry in a tar archive
fn first_entry(archive: &[u8], path: &str) -> Result<Vec<u8>, EngineError> {
    let mut archive = tar::Archive::new(archive);
    let mut entries = archive.entries()?;
    let mut entry = entries
        .next()
        .ok_or_else(|| EngineError::NotFound(path.to_string()))??;
    let mut contents = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut contents)?;
    Ok(contents)
}

/// Split `registry:5000/app:tag` into repository and tag
fn split_reference(reference: &str) -> (String, String) {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (reference.to_string(), "latest".to_string()),
    }
}

fn health_status(info: &ContainerInspectResponse) -> String {
    info.state
        .as_ref()
        .and_then(|state| state.health.as_ref())
        .and_then(|health| health.status.as_ref())
        .map(|status| status.to_string())
        .unwrap_or_else(|| "none".to_string())
}

fn host_config(host: HostSpec) -> HostConfig {
    let port_bindings = if host.port_bindings.is_empty() {
        None
    } else {
        Some(
            host.port_bindings
                .into_iter()
                .map(|binding| {
                    (
                        binding.container_port,
                        Some(vec![bollard::models::PortBinding {
                            host_ip: Some(binding.host_ip),
                            host_port: Some(binding.host_port),
                        }]),
                    )
                })
                .collect(),
        )
    };

    HostConfig {
        binds: if host.binds.is_empty() {
            None
        } else {
            Some(host.binds)
        },
        memory: host.memory,
        port_bindings,
        network_mode: host.network_mode,
        ..Default::default()
    }
}

fn container_body(spec: ContainerSpec, host: Option<HostSpec>) -> ContainerCreateBody {
    let exposed_ports = if spec.exposed_ports.is_empty() {
        None
    } else {
        Some(
            spec.exposed_ports
                .into_iter()
                .map(|port| (port, HashMap::new()))
                .collect(),
        )
    };

    ContainerCreateBody {
        hostname: spec.hostname,
        user: spec.user,
        env: Some(spec.env),
        image: Some(spec.image),
        working_dir: spec.working_dir,
        entrypoint: spec.entrypoint,
        cmd: spec.cmd,
        exposed_ports,
        host_config: host.map(host_config),
        ..Default::default()
    }
}

async fn next_tick(restart: &mut Option<RestartSignal>) -> Option<()> {
    match restart {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}

enum StartEvent {
    Exited(Result<i64, EngineError>),
    Restart,
    RestartClosed,
    Cancelled,
}

pub struct DockerEngine {
    docker: Arc<Docker>,
    exit: CancellationToken,
}

impl DockerEngine {
    pub fn new(docker: Arc<Docker>, exit: CancellationToken) -> Self {
        Self { docker, exit }
    }

    /// Connect to the local daemon using the environment's defaults
    pub fn connect(exit: CancellationToken) -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(Arc::new(docker), exit))
    }

    pub fn docker(&self) -> Arc<Docker> {
        self.docker.clone()
    }

    /// Image operations sharing this engine's client and cancellation signal
    pub fn image(&self) -> DockerImage {
        DockerImage::new(self.docker.clone(), self.exit.clone())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn new_container(
        &self,
        name: &str,
        spec: ContainerSpec,
        host: Option<HostSpec>,
    ) -> Result<Box<dyn Container>, EngineError> {
        info!("Creating container {} from image {}", name, spec.image);

        let created = guarded(
            &self.exit,
            self.docker.create_container(
                Some(CreateContainerOptionsBuilder::new().name(name).build()),
                container_body(spec, host),
            ),
        )
        .await?;

        for warning in &created.warnings {
            warn!("Container {}: {}", name, warning);
        }

        Ok(Box::new(DockerContainer {
            docker: self.docker.clone(),
            id: created.id,
            exit: self.exit.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct DockerContainer {
    docker: Arc<Docker>,
    id: String,
    exit: CancellationToken,
    closed: AtomicBool,
}

impl DockerContainer {
    async fn upload(&self, archive: Vec<u8>, path: &str) -> Result<(), EngineError> {
        guarded(
            &self.exit,
            self.docker.upload_to_container(
                &self.id,
                Some(UploadToContainerOptions {
                    path: path.to_string(),
                    ..Default::default()
                }),
                body_full(archive.into()),
            ),
        )
        .await
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, EngineError> {
        let response = self.docker.download_from_container(
            &self.id,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );
        guarded(&self.exit, concat_byte_stream(response)).await
    }

    async fn wait_exit(&self) -> Result<i64, EngineError> {
        let mut wait = Box::pin(
            self.docker
                .wait_container(&self.id, None::<WaitContainerOptions>),
        );
        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as errors carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(EngineError::Other(format!(
                "Wait for container {} ended without a status",
                self.id
            ))),
        }
    }

    /// Forward the container's output, one prefixed line at a time
    fn follow_logs(&self, prefix: &str, logs: LogSink, from_now: bool) -> JoinHandle<()> {
        let docker = self.docker.clone();
        let id = self.id.clone();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            let options = LogsOptions {
                follow: true,
                stdout: true,
                stderr: true,
                tail: if from_now { "0" } else { "all" }.to_string(),
                ..Default::default()
            };
            let mut output = Box::pin(docker.logs(&id, Some(options)));
            let mut pending = String::new();

            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(chunk) => {
                        pending.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
                        while let Some(end) = pending.find('\n') {
                            let line: String = pending.drain(..=end).collect();
                            let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
                            logs(format!("{}{}", prefix, line)).await;
                        }
                    }
                    Err(e) => {
                        debug!("Log stream for container {} ended: {}", id, e);
                        break;
                    }
                }
            }

            if !pending.is_empty() {
                logs(format!("{}{}", prefix, pending)).await;
            }
        })
    }
}

/// File and archive transfers are buffered in memory in full, so droplets
/// and caches cost their size in RAM while in flight.
#[async_trait]
impl Container for DockerContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn mkdir(&self, path: &str) -> Result<(), EngineError> {
        debug!("Creating {} in container {}", path, self.id);
        self.upload(dir_archive(path)?, "/").await
    }

    async fn stream_file_to(&self, stream: Stream, path: &str) -> Result<(), EngineError> {
        let (dir, name) = split_path(path)?;
        let contents = stream.into_bytes().await?;
        debug!(
            "Copying {} bytes to {} in container {}",
            contents.len(),
            path,
            self.id
        );
        self.upload(file_archive(&name, &contents)?, &dir).await
    }

    async fn stream_tar_to(&self, stream: Stream, path: &str) -> Result<(), EngineError> {
        let archive = stream.into_bytes().await?;
        self.upload(archive, path).await
    }

    async fn stream_file_from(&self, path: &str) -> Result<Stream, EngineError> {
        let archive = self.download(path).await?;
        Ok(Stream::from_bytes(first_entry(&archive, path)?))
    }

    async fn stream_tar_from(&self, path: &str) -> Result<Stream, EngineError> {
        Ok(Stream::from_bytes(self.download(path).await?))
    }

    async fn extract_to(
        &self,
        tar: &mut (dyn AsyncRead + Send + Unpin),
        path: &str,
    ) -> Result<(), EngineError> {
        let mut archive = Vec::new();
        tar.read_to_end(&mut archive).await?;
        // the daemon accepts plain, gzip and bzip2 archives here
        self.upload(archive, path).await
    }

    async fn start(
        &self,
        log_prefix: &str,
        logs: LogSink,
        mut restart: Option<RestartSignal>,
    ) -> Result<i64, EngineError> {
        guarded(
            &self.exit,
            self.docker
                .start_container(&self.id, None::<StartContainerOptions>),
        )
        .await?;

        let mut log_task = self.follow_logs(log_prefix, logs.clone(), false);

        let result = loop {
            let event = tokio::select! {
                _ = self.exit.cancelled() => StartEvent::Cancelled,
                status = self.wait_exit() => StartEvent::Exited(status),
                tick = next_tick(&mut restart) => match tick {
                    Some(()) => StartEvent::Restart,
                    None => StartEvent::RestartClosed,
                },
            };

            match event {
                StartEvent::Exited(status) => break status,
                StartEvent::Cancelled => break Err(EngineError::Cancelled),
                StartEvent::RestartClosed => restart = None,
                StartEvent::Restart => {
                    info!("Restarting container {}", self.id);
                    if let Err(e) = guarded(
                        &self.exit,
                        self.docker
                            .restart_container(&self.id, None::<RestartContainerOptions>),
                    )
                    .await
                    {
                        break Err(e);
                    }
                    log_task.abort();
                    log_task = self.follow_logs(log_prefix, logs.clone(), true);
                }
            }
        };

        if tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut log_task)
            .await
            .is_err()
        {
            log_task.abort();
        }
        result
    }

    async fn background(&self) -> Result<(), EngineError> {
        info!("Starting container {} in the background", self.id);
        guarded(
            &self.exit,
            self.docker
                .start_container(&self.id, None::<StartContainerOptions>),
        )
        .await
    }

    async fn shell(&self, tty: &dyn Tty, args: &[&str]) -> Result<(), EngineError> {
        let exec = guarded(
            &self.exit,
            self.docker.create_exec(
                &self.id,
                bollard::exec::CreateExecOptions {
                    cmd: Some(args.iter().map(|arg| arg.to_string()).collect::<Vec<_>>()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            ),
        )
        .await?;

        match guarded(&self.exit, self.docker.start_exec(&exec.id, None)).await? {
            bollard::exec::StartExecResults::Attached { output, input } => {
                let output: OutputStream = output
                    .map(|chunk| chunk.map(|c| c.into_bytes()).map_err(EngineError::from))
                    .boxed();
                tokio::select! {
                    _ = self.exit.cancelled() => Err(EngineError::Cancelled),
                    result = tty.attach(input, output) => result,
                }
            }
            bollard::exec::StartExecResults::Detached => Err(EngineError::Other(format!(
                "Shell session for container {} detached",
                self.id
            ))),
        }
    }

    fn health_check(&self) -> BoxStream<'static, String> {
        let docker = self.docker.clone();
        let id = self.id.clone();
        let exit = self.exit.clone();

        Box::pin(async_stream::stream! {
            let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            loop {
                let cancelled = tokio::select! {
                    _ = exit.cancelled() => true,
                    _ = interval.tick() => false,
                };
                if cancelled {
                    break;
                }
                match docker
                    .inspect_container(&id, None::<InspectContainerOptions>)
                    .await
                {
                    Ok(info) => yield health_status(&info),
                    Err(e) => {
                        debug!("Health check for container {} stopped: {}", id, e);
                        break;
                    }
                }
            }
        })
    }

    async fn commit(&self, reference: &str) -> Result<String, EngineError> {
        let (repo, tag) = split_reference(reference);
        info!("Committing container {} as {}:{}", self.id, repo, tag);

        let response = guarded(
            &self.exit,
            self.docker.commit_container(
                CommitContainerOptions {
                    container: Some(self.id.clone()),
                    repo: Some(repo),
                    tag: Some(tag),
                    ..Default::default()
                },
                bollard::models::ContainerConfig::default(),
            ),
        )
        .await?;
        Ok(response.id)
    }

    async fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Removing container {}", self.id);
        let removed = self
            .docker
            .remove_container(
                &self.id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;
        if let Err(e) = removed {
            // leave the container closable so a later close can retry
            self.closed.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }
}

pub struct DockerImage {
    docker: Arc<Docker>,
    exit: CancellationToken,
}

impl DockerImage {
    pub fn new(docker: Arc<Docker>, exit: CancellationToken) -> Self {
        Self { docker, exit }
    }
}

impl Image for DockerImage {
    fn pull(&self, reference: &str) -> ProgressStream {
        let docker = self.docker.clone();
        let exit = self.exit.clone();
        let reference = reference.to_string();

        Box::pin(async_stream::stream! {
            info!("Pulling image {}", reference);
            let mut pull = Box::pin(docker.create_image(
                Some(CreateImageOptions {
                    from_image: Some(reference.clone()),
                    ..Default::default()
                }),
                None,
                None,
            ));

            loop {
                let next = tokio::select! {
                    _ = exit.cancelled() => None,
                    item = pull.next() => Some(item),
                };
                match next {
                    None => {
                        yield Err(EngineError::Cancelled);
                        break;
                    }
                    Some(None) => break,
                    Some(Some(Ok(info))) => {
                        let detail = info.progress_detail.as_ref();
                        yield Ok(Progress {
                            id: info.id.clone(),
                            status: info.status.clone().unwrap_or_default(),
                            current: detail.and_then(|d| d.current),
                            total: detail.and_then(|d| d.total),
                        });
                    }
                    Some(Some(Err(e))) => {
                        yield Err(EngineError::from(e));
                        break;
                    }
                }
            }
        })
    }

    fn build(&self, tag: &str, dockerfile: Stream) -> ProgressStream {
        let docker = self.docker.clone();
        let exit = self.exit.clone();
        let tag = tag.to_string();

        Box::pin(async_stream::stream! {
            info!("Building image {}", tag);
            let context = match dockerfile.into_bytes().await {
                Ok(contents) => file_archive("Dockerfile", &contents).map_err(EngineError::from),
                Err(e) => Err(e),
            };

            match context {
                Err(e) => yield Err(e),
                Ok(context) => {
                    let options = BuildImageOptions {
                        dockerfile: "Dockerfile".to_string(),
                        t: Some(tag.clone()),
                        ..Default::default()
                    };
                    let mut build = Box::pin(docker.build_image(
                        options,
                        None,
                        Some(body_full(context.into())),
                    ));

                    loop {
                        let next = tokio::select! {
                            _ = exit.cancelled() => None,
                            item = build.next() => Some(item),
                        };
                        match next {
                            None => {
                                yield Err(EngineError::Cancelled);
                                break;
                            }
                            Some(None) => break,
                            Some(Some(Ok(info))) => {
                                if let Some(error) = info.error.clone() {
                                    yield Err(EngineError::BuildFailed(error));
                                    break;
                                }
                                if let Some(line) = info.stream.as_deref().map(str::trim_end) {
                                    if !line.is_empty() {
                                        debug!("Build: {}", line);
                                        yield Ok(Progress::status(line));
                                    }
                                }
                            }
                            Some(Some(Err(e))) => {
                                yield Err(EngineError::BuildFailed(e.to_string()));
                                break;
                            }
                        }
                    }
                }
            }
        })
    }
}
