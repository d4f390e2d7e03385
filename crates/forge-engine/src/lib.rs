//! Forge Engine - container engine contracts for local staging and running
//!
//! This crate provides the narrow capability interface the lifecycle
//! pipelines drive:
//! - Creating containers from an engine-neutral specification
//! - Injecting files and archives into containers and extracting them again
//! - Running, backgrounding, attaching to and committing containers
//! - Pulling and building images with progress reporting
//!
//! The Docker implementation lives in [`docker`].
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod docker;
pub mod stream;
pub mod tty;

pub use stream::{Release, Stream};
pub use tty::StdioTty;

/// Callback receiving one line of user-facing output at a time
pub type LogSink =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Ticks on this channel restart a running container instead of ending `start`
pub type RestartSignal = tokio::sync::mpsc::Receiver<()>;

/// Progress records produced while pulling or building an image
pub type ProgressStream = BoxStream<'static, Result<Progress, EngineError>>;

/// Raw output of an attached interactive session
pub type OutputStream = BoxStream<'static, Result<bytes::Bytes, EngineError>>;

/// Port the platform routes to inside every app container
pub const APP_PORT: &str = "8080/tcp";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Stream length mismatch: expected {expected} bytes, got {actual}")]
    StreamLength { expected: u64, actual: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Image build failed: {0}")]
    BuildFailed(String),

    #[error("Other error: {0}")]
    Other(String),
}

/// Engine-neutral description of the container to create
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub env: Vec<String>,
    pub image: String,
    pub working_dir: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub exposed_ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: String,
    pub host_ip: String,
    pub host_port: String,
}

/// Host-side placement of a container: mounts, limits and networking
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub binds: Vec<String>,
    /// Hard memory ceiling in bytes
    pub memory: Option<i64>,
    pub port_bindings: Vec<PortBinding>,
    pub network_mode: Option<String>,
}

impl HostSpec {
    /// Bind a host directory into the container
    pub fn bind(host_dir: &str, container_dir: &str) -> Self {
        Self {
            binds: vec![format!("{}:{}", host_dir, container_dir)],
            ..Default::default()
        }
    }

    /// Publish the platform port on the given host address
    pub fn publish(mut self, host_ip: &str, host_port: &str) -> Self {
        self.network_mode = None;
        self.port_bindings = vec![PortBinding {
            container_port: APP_PORT.to_string(),
            host_ip: host_ip.to_string(),
            host_port: host_port.to_string(),
        }];
        self
    }

    /// Share the network namespace of another container instead of publishing ports
    pub fn join_network(mut self, container_id: &str) -> Self {
        self.port_bindings.clear();
        self.network_mode = Some(format!("container:{}", container_id));
        self
    }
}

/// One progress record from an image pull or build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub id: Option<String>,
    pub status: String,
    pub current: Option<i64>,
    pub total: Option<i64>,
}

impl Progress {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Default::default()
        }
    }
}

/// Handle to one engine-managed container
#[async_trait]
pub trait Container: Send + Sync {
    fn id(&self) -> &str;

    /// Create a directory (and its parents) inside the container
    async fn mkdir(&self, path: &str) -> Result<(), EngineError>;

    /// Place the stream's bytes at `path` as a single file
    async fn stream_file_to(&self, stream: Stream, path: &str) -> Result<(), EngineError>;

    /// Unpack the tar archive carried by the stream into directory `path`
    async fn stream_tar_to(&self, stream: Stream, path: &str) -> Result<(), EngineError>;

    /// Produce the contents of the file at `path`
    async fn stream_file_from(&self, path: &str) -> Result<Stream, EngineError>;

    /// Produce a tar archive of `path`
    async fn stream_tar_from(&self, path: &str) -> Result<Stream, EngineError>;

    /// Decompress-and-place a tar read from `tar` into directory `path`
    async fn extract_to(
        &self,
        tar: &mut (dyn AsyncRead + Send + Unpin),
        path: &str,
    ) -> Result<(), EngineError>;

    /// Run the configured entrypoint until it exits and return its status
    async fn start(
        &self,
        log_prefix: &str,
        logs: LogSink,
        restart: Option<RestartSignal>,
    ) -> Result<i64, EngineError>;

    /// Start the entrypoint without waiting for it
    async fn background(&self) -> Result<(), EngineError>;

    /// Attach an interactive session running `args` to a backgrounded container
    async fn shell(&self, tty: &dyn Tty, args: &[&str]) -> Result<(), EngineError>;

    /// Observed health status, produced for as long as the container exists
    fn health_check(&self) -> BoxStream<'static, String>;

    /// Snapshot the filesystem as image `reference` and return the image id
    async fn commit(&self, reference: &str) -> Result<String, EngineError>;

    /// Remove the container. Closing twice is a no-op.
    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn new_container(
        &self,
        name: &str,
        spec: ContainerSpec,
        host: Option<HostSpec>,
    ) -> Result<Box<dyn Container>, EngineError>;
}

pub trait Image: Send + Sync {
    fn pull(&self, reference: &str) -> ProgressStream;

    fn build(&self, tag: &str, dockerfile: Stream) -> ProgressStream;
}

/// Terminal plumbing for interactive sessions
#[async_trait]
pub trait Tty: Send + Sync {
    async fn attach(
        &self,
        input: Pin<Box<dyn AsyncWrite + Send>>,
        output: OutputStream,
    ) -> Result<(), EngineError>;
}

/// Wrap an async line handler as a [`LogSink`]
pub fn log_sink<F, Fut>(handler: F) -> LogSink
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(
        move |line: String| -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(handler(line))
        },
    )
}

/// Sink writing each line to the process stdout
pub fn stdout_sink() -> LogSink {
    log_sink(|line: String| async move {
        use tokio::io::AsyncWriteExt;
        let mut stdout = tokio::io::stdout();
        let _ = stdout.write_all(format!("{}\n", line).as_bytes()).await;
        let _ = stdout.flush().await;
    })
}
