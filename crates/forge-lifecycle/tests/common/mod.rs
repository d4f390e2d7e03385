//! In-memory container engine recording every call the pipelines make
#![allow(dead_code)]

use async_trait::async_trait;
use forge_engine::{
    log_sink, Container, ContainerEngine, ContainerSpec, EngineError, HostSpec, Image, LogSink,
    Progress, ProgressStream, RestartSignal, Stream, Tty,
};
use forge_lifecycle::{AppConfig, Buildpack, Buildpacks, ForgeConfig};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    NewContainer {
        name: String,
        spec: ContainerSpec,
        host: Option<HostSpec>,
    },
    Mkdir(String),
    StreamFileTo { path: String, contents: Vec<u8> },
    StreamTarTo { path: String, contents: Vec<u8> },
    ExtractTo { path: String, contents: Vec<u8> },
    StreamFileFrom(String),
    StreamTarFrom(String),
    Start { prefix: String, restart: bool },
    Background,
    Shell(Vec<String>),
    Commit(String),
    Close,
    Pull(String),
    Build { tag: String, dockerfile: String },
}

/// Scripted responses of the fake engine
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub exit_status: i64,
    /// Files readable from every container, by path
    pub files: HashMap<String, Vec<u8>>,
    /// Operations that fail, by trait method name
    pub fail: HashSet<&'static str>,
    pub start_logs: Vec<String>,
    pub start_delay: Option<Duration>,
    pub health: Vec<String>,
    pub image_id: String,
}

impl Behavior {
    pub fn staging() -> Self {
        Self {
            files: HashMap::from([
                ("/droplet".to_string(), b"droplet-tgz".to_vec()),
                ("/tmp/output-cache".to_string(), b"output-cache-tgz".to_vec()),
            ]),
            image_id: "sha256:feedface".to_string(),
            ..Default::default()
        }
    }

    pub fn failing(mut self, op: &'static str) -> Self {
        self.fail.insert(op);
        self
    }
}

#[derive(Clone)]
pub struct FakeEngine {
    calls: Arc<Mutex<Vec<Call>>>,
    behavior: Arc<Behavior>,
}

impl FakeEngine {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            behavior: Arc::new(behavior),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    /// The single container created so far
    pub fn created(&self) -> (String, ContainerSpec, Option<HostSpec>) {
        let created: Vec<_> = self
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::NewContainer { name, spec, host } => Some((name, spec, host)),
                _ => None,
            })
            .collect();
        assert_eq!(created.len(), 1, "expected exactly one container");
        created.into_iter().next().unwrap()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, op: &str) -> Result<(), EngineError> {
        if self.behavior.fail.contains(op) {
            return Err(EngineError::Other(format!("{} failed", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn new_container(
        &self,
        name: &str,
        spec: ContainerSpec,
        host: Option<HostSpec>,
    ) -> Result<Box<dyn Container>, EngineError> {
        self.check("new_container")?;
        self.record(Call::NewContainer {
            name: name.to_string(),
            spec,
            host,
        });
        Ok(Box::new(FakeContainer {
            id: format!("{}-id", name),
            engine: self.clone(),
        }))
    }
}

pub struct FakeContainer {
    id: String,
    engine: FakeEngine,
}

#[async_trait]
impl Container for FakeContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn mkdir(&self, path: &str) -> Result<(), EngineError> {
        self.engine.check("mkdir")?;
        self.engine.record(Call::Mkdir(path.to_string()));
        Ok(())
    }

    async fn stream_file_to(&self, stream: Stream, path: &str) -> Result<(), EngineError> {
        self.engine.check("stream_file_to")?;
        let contents = stream.into_bytes().await?;
        self.engine.record(Call::StreamFileTo {
            path: path.to_string(),
            contents,
        });
        Ok(())
    }

    async fn stream_tar_to(&self, stream: Stream, path: &str) -> Result<(), EngineError> {
        self.engine.check("stream_tar_to")?;
        let contents = stream.into_bytes().await?;
        self.engine.record(Call::StreamTarTo {
            path: path.to_string(),
            contents,
        });
        Ok(())
    }

    async fn stream_file_from(&self, path: &str) -> Result<Stream, EngineError> {
        self.engine.check("stream_file_from")?;
        self.engine.record(Call::StreamFileFrom(path.to_string()));
        let contents = self
            .engine
            .behavior
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(path.to_string()))?;
        Ok(Stream::from_bytes(contents))
    }

    async fn stream_tar_from(&self, path: &str) -> Result<Stream, EngineError> {
        self.engine.check("stream_tar_from")?;
        self.engine.record(Call::StreamTarFrom(path.to_string()));
        Ok(Stream::from_bytes(format!("tar of {}", path).into_bytes()))
    }

    async fn extract_to(
        &self,
        tar: &mut (dyn AsyncRead + Send + Unpin),
        path: &str,
    ) -> Result<(), EngineError> {
        self.engine.check("extract_to")?;
        let mut contents = Vec::new();
        tar.read_to_end(&mut contents).await?;
        self.engine.record(Call::ExtractTo {
            path: path.to_string(),
            contents,
        });
        Ok(())
    }

    async fn start(
        &self,
        log_prefix: &str,
        logs: LogSink,
        restart: Option<RestartSignal>,
    ) -> Result<i64, EngineError> {
        self.engine.check("start")?;
        self.engine.record(Call::Start {
            prefix: log_prefix.to_string(),
            restart: restart.is_some(),
        });
        if let Some(delay) = self.engine.behavior.start_delay {
            tokio::time::sleep(delay).await;
        }
        for line in &self.engine.behavior.start_logs {
            logs(format!("{}{}", log_prefix, line)).await;
        }
        Ok(self.engine.behavior.exit_status)
    }

    async fn background(&self) -> Result<(), EngineError> {
        self.engine.check("background")?;
        self.engine.record(Call::Background);
        Ok(())
    }

    async fn shell(&self, _tty: &dyn Tty, args: &[&str]) -> Result<(), EngineError> {
        self.engine.check("shell")?;
        self.engine
            .record(Call::Shell(args.iter().map(|a| a.to_string()).collect()));
        Ok(())
    }

    fn health_check(&self) -> BoxStream<'static, String> {
        stream::iter(self.engine.behavior.health.clone()).boxed()
    }

    async fn commit(&self, reference: &str) -> Result<String, EngineError> {
        self.engine.check("commit")?;
        self.engine.record(Call::Commit(reference.to_string()));
        Ok(self.engine.behavior.image_id.clone())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.engine.record(Call::Close);
        Ok(())
    }
}

#[derive(Clone)]
pub struct FakeImage {
    engine: FakeEngine,
}

impl FakeImage {
    pub fn new(engine: &FakeEngine) -> Self {
        Self {
            engine: engine.clone(),
        }
    }
}

impl Image for FakeImage {
    fn pull(&self, reference: &str) -> ProgressStream {
        self.engine.record(Call::Pull(reference.to_string()));
        let result = self
            .engine
            .check("pull")
            .map(|_| Progress::status(format!("Pulled {}", reference)));
        stream::iter(vec![result]).boxed()
    }

    fn build(&self, tag: &str, dockerfile: Stream) -> ProgressStream {
        stream::once(record_build(self.engine.clone(), tag.to_string(), dockerfile)).boxed()
    }
}

async fn record_build(
    engine: FakeEngine,
    tag: String,
    dockerfile: Stream,
) -> Result<Progress, EngineError> {
    engine.check("build")?;
    let dockerfile = String::from_utf8_lossy(&dockerfile.into_bytes().await?).to_string();
    engine.record(Call::Build { tag, dockerfile });
    Ok(Progress::status("Successfully built"))
}

/// Tty that never sees a session; the fake shell does not attach
pub struct NullTty;

#[async_trait]
impl Tty for NullTty {
    async fn attach(
        &self,
        _input: std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
        _output: forge_engine::OutputStream,
    ) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Sink collecting every line
pub fn recorder() -> (LogSink, Arc<Mutex<Vec<String>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let captured = lines.clone();
    let sink = log_sink(move |line| {
        let captured = captured.clone();
        async move { captured.lock().unwrap().push(line) }
    });
    (sink, lines)
}

pub fn system_buildpacks() -> Buildpacks {
    Buildpacks::from(vec![
        Buildpack {
            name: "a".to_string(),
            url: "https://example.com/a.zip".to_string(),
            version_url: "https://example.com/a/latest".to_string(),
        },
        Buildpack {
            name: "b".to_string(),
            url: "https://example.com/b.zip".to_string(),
            version_url: "https://example.com/b/latest".to_string(),
        },
    ])
}

pub fn forge_config() -> ForgeConfig {
    ForgeConfig::default().with_buildpacks(system_buildpacks())
}

pub fn app(name: &str) -> AppConfig {
    AppConfig::new(name)
}

/// `KEY=value` entry of a container environment
pub fn env_value<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    let prefix = format!("{}=", key);
    env.iter()
        .find_map(|entry| entry.strip_prefix(prefix.as_str()))
}
