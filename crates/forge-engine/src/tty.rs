//! Interactive session plumbing bound to the process stdio

use crate::{EngineError, OutputStream, Tty};
use async_trait::async_trait;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use crossterm::tty::IsTty;
use futures::StreamExt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Local terminal held in raw mode until dropped
struct RawMode {
    enabled: bool,
}

impl RawMode {
    fn enter(enabled: bool) -> Result<Self, EngineError> {
        if enabled {
            enable_raw_mode()?;
            debug!("Terminal switched to raw mode");
        }
        Ok(Self { enabled })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if self.enabled {
            if let Err(e) = disable_raw_mode() {
                warn!("Failed to restore terminal mode: {}", e);
            }
        }
    }
}

/// Copies `input` into the session and the session's output into `output`.
///
/// Sessions run one after another share the same input; keystrokes typed
/// between sessions are delivered to the next one.
pub struct StdioTty<I = tokio::io::Stdin, O = tokio::io::Stdout> {
    input: Arc<tokio::sync::Mutex<I>>,
    output: tokio::sync::Mutex<O>,
    raw: bool,
}

impl StdioTty {
    /// Bind process stdio, switching to raw mode during sessions when stdin
    /// is a terminal
    pub fn new() -> Self {
        let raw = std::io::stdin().is_tty();
        Self {
            raw,
            ..Self::with_io(tokio::io::stdin(), tokio::io::stdout())
        }
    }
}

impl Default for StdioTty {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, O> StdioTty<I, O> {
    pub fn with_io(input: I, output: O) -> Self {
        Self {
            input: Arc::new(tokio::sync::Mutex::new(input)),
            output: tokio::sync::Mutex::new(output),
            raw: false,
        }
    }

    pub fn raw_mode(&self) -> bool {
        self.raw
    }

    pub fn into_output(self) -> O {
        self.output.into_inner()
    }
}

#[async_trait]
impl<I, O> Tty for StdioTty<I, O>
where
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Send + Unpin,
{
    async fn attach(
        &self,
        mut input: Pin<Box<dyn AsyncWrite + Send>>,
        mut output: OutputStream,
    ) -> Result<(), EngineError> {
        let _raw = RawMode::enter(self.raw)?;

        let reader = self.input.clone();
        let forward_input = tokio::spawn(async move {
            let mut reader = reader.lock_owned().await;
            let _ = tokio::io::copy(&mut *reader, &mut input).await;
            let _ = input.shutdown().await;
        });

        let mut writer = self.output.lock().await;
        let mut result = Ok(());
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        result = Err(e.into());
                        break;
                    }
                    if let Err(e) = writer.flush().await {
                        result = Err(e.into());
                        break;
                    }
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        forward_input.abort();
        debug!("Interactive session ended");
        result
    }
}
