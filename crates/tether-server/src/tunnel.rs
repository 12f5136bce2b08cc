//! Public exposure of the local listener through a Cloudflare quick tunnel.

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

static TUNNEL_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://[a-zA-Z0-9-]+\.trycloudflare\.com").expect("tunnel url pattern is valid")
});

/// Lifecycle notifications from a running tunnel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelEvent {
    Url(String),
    /// The tunnel process failed after it was started.
    Error(String),
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no tunnel url within {0:?}")]
    Timeout(Duration),
    #[error("tunnel process exited before publishing a url (code {0:?})")]
    ExitedEarly(Option<i32>),
    #[error("tunnel is already running")]
    AlreadyRunning,
}

/// Makes a local port reachable at a public URL.
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Start the tunnel and resolve once its public URL is known.
    async fn start(&self) -> Result<String, TunnelError>;
    async fn stop(&self);
    fn url(&self) -> Option<String>;
    fn subscribe(&self) -> broadcast::Receiver<TunnelEvent>;
}

#[derive(Default)]
struct Running {
    url: Option<String>,
    kill: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

/// Runs `cloudflared tunnel --url localhost:<port>` as a child process.
pub struct CloudflareTunnel {
    program: String,
    args: Vec<String>,
    start_timeout: Duration,
    events: broadcast::Sender<TunnelEvent>,
    running: Mutex<Running>,
}

impl CloudflareTunnel {
    pub fn new(port: u16) -> Self {
        Self::with_program("cloudflared", Vec::new(), port)
    }

    /// Run `program` with `base_args` ahead of the usual tunnel arguments.
    pub fn with_program(program: impl Into<String>, base_args: Vec<String>, port: u16) -> Self {
        let mut args = base_args;
        args.extend(
            [
                "tunnel".to_string(),
                "--url".into(),
                format!("localhost:{port}"),
                "--protocol".into(),
                "http2".into(),
                "--no-autoupdate".into(),
            ],
        );
        let (events, _) = broadcast::channel(16);
        Self {
            program: program.into(),
            args,
            start_timeout: DEFAULT_START_TIMEOUT,
            events,
            running: Mutex::new(Running::default()),
        }
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().kill.is_some()
    }
}

#[async_trait]
impl Tunnel for CloudflareTunnel {
    async fn start(&self) -> Result<String, TunnelError> {
        if self.is_running() {
            return Err(TunnelError::AlreadyRunning);
        }

        info!(program = %self.program, args = ?self.args, "starting tunnel");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let (url_tx, mut url_rx) = oneshot::channel();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(scan_stderr(stderr, url_tx));
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, mut exit_rx) = oneshot::channel::<Option<i32>>();
        let events = self.events.clone();
        let watcher = tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        error!(error = %e, "failed to wait on tunnel process");
                        None
                    }
                },
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to kill tunnel process");
                    }
                    let _ = exit_tx.send(None);
                    let _ = events.send(TunnelEvent::Closed);
                    return;
                }
            };
            let _ = exit_tx.send(code);
            if code == Some(0) {
                info!("tunnel process exited");
                let _ = events.send(TunnelEvent::Closed);
            } else {
                error!(code = ?code, "tunnel process exited unexpectedly");
                let _ = events.send(TunnelEvent::Error(format!(
                    "Tunnel process exited with code {}",
                    code.map_or_else(|| "none".to_string(), |c| c.to_string())
                )));
            }
        });

        {
            let mut running = self.running.lock();
            running.kill = Some(kill_tx);
            running.watcher = Some(watcher);
        }

        let outcome = tokio::select! {
            biased;
            Ok(url) = &mut url_rx => Ok(url),
            code = &mut exit_rx => Err(TunnelError::ExitedEarly(code.ok().flatten())),
            _ = tokio::time::sleep(self.start_timeout) => Err(TunnelError::Timeout(self.start_timeout)),
        };

        match outcome {
            Ok(url) => {
                info!(url = %url, "tunnel ready");
                self.running.lock().url = Some(url.clone());
                let _ = self.events.send(TunnelEvent::Url(url.clone()));
                Ok(url)
            }
            Err(e) => {
                warn!(error = %e, "tunnel failed to start");
                self.stop().await;
                Err(e)
            }
        }
    }

    async fn stop(&self) {
        let (kill, watcher) = {
            let mut running = self.running.lock();
            running.url = None;
            (running.kill.take(), running.watcher.take())
        };
        let Some(kill) = kill else {
            return;
        };
        info!("stopping tunnel");
        let _ = kill.send(());
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }
    }

    fn url(&self) -> Option<String> {
        self.running.lock().url.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }
}

/// Forward stderr to the log and report the first tunnel URL seen.
async fn scan_stderr(stderr: ChildStderr, url_tx: oneshot::Sender<String>) {
    let mut url_tx = Some(url_tx);
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(m) = TUNNEL_URL.find(&line) {
            if let Some(tx) = url_tx.take() {
                let _ = tx.send(m.as_str().to_string());
                continue;
            }
        }
        debug!(line = %line.trim(), "cloudflared");
    }
}
