use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A pending kill. Waiting on it bounds the crash window of a trial.
pub struct KillerHandle {
    task: JoinHandle<anyhow::Result<()>>,
}

impl KillerHandle {
    pub fn new(task: JoinHandle<anyhow::Result<()>>) -> Self {
        Self { task }
    }

    /// Resolves once the killer has fired (or given up).
    pub async fn wait(self) -> anyhow::Result<()> {
        self.task.await?
    }
}

/// Terminates a database backend after a delay, independently of the
/// caller's control flow.
#[async_trait]
pub trait BackendKiller: Send + Sync {
    async fn spawn(&self, backend_pid: i32, delay: Duration) -> anyhow::Result<KillerHandle>;
}

/// Runs `sleep <delay>; kill -KILL <pid>` in a separate `sh` process.
///
/// The process shares nothing with the trial that started it; the backend
/// must live on the same host as the harness.
#[derive(Debug, Clone)]
pub struct ProcessKiller {
    shell: String,
}

impl Default for ProcessKiller {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ProcessKiller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(backend_pid: i32, delay: Duration) -> String {
        format!("sleep {:.3}; kill -KILL {}", delay.as_secs_f64(), backend_pid)
    }
}

#[async_trait]
impl BackendKiller for ProcessKiller {
    async fn spawn(&self, backend_pid: i32, delay: Duration) -> anyhow::Result<KillerHandle> {
        let script = Self::script(backend_pid, delay);
        tracing::debug!(backend_pid, delay_ms = delay.as_millis() as u64, "spawning killer");
        let mut child = tokio::process::Command::new(&self.shell)
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let task = tokio::spawn(async move {
            // The backend may already be gone; the exit status is irrelevant.
            let status = child.wait().await?;
            tracing::debug!(backend_pid, ?status, "killer exited");
            Ok::<(), anyhow::Error>(())
        });
        Ok(KillerHandle::new(task))
    }
}
