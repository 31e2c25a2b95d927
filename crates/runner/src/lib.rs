//! Concurrent process runner with graceful shutdown.
//!
//! Long-running processes (servers, consumers) and interval processes
//! (periodic sweeps, scheduled jobs) share one cancellation token. The first
//! process error, or SIGINT/SIGTERM, cancels everything; closers then run
//! under a timeout.
//!
//! # Example
//!
//! ```no_run
//! use heatline_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Runner::new()
//!         .with_named_process("server", |ctx| async move {
//!             ctx.cancelled().await;
//!             Ok(())
//!         })
//!         .with_interval_process("sweep", Duration::from_secs(60), || async {
//!             tracing::info!("sweeping");
//!             Ok(())
//!         })
//!         .with_closer(|| async move { Ok(()) })
//!         .run()
//!         .await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Boxed long-running process. Receives the shared cancellation token.
pub type AppProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

/// Boxed cleanup function executed after all processes stop
pub type Closer = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

struct NamedProcess {
    name: String,
    process: AppProcess,
}

pub struct Runner {
    processes: Vec<NamedProcess>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
    handle_signals: bool,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Closer timeout defaults to 10 seconds.
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
            handle_signals: true,
        }
    }

    /// Add an unnamed long-running process
    pub fn with_app_process<F, Fut>(self, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = format!("process-{}", self.processes.len());
        self.with_named_process(name, process)
    }

    /// Add a long-running process. An error from it stops the whole runner.
    pub fn with_named_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.processes.push(NamedProcess {
            name: name.into(),
            process: Box::new(|token| Box::pin(process(token))),
        });
        self
    }

    /// Add a process that calls `task` every `period` until cancelled.
    ///
    /// The first call happens after one full period. Task errors are logged
    /// and do not stop the runner; a tick is skipped if the previous call is
    /// still running.
    pub fn with_interval_process<F, Fut>(
        self,
        name: impl Into<String>,
        period: Duration,
        task: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        self.with_named_process(name, move |token| {
            run_interval(task_name, period, task, token)
        })
    }

    /// Closers run concurrently after every process has stopped, whether the
    /// runner stopped on error or on cancellation.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Disable SIGINT/SIGTERM handling, for embedding and tests
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Run until stopped and exit the process: code 1 if a process failed,
    /// 0 otherwise.
    pub async fn run(self) {
        match self.run_until_stopped().await {
            Ok(()) => {
                info!("Application exiting normally");
                std::process::exit(0);
            }
            Err(err) => {
                error!("Application exiting with error: {:#}", err);
                std::process::exit(1);
            }
        }
    }

    /// Run every process until one fails, all finish, or the token is
    /// cancelled; then run closers. Returns the first process error.
    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for NamedProcess { name, process } in self.processes {
            let process_token = token.clone();
            join_set.spawn(async move {
                debug!(process = %name, "starting process");
                (name, process(process_token).await)
            });
        }

        if self.handle_signals {
            spawn_signal_handlers(token.clone());
        }

        let mut first_error = None;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok((name, Ok(()))) => {
                    debug!(process = %name, "process completed");
                }
                Ok((name, Err(err))) => {
                    if !token.is_cancelled() {
                        error!(process = %name, "process error: {:#}", err);
                        first_error = Some(err.context(format!("process {} failed", name)));
                        token.cancel();
                    } else {
                        warn!(process = %name, "process error during shutdown: {:#}", err);
                    }
                }
                Err(err) => {
                    error!("process panicked: {}", err);
                    if first_error.is_none() {
                        first_error = Some(anyhow::anyhow!("process panicked: {}", err));
                    }
                    token.cancel();
                }
            }

            if token.is_cancelled() {
                break;
            }
        }

        // Give remaining processes a chance to observe cancellation
        token.cancel();
        join_set.shutdown().await;

        if !self.closers.is_empty() {
            info!("Running closers with timeout of {:?}", self.closer_timeout);
            match tokio::time::timeout(self.closer_timeout, run_closers(self.closers)).await {
                Ok(()) => info!("All closers completed"),
                Err(_) => error!("Closers timed out after {:?}", self.closer_timeout),
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn run_interval<F, Fut>(
    name: String,
    period: Duration,
    task: F,
    token: CancellationToken,
) -> anyhow::Result<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(process = %name, "interval process stopping");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Err(err) = task().await {
                    warn!(process = %name, "interval task failed: {:#}", err);
                }
            }
        }
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                ctrl_c_token.cancel();
            }
            Err(err) => error!("Error setting up signal handler: {}", err),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM signal");
                token.cancel();
            }
            Err(err) => error!("Error setting up SIGTERM handler: {}", err),
        }
    });
}

async fn run_closers(closers: Vec<Closer>) {
    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(async move { closer().await });
    }

    while let Some(result) = closer_set.join_next().await {
        match result {
            Ok(Ok(())) => debug!("Closer completed successfully"),
            Ok(Err(err)) => error!("Closer error: {:#}", err),
            Err(err) => error!("Closer panicked: {}", err),
        }
    }
}
