//! Health & restart controller - one supervision actor per instance.
//!
//! Each actor owns the instance lifecycle end to end:
//!
//! ```text
//! Starting -> Listening -> Running -> Stopping -> Stopped
//!     \------------------------\--> Crashed --> (restart | give up)
//! ```
//!
//! Unexpected exits are retried while the crash-loop quota allows; an
//! exit after at least `min_uptime` of service zeroes the quota. A
//! breach of the memory ceiling forces a deliberate restart that leaves
//! the quota untouched. Stop requests cancel pending restart timers
//! immediately but never an in-flight forced-kill deadline.

use crate::app::{resident_memory, AppDescriptor, AppState, InstanceStatus};
use crate::launcher::{self, SpawnedChild};
use crate::logs::{self, LogTargets, StreamKind};
use crate::notify::ReadinessSocket;
use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How often resident memory is compared against the ceiling.
const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Ceiling for the exponential restart backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(15);

/// Control requests accepted by an instance actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceCommand {
    /// Graceful stop; the actor reaches terminal `Stopped`
    Stop,
    /// Graceful stop followed by a fresh launch; resets the crash-loop quota
    Restart,
}

/// Paths the actors need at runtime.
#[derive(Debug, Clone)]
pub struct SupervisorContext {
    /// Directory for readiness sockets
    pub runtime_dir: PathBuf,
    /// Directory for default log files
    pub log_dir: PathBuf,
}

/// Handle to a running instance actor.
///
/// The actor task is the exclusive owner of the child process; the
/// handle only observes status and enqueues commands. The handle
/// outliving the actor is fine - a finished task marks the instance
/// terminal.
pub struct InstanceHandle {
    status: Arc<RwLock<InstanceStatus>>,
    commands: mpsc::Sender<InstanceCommand>,
    task: Option<JoinHandle<()>>,
}

impl InstanceHandle {
    /// Snapshot the current status.
    pub async fn snapshot(&self) -> InstanceStatus {
        self.status.read().await.clone()
    }

    /// Enqueue a command. Ignored if the actor already terminated.
    pub async fn send(&self, command: InstanceCommand) {
        let _ = self.commands.send(command).await;
    }

    /// Wait for the actor to reach a terminal state. Idempotent.
    pub async fn wait(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Whether the actor has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

/// Spawn the supervision actor for one instance of an app.
pub fn spawn_instance(
    descriptor: AppDescriptor,
    instance: u32,
    context: SupervisorContext,
) -> InstanceHandle {
    let status = Arc::new(RwLock::new(InstanceStatus::new(&descriptor.name, instance)));
    let (commands, command_rx) = mpsc::channel(8);
    let task = tokio::spawn(run_instance(
        descriptor,
        instance,
        context,
        Arc::clone(&status),
        command_rx,
    ));

    InstanceHandle {
        status,
        commands,
        task: Some(task),
    }
}

/// Decision after an unexpected exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestartDecision {
    Restart,
    GiveUp,
}

/// Crash-loop quota bookkeeping.
///
/// An exit after at least `min_uptime` of service zeroes the counter
/// and never counts against the quota. Rapid exits increment it; once
/// `max_restarts` restarts have been attempted the next rapid exit is
/// terminal.
#[derive(Debug)]
struct RestartTracker {
    restarts: u32,
    max_restarts: u32,
    min_uptime: Duration,
}

impl RestartTracker {
    fn new(descriptor: &AppDescriptor) -> Self {
        Self {
            restarts: 0,
            max_restarts: descriptor.max_restarts,
            min_uptime: descriptor.min_uptime,
        }
    }

    fn on_unexpected_exit(&mut self, uptime: Duration) -> RestartDecision {
        if uptime >= self.min_uptime {
            self.restarts = 0;
            return RestartDecision::Restart;
        }
        self.restarts += 1;
        if self.restarts > self.max_restarts {
            RestartDecision::GiveUp
        } else {
            RestartDecision::Restart
        }
    }

    fn reset(&mut self) {
        self.restarts = 0;
    }

    fn count(&self) -> u32 {
        self.restarts
    }
}

/// Delay between a crash and the next launch.
#[derive(Debug)]
struct RestartPacing {
    fixed: Duration,
    exponential: Option<Duration>,
    current: Option<Duration>,
}

impl RestartPacing {
    fn new(descriptor: &AppDescriptor) -> Self {
        Self {
            fixed: descriptor.restart_delay,
            exponential: descriptor.exp_backoff_restart_delay,
            current: None,
        }
    }

    fn next_delay(&mut self) -> Duration {
        match self.exponential {
            Some(initial) => {
                let delay = self
                    .current
                    .map_or(initial, |previous| (previous * 2).min(MAX_BACKOFF));
                self.current = Some(delay);
                delay
            }
            None => self.fixed,
        }
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// How one child ended.
#[derive(Debug, Clone, Copy)]
struct ChildExit {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ChildExit {
    fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    fn clean(&self) -> bool {
        self.code == Some(0)
    }

    fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {}", code),
            (None, Some(signal)) => format!("killed by signal {}", signal),
            (None, None) => "exited with unknown status".to_string(),
        }
    }
}

async fn wait_child(child: &mut Child) -> ChildExit {
    match child.wait().await {
        Ok(status) => ChildExit::from_status(status),
        Err(error) => {
            warn!(%error, "Failed to await child");
            ChildExit {
                code: None,
                signal: None,
            }
        }
    }
}

/// Outcome of one launch, decided by the startup and running phases.
#[derive(Debug)]
enum LaunchOutcome {
    /// Explicit stop request honored; terminal
    Stopped { exit: ChildExit },
    /// Child finished with exit code 0; terminal
    CompletedClean { exit: ChildExit },
    /// Memory ceiling breach or restart request; relaunch without
    /// touching the crash-loop quota
    DeliberateRestart { exit: ChildExit, reset_quota: bool },
    /// Unexpected exit; the restart policy decides what happens next
    Crashed {
        exit: Option<ChildExit>,
        uptime: Duration,
        reason: String,
    },
}

/// Whether the actor relaunches or terminates after a crash.
enum AfterExit {
    Relaunch,
    Terminal,
}

/// What ended a restart-delay window.
#[derive(Debug, PartialEq, Eq)]
enum WindowOutcome {
    Elapsed,
    StopRequested,
}

fn classify_exit(exit: ChildExit, uptime: Duration, phase: &str) -> LaunchOutcome {
    if exit.clean() {
        LaunchOutcome::CompletedClean { exit }
    } else {
        LaunchOutcome::Crashed {
            exit: Some(exit),
            uptime,
            reason: format!("{} {}", phase, exit.describe()),
        }
    }
}

async fn ready_signal(socket: Option<&ReadinessSocket>) {
    match socket {
        Some(socket) => socket.ready().await,
        None => std::future::pending().await,
    }
}

/// Deliver the graceful signal, wait up to `kill_timeout`, then force
/// SIGKILL. Always resolves; escalation is never surfaced as a failure.
async fn shutdown_child(
    child: &mut Child,
    pid: u32,
    stop_signal: Signal,
    kill_timeout: Duration,
    status: &Arc<RwLock<InstanceStatus>>,
) -> ChildExit {
    status.write().await.state = AppState::Stopping;

    if let Err(error) = kill(Pid::from_raw(pid as i32), stop_signal) {
        // Typically ESRCH: the child beat us to the exit.
        debug!(pid, %error, "Graceful signal delivery failed");
    }

    tokio::select! {
        exit = wait_child(child) => exit,
        _ = sleep(kill_timeout) => {
            warn!(pid, "Graceful shutdown deadline elapsed, sending SIGKILL");
            if let Err(error) = child.start_kill() {
                debug!(pid, %error, "SIGKILL delivery failed");
            }
            wait_child(child).await
        }
    }
}

/// Sleep out a restart delay, cancellable by a stop request.
async fn wait_restart_window(
    commands: &mut mpsc::Receiver<InstanceCommand>,
    delay: Duration,
) -> WindowOutcome {
    if delay.is_zero() {
        // Still give an already-queued stop request a chance to land.
        return match commands.try_recv() {
            Ok(InstanceCommand::Stop) | Err(mpsc::error::TryRecvError::Disconnected) => {
                WindowOutcome::StopRequested
            }
            _ => WindowOutcome::Elapsed,
        };
    }

    tokio::select! {
        _ = sleep(delay) => WindowOutcome::Elapsed,
        command = commands.recv() => match command {
            Some(InstanceCommand::Stop) | None => WindowOutcome::StopRequested,
            Some(InstanceCommand::Restart) => WindowOutcome::Elapsed,
        },
    }
}

/// Evaluate the restart policy after an unexpected exit.
async fn evaluate_crash(
    descriptor: &AppDescriptor,
    tracker: &mut RestartTracker,
    pacing: &mut RestartPacing,
    status: &Arc<RwLock<InstanceStatus>>,
    commands: &mut mpsc::Receiver<InstanceCommand>,
    uptime: Duration,
    reason: &str,
) -> AfterExit {
    if !descriptor.autorestart {
        let mut st = status.write().await;
        st.state = AppState::Stopped;
        st.failure_reason = Some(reason.to_string());
        info!(app = %descriptor.name, instance = st.instance, reason, "Not restarting (autorestart disabled)");
        return AfterExit::Terminal;
    }

    match tracker.on_unexpected_exit(uptime) {
        RestartDecision::Restart => {
            if uptime >= descriptor.min_uptime {
                pacing.reset();
            }
            status.write().await.restart_count = tracker.count();
            let delay = pacing.next_delay();
            info!(
                app = %descriptor.name,
                reason,
                restarts = tracker.count(),
                delay_ms = delay.as_millis() as u64,
                "Restarting after unexpected exit"
            );
            match wait_restart_window(commands, delay).await {
                WindowOutcome::Elapsed => AfterExit::Relaunch,
                WindowOutcome::StopRequested => {
                    let mut st = status.write().await;
                    st.state = AppState::Stopped;
                    info!(app = %descriptor.name, instance = st.instance, "Stop requested during restart window");
                    AfterExit::Terminal
                }
            }
        }
        RestartDecision::GiveUp => {
            let mut st = status.write().await;
            st.state = AppState::Stopped;
            st.restart_count = descriptor.max_restarts;
            st.failure_reason = Some("restart limit exhausted".to_string());
            error!(
                app = %descriptor.name,
                instance = st.instance,
                max_restarts = descriptor.max_restarts,
                "Restart limit exhausted, giving up"
            );
            AfterExit::Terminal
        }
    }
}

/// Result of the startup phase select.
enum Startup {
    Ready,
    Deadline,
    Exited(ChildExit),
    Command(Option<InstanceCommand>),
}

/// The supervision actor for one instance.
async fn run_instance(
    descriptor: AppDescriptor,
    instance: u32,
    context: SupervisorContext,
    status: Arc<RwLock<InstanceStatus>>,
    mut commands: mpsc::Receiver<InstanceCommand>,
) {
    let mut tracker = RestartTracker::new(&descriptor);
    let mut pacing = RestartPacing::new(&descriptor);
    // Validated at config load; fall back for descriptors built in code.
    let stop_signal = descriptor
        .parsed_stop_signal()
        .unwrap_or(Signal::SIGTERM);

    loop {
        {
            let mut st = status.write().await;
            st.state = AppState::Starting;
            st.pid = None;
            st.stopped_at = None;
            st.exit_code = None;
            st.exit_signal = None;
        }

        let readiness = if descriptor.wait_ready {
            match ReadinessSocket::bind(&context.runtime_dir, &descriptor.name, instance) {
                Ok(socket) => Some(socket),
                Err(error) => {
                    // Without the socket a required readiness signal can
                    // never arrive; treat this like a failed launch.
                    warn!(app = %descriptor.name, instance, %error, "Failed to bind readiness socket");
                    status.write().await.state = AppState::Crashed;
                    match evaluate_crash(
                        &descriptor,
                        &mut tracker,
                        &mut pacing,
                        &status,
                        &mut commands,
                        Duration::ZERO,
                        "readiness socket unavailable",
                    )
                    .await
                    {
                        AfterExit::Relaunch => continue,
                        AfterExit::Terminal => return,
                    }
                }
            }
        } else {
            None
        };

        let spawned = match launcher::launch(
            &descriptor,
            instance,
            readiness.as_ref().map(ReadinessSocket::path),
        ) {
            Ok(spawned) => spawned,
            Err(error) => {
                warn!(app = %descriptor.name, instance, %error, "Launch failed");
                status.write().await.state = AppState::Crashed;
                match evaluate_crash(
                    &descriptor,
                    &mut tracker,
                    &mut pacing,
                    &status,
                    &mut commands,
                    Duration::ZERO,
                    "launch failed",
                )
                .await
                {
                    AfterExit::Relaunch => continue,
                    AfterExit::Terminal => return,
                }
            }
        };

        let SpawnedChild {
            mut child,
            pid,
            started_at,
            stdout,
            stderr,
        } = spawned;
        let launched_at = Instant::now();

        {
            let mut st = status.write().await;
            st.pid = Some(pid);
            st.started_at = Some(started_at);
        }
        info!(app = %descriptor.name, instance, pid, "Launched");

        let targets = LogTargets::for_instance(&descriptor, instance, &context.log_dir);
        let (log_tx, log_writer) = logs::spawn_writer(targets);
        let out_pump = logs::pump(stdout, StreamKind::Stdout, log_tx.clone());
        let err_pump = logs::pump(stderr, StreamKind::Stderr, log_tx);

        let outcome: LaunchOutcome = 'launch: {
            // Startup phase: the listen deadline governs.
            let startup = tokio::select! {
                exit = wait_child(&mut child) => Startup::Exited(exit),
                _ = ready_signal(readiness.as_ref()), if descriptor.wait_ready => Startup::Ready,
                _ = sleep(descriptor.listen_timeout) => Startup::Deadline,
                command = commands.recv() => Startup::Command(command),
            };

            match startup {
                Startup::Exited(exit) => {
                    break 'launch classify_exit(exit, launched_at.elapsed(), "during startup:");
                }
                Startup::Command(command) => {
                    let exit = shutdown_child(
                        &mut child,
                        pid,
                        stop_signal,
                        descriptor.kill_timeout,
                        &status,
                    )
                    .await;
                    break 'launch match command {
                        Some(InstanceCommand::Restart) => LaunchOutcome::DeliberateRestart {
                            exit,
                            reset_quota: true,
                        },
                        Some(InstanceCommand::Stop) | None => LaunchOutcome::Stopped { exit },
                    };
                }
                Startup::Deadline if descriptor.wait_ready => {
                    warn!(app = %descriptor.name, instance, "Readiness deadline elapsed");
                    let exit = shutdown_child(
                        &mut child,
                        pid,
                        stop_signal,
                        descriptor.kill_timeout,
                        &status,
                    )
                    .await;
                    break 'launch LaunchOutcome::Crashed {
                        exit: Some(exit),
                        uptime: launched_at.elapsed(),
                        reason: "readiness deadline elapsed".to_string(),
                    };
                }
                // Surviving the window is startup success when no
                // readiness signal is required.
                Startup::Deadline => {}
                Startup::Ready => {
                    debug!(app = %descriptor.name, instance, "Readiness notification received");
                }
            }

            status.write().await.state = AppState::Listening;

            // Confirm liveness; the child may have died in the same
            // instant the deadline fired.
            match child.try_wait() {
                Ok(Some(exit_status)) => {
                    break 'launch classify_exit(
                        ChildExit::from_status(exit_status),
                        launched_at.elapsed(),
                        "during startup:",
                    );
                }
                Ok(None) => {}
                Err(error) => {
                    debug!(app = %descriptor.name, instance, %error, "Liveness check failed");
                }
            }

            status.write().await.state = AppState::Running;
            info!(app = %descriptor.name, instance, pid, "Running");

            // Running phase.
            let mut memory_timer = interval(MEMORY_POLL_INTERVAL);
            memory_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    exit = wait_child(&mut child) => {
                        break 'launch classify_exit(exit, launched_at.elapsed(), "unexpectedly");
                    }
                    _ = memory_timer.tick(), if descriptor.max_memory_restart.is_some() => {
                        let ceiling = descriptor.max_memory_restart.unwrap_or(u64::MAX);
                        if let Some(resident) = resident_memory(pid) {
                            if resident > ceiling {
                                info!(
                                    app = %descriptor.name,
                                    instance,
                                    resident,
                                    ceiling,
                                    "Memory ceiling exceeded, restarting"
                                );
                                let exit = shutdown_child(
                                    &mut child,
                                    pid,
                                    stop_signal,
                                    descriptor.kill_timeout,
                                    &status,
                                )
                                .await;
                                break 'launch LaunchOutcome::DeliberateRestart {
                                    exit,
                                    reset_quota: false,
                                };
                            }
                        }
                    }
                    command = commands.recv() => {
                        let exit = shutdown_child(
                            &mut child,
                            pid,
                            stop_signal,
                            descriptor.kill_timeout,
                            &status,
                        )
                        .await;
                        break 'launch match command {
                            Some(InstanceCommand::Restart) => LaunchOutcome::DeliberateRestart {
                                exit,
                                reset_quota: true,
                            },
                            Some(InstanceCommand::Stop) | None => LaunchOutcome::Stopped { exit },
                        };
                    }
                }
            }
        };

        // Drain the log pipeline before anything else so every captured
        // line is on disk before a relaunch reopens the files.
        let _ = out_pump.await;
        let _ = err_pump.await;
        let _ = log_writer.await;
        drop(readiness);

        let record_exit = |st: &mut InstanceStatus, exit: &ChildExit| {
            st.pid = None;
            st.stopped_at = Some(Utc::now());
            st.exit_code = exit.code;
            st.exit_signal = exit.signal;
        };

        match outcome {
            LaunchOutcome::Stopped { exit } => {
                let mut st = status.write().await;
                record_exit(&mut st, &exit);
                st.state = AppState::Stopped;
                st.failure_reason = None;
                info!(app = %descriptor.name, instance, "Stopped");
                return;
            }
            LaunchOutcome::CompletedClean { exit } => {
                let mut st = status.write().await;
                record_exit(&mut st, &exit);
                st.state = AppState::Stopped;
                st.failure_reason = None;
                info!(app = %descriptor.name, instance, "Exited cleanly");
                return;
            }
            LaunchOutcome::DeliberateRestart { exit, reset_quota } => {
                {
                    let mut st = status.write().await;
                    record_exit(&mut st, &exit);
                    if reset_quota {
                        tracker.reset();
                        st.restart_count = 0;
                    }
                }
                pacing.reset();
                continue;
            }
            LaunchOutcome::Crashed {
                exit,
                uptime,
                reason,
            } => {
                {
                    let mut st = status.write().await;
                    if let Some(exit) = exit.as_ref() {
                        record_exit(&mut st, exit);
                    } else {
                        st.pid = None;
                        st.stopped_at = Some(Utc::now());
                    }
                    st.state = AppState::Crashed;
                }
                match evaluate_crash(
                    &descriptor,
                    &mut tracker,
                    &mut pacing,
                    &status,
                    &mut commands,
                    uptime,
                    &reason,
                )
                .await
                {
                    AfterExit::Relaunch => continue,
                    AfterExit::Terminal => return,
                }
            }
        }
    }
}
