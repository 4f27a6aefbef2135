use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;

use crate::external::NotificationManager;
use crate::{log_info, log_warn};

/// Maximum time to wait for a killed child process group to exit before
/// escalating to SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// How often the shutdown watcher polls the signal flags. Signal delivery
/// itself (via `signal_hook`) is instantaneous; this interval only bounds
/// how quickly the watcher notices.
const SIGNAL_POLL_INTERVAL_MS: u64 = 50;

fn sigint_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

fn sigterm_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Install handlers for SIGINT and SIGTERM that set the corresponding flag.
/// Call once at program startup; re-registering is safe.
pub fn install_signal_handlers() -> Result<(), String> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(sigint_flag()))
        .map_err(|e| format!("failed to register SIGINT handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(sigterm_flag()))
        .map_err(|e| format!("failed to register SIGTERM handler: {}", e))?;
    Ok(())
}

pub fn is_shutdown_requested() -> bool {
    requested_signal().is_some()
}

/// Which signal (if any) has fired. SIGINT is checked first, but in
/// practice exactly one fires per run — `install_signal_handlers` callers
/// get one process, one signal.
fn requested_signal() -> Option<ShutdownSignal> {
    if sigint_flag().load(Ordering::Relaxed) {
        Some(ShutdownSignal::Sigint)
    } else if sigterm_flag().load(Ordering::Relaxed) {
        Some(ShutdownSignal::Sigterm)
    } else {
        None
    }
}

#[cfg(test)]
pub fn reset_for_test() {
    sigint_flag().store(false, Ordering::Relaxed);
    sigterm_flag().store(false, Ordering::Relaxed);
}

#[cfg(test)]
pub fn simulate_signal_for_test(signal: ShutdownSignal) {
    match signal {
        ShutdownSignal::Sigint => sigint_flag().store(true, Ordering::Relaxed),
        ShutdownSignal::Sigterm => sigterm_flag().store(true, Ordering::Relaxed),
    }
}

/// Which of the two handled signals triggered shutdown, and the process
/// exit code the spec assigns to each (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Sigint,
    Sigterm,
}

impl ShutdownSignal {
    pub fn name(&self) -> &'static str {
        match self {
            ShutdownSignal::Sigint => "SIGINT",
            ShutdownSignal::Sigterm => "SIGTERM",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownSignal::Sigint => 130,
            ShutdownSignal::Sigterm => 143,
        }
    }
}

// --- In-progress issue registry ---
//
// The fleet orchestrator marks an issue in-progress when it starts the
// pipeline and clears it when the pipeline returns, so the shutdown
// supervisor can report which issues were interrupted.

fn in_progress_registry() -> &'static Mutex<HashSet<u64>> {
    static REGISTRY: OnceLock<Mutex<HashSet<u64>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

pub fn mark_issue_in_progress(issue_number: u64) {
    if let Ok(mut registry) = in_progress_registry().lock() {
        registry.insert(issue_number);
    }
}

pub fn mark_issue_done(issue_number: u64) {
    if let Ok(mut registry) = in_progress_registry().lock() {
        registry.remove(&issue_number);
    }
}

pub fn in_progress_issues() -> Vec<u64> {
    let mut issues: Vec<u64> = in_progress_registry()
        .lock()
        .map(|registry| registry.iter().copied().collect())
        .unwrap_or_default();
    issues.sort_unstable();
    issues
}

// --- Child process registry ---
//
// External agent subprocesses (launched by an out-of-scope `AgentLauncher`
// implementation) register their process-group ID here on spawn and
// deregister on exit, so a signal can kill every in-flight agent at once.

fn process_registry() -> &'static Mutex<HashSet<Pid>> {
    static REGISTRY: OnceLock<Mutex<HashSet<Pid>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

pub fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

pub fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// SIGTERM every registered process group, wait out the grace period, then
/// SIGKILL any survivors. Runs synchronously (callers already know shutdown
/// is in progress) and swallows individual kill failures — a process that's
/// already gone is not an error here.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);
    while std::time::Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_registry().lock() {
        registry.clear();
    }
}

/// Poll for a signal, and on first receipt: cancel `cancel` (propagating to
/// every in-flight pipeline) and kill tracked child processes. Returns the
/// signal and the snapshot of issues that were in progress at the moment of
/// cancellation. A signal received after this returns is a no-op — the
/// caller only awaits this once per run.
pub async fn watch_for_shutdown(cancel: CancellationToken) -> ShutdownSignal {
    loop {
        if let Some(signal) = requested_signal() {
            log_warn!("received {}, beginning cooperative shutdown", signal.name());
            cancel.cancel();
            kill_all_children();
            return signal;
        }
        tokio::time::sleep(Duration::from_millis(SIGNAL_POLL_INTERVAL_MS)).await;
    }
}

/// Dispatch the one `fleet-interrupted` event the spec requires (§4.9,
/// §8 scenario 6) carrying the signal name and the in-progress issue list
/// captured at cancellation time.
pub async fn notify_interrupted<N: NotificationManager>(notifier: &N, signal: ShutdownSignal, issues_in_progress: &[u64]) {
    let detail = format!("signal={} issues_in_progress={:?}", signal.name(), issues_in_progress);
    if let Err(err) = notifier.notify("fleet-interrupted", &detail).await {
        log_warn!("failed to dispatch fleet-interrupted event: {}", err);
    } else {
        log_info!("{}", detail);
    }
}

/// Wait for `fut` to finish, but give up after `window` and return `None` —
/// the drain window bounds how long shutdown waits for in-flight work to
/// wind down gracefully before the process exits anyway.
pub async fn drain_or_timeout<Fut, T>(window: Duration, fut: Fut) -> Option<T>
where
    Fut: std::future::Future<Output = T>,
{
    tokio::time::timeout(window, fut).await.ok()
}
