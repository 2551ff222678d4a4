/// OS signal plumbing in both directions.
///
/// Outbound: the watchdog escalates to the child with a configured "hang" or
/// "fail" signal through a [`SignalSink`].
///
/// Inbound: SIGHUP, SIGTERM, SIGQUIT, SIGABRT and SIGINT sent to the
/// supervisor are forwarded into a channel. Only SIGTERM and SIGQUIT mean
/// "shut down now"; the rest are observed and ignored by the process wait.
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::sync::mpsc;

/// Highest signal number deliverable on this platform.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn max_signal() -> i32 {
    libc::SIGRTMAX()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn max_signal() -> i32 {
    libc::SIGUSR2
}

/// Whether `number` is a signal that `kill(2)` accepts, real-time signals
/// included.
pub fn is_valid_signal(number: i32) -> bool {
    (1..=max_signal()).contains(&number)
}

/// Human-readable name: `SIGTERM` for the classic signals, `signal 35` for
/// real-time ones.
fn signal_name(number: i32) -> String {
    match Signal::try_from(number) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("signal {number}"),
    }
}

/// Signals the supervisor listens for while the child runs.
pub const WATCHED_SIGNALS: [Signal; 5] = [
    Signal::SIGHUP,
    Signal::SIGTERM,
    Signal::SIGQUIT,
    Signal::SIGABRT,
    Signal::SIGINT,
];

/// Whether `sig` asks the supervisor to stop the child and exit.
pub fn is_termination(sig: Signal) -> bool {
    matches!(sig, Signal::SIGTERM | Signal::SIGQUIT)
}

/// Logical escalation level decided by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// No progress for two consecutive intervals (or since startup).
    Fail,
    /// First interval without progress after a progressing one.
    Hang,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Fail => write!(f, "fail"),
            SignalKind::Hang => write!(f, "hang"),
        }
    }
}

/// Failure to deliver a signal to the child.
#[derive(Debug)]
pub struct SignalError {
    pub signal: i32,
    pub pid: Pid,
    pub source: Errno,
}

impl SignalError {
    /// The target process no longer exists.
    pub fn is_gone(&self) -> bool {
        self.source == Errno::ESRCH
    }
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to send {} to pid {}: {}",
            signal_name(self.signal),
            self.pid,
            self.source
        )
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Delivers escalation signals to the supervised process.
pub trait SignalSink: Send + Sync {
    fn send(&self, kind: SignalKind) -> Result<(), SignalError>;
}

/// Sends the configured fail/hang signals to a child pid with `kill(2)`.
#[derive(Debug, Clone)]
pub struct ChildSignaller {
    pid: Pid,
    fail: i32,
    hang: i32,
}

impl ChildSignaller {
    pub fn new(pid: u32, fail: i32, hang: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid as i32),
            fail,
            hang,
        }
    }

    /// The OS signal number configured for `kind`.
    pub fn signal_for(&self, kind: SignalKind) -> i32 {
        match kind {
            SignalKind::Fail => self.fail,
            SignalKind::Hang => self.hang,
        }
    }
}

impl SignalSink for ChildSignaller {
    fn send(&self, kind: SignalKind) -> Result<(), SignalError> {
        let sig = self.signal_for(kind);
        // nix's `kill` only takes the `Signal` enum, which has no real-time
        // signals, so go through libc with the raw number.
        // SAFETY: kill(2) takes plain integers and touches no memory.
        let res = unsafe { libc::kill(self.pid.as_raw(), sig) };
        Errno::result(res).map_err(|e| SignalError {
            signal: sig,
            pid: self.pid,
            source: e,
        })?;
        tracing::info!(
            pid = %self.pid,
            signal = %signal_name(sig),
            %kind,
            "signal sent to subprocess"
        );
        Ok(())
    }
}

/// Install handlers for [`WATCHED_SIGNALS`] and forward every delivery.
///
/// Must be called from within the tokio runtime. The handlers stay installed
/// for the rest of the process lifetime.
pub fn listen_for_signals() -> std::io::Result<mpsc::Receiver<Signal>> {
    let (tx, rx) = mpsc::channel(16);

    for sig in WATCHED_SIGNALS {
        let mut stream =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::from_raw(sig as i32))?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                tracing::debug!(signal = %sig, "received signal");
                if tx.send(sig).await.is_err() {
                    break;
                }
            }
        });
    }

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;
    use std::time::Duration;

    #[test]
    fn test_termination_class() {
        assert!(is_termination(Signal::SIGTERM));
        assert!(is_termination(Signal::SIGQUIT));
        assert!(!is_termination(Signal::SIGHUP));
        assert!(!is_termination(Signal::SIGABRT));
        assert!(!is_termination(Signal::SIGINT));
    }

    const SIGTERM: i32 = Signal::SIGTERM as i32;
    const SIGUSR1: i32 = Signal::SIGUSR1 as i32;

    #[test]
    fn test_valid_signal_range() {
        assert!(is_valid_signal(1));
        assert!(is_valid_signal(SIGTERM));
        assert!(is_valid_signal(max_signal()));
        assert!(!is_valid_signal(0));
        assert!(!is_valid_signal(-9));
        assert!(!is_valid_signal(max_signal() + 1));
    }

    #[test]
    fn test_signal_name() {
        assert_eq!(signal_name(SIGTERM), "SIGTERM");
        assert_eq!(signal_name(max_signal() + 1), format!("signal {}", max_signal() + 1));
    }

    #[test]
    fn test_signal_for_kind() {
        let signaller = ChildSignaller::new(1, SIGTERM, SIGUSR1);
        assert_eq!(signaller.signal_for(SignalKind::Fail), SIGTERM);
        assert_eq!(signaller.signal_for(SignalKind::Hang), SIGUSR1);
    }

    #[test]
    fn test_send_delivers_configured_signal() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let signaller = ChildSignaller::new(child.id(), SIGTERM, SIGUSR1);

        signaller.send(SignalKind::Hang).unwrap();

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(SIGUSR1));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_send_delivers_realtime_signal() {
        let rt = libc::SIGRTMIN() + 1;
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let signaller = ChildSignaller::new(child.id(), rt, SIGUSR1);

        signaller.send(SignalKind::Fail).unwrap();

        // Real-time signals terminate by default.
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(rt));
    }

    #[test]
    fn test_send_to_exited_process_reports_gone() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let signaller = ChildSignaller::new(pid, SIGTERM, SIGUSR1);
        let err = signaller.send(SignalKind::Fail).unwrap_err();
        assert!(err.is_gone());
        assert!(err.to_string().contains(&pid.to_string()));
    }

    #[tokio::test]
    async fn test_listener_forwards_signals() {
        let mut rx = listen_for_signals().unwrap();
        nix::sys::signal::kill(Pid::this(), Signal::SIGHUP).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(Signal::SIGHUP));
    }
}
