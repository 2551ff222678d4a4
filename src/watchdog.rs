/// Progress monitor for the supervised process.
///
/// Runs alongside the child, sampling a monotonically increasing metric. When
/// the metric stops advancing by at least the required delta, the child is
/// sent a hang signal; when it still hasn't advanced on the next check (or
/// never advanced since startup), it is sent a fail signal.
///
/// ```text
/// start -> warm_up -> progress -> progress -> stall -> hang -> warm_up -> progress -> ...
/// start -> warm_up -> progress -> stall -> hang -> warm_up -> stall -> fail -> warm_up -> ...
/// start -> warm_up -> stall -> fail -> warm_up -> ...
/// ```
use crate::metrics::MetricSource;
use crate::signals::{SignalKind, SignalSink};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of comparing one sample with the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The metric advanced by at least the required delta.
    Progressing,
    /// No progress, but the previous interval had some.
    StalledOnce,
    /// No progress this interval nor the previous one.
    StalledRepeated,
}

impl Verdict {
    /// Signal to escalate with, if any.
    pub fn signal(self) -> Option<SignalKind> {
        match self {
            Verdict::Progressing => None,
            Verdict::StalledOnce => Some(SignalKind::Hang),
            Verdict::StalledRepeated => Some(SignalKind::Fail),
        }
    }
}

/// Carries the previous sample and whether the previous interval progressed.
///
/// The previous-progress flag starts out `false`, so a child that makes no
/// progress during warm-up is treated as a repeated stall.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    required_delta: i64,
    previous: i64,
    previous_progress: bool,
}

impl ProgressTracker {
    pub fn new(initial: i64, required_delta: i64) -> Self {
        Self {
            required_delta,
            previous: initial,
            previous_progress: false,
        }
    }

    /// Record `current` and classify the interval since the last sample.
    ///
    /// A delta equal to the required delta counts as progress. A negative delta
    /// (counter reset) does not.
    pub fn observe(&mut self, current: i64) -> Verdict {
        let delta = current.saturating_sub(self.previous);
        let has_progressed = delta >= self.required_delta;

        let verdict = match (has_progressed, self.previous_progress) {
            (true, _) => Verdict::Progressing,
            (false, true) => Verdict::StalledOnce,
            (false, false) => Verdict::StalledRepeated,
        };
        debug!(
            previous = self.previous,
            current,
            delta,
            required = self.required_delta,
            ?verdict,
            "metric sampled"
        );

        self.previous = current;
        self.previous_progress = has_progressed;
        verdict
    }

    #[cfg(test)]
    pub fn previous(&self) -> i64 {
        self.previous
    }
}

/// The two waits used by the watchdog loop.
pub trait Pacer: Send {
    /// Short wait between samples while the child is progressing.
    fn check(&mut self) -> impl Future<Output = ()> + Send;
    /// Long wait at startup and after each escalation.
    fn warm_up(&mut self) -> impl Future<Output = ()> + Send;
}

/// Sleeps for fixed durations.
#[derive(Debug, Clone)]
pub struct IntervalPacer {
    check: Duration,
    warm_up: Duration,
}

impl IntervalPacer {
    pub fn new(check: Duration, warm_up: Duration) -> Self {
        Self { check, warm_up }
    }
}

impl Pacer for IntervalPacer {
    fn check(&mut self) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(self.check)
    }

    fn warm_up(&mut self) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(self.warm_up)
    }
}

pub struct Watchdog {
    required_delta: i64,
}

impl Watchdog {
    pub fn new(required_delta: i64) -> Self {
        Self { required_delta }
    }

    /// Sample `source` forever, escalating through `sink` when progress stalls.
    ///
    /// Never returns; the task is abandoned when the supervisor exits. Fetch and
    /// delivery errors are logged and never end the loop.
    pub async fn run<M, S, P>(&self, mut source: M, sink: S, mut pacer: P)
    where
        M: MetricSource,
        S: SignalSink,
        P: Pacer,
    {
        let initial = match source.fetch().await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "initial metric fetch failed, starting from 0");
                0
            }
        };
        info!(value = initial, "watchdog warming up");
        pacer.warm_up().await;

        let mut tracker = ProgressTracker::new(initial, self.required_delta);
        loop {
            let current = match source.fetch().await {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "failed to get metrics, retrying");
                    pacer.check().await;
                    continue;
                }
            };

            let verdict = tracker.observe(current);
            let Some(kind) = verdict.signal() else {
                pacer.check().await;
                continue;
            };

            match verdict {
                Verdict::StalledRepeated => {
                    warn!(value = current, "no progress since last check, subprocess not connected")
                }
                _ => warn!(value = current, "progress stalled, subprocess falling behind"),
            }
            if let Err(e) = sink.send(kind) {
                if e.is_gone() {
                    warn!(error = %e, %kind, "subprocess already exited");
                } else {
                    error!(error = %e, %kind, "failed to send signal");
                }
            }
            pacer.warm_up().await;
        }
    }
}
