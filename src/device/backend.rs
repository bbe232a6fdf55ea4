//! ADB transport backends and adaptive selection between them (spec.md
//! §4.2). Grounded on the teacher's `perception::Perception::adb`/`adb_bytes`
//! subprocess-shelling idiom, generalized into a trait so a persistent
//! `adb shell` session can be swapped in without touching call sites.

use crate::error::{EngineError, Result};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// One `adb ... ` subprocess per command. Simple, slow under load.
    Subprocess,
    /// A long-lived `adb shell` child process fed one command per line.
    /// Faster for command-heavy flows (avoids ADB handshake overhead).
    PersistentShell,
    /// A native ADB protocol implementation. No such crate is present in
    /// this workspace's dependency corpus, so this variant is modeled but
    /// currently delegates to `Subprocess` (see DESIGN.md) rather than
    /// fabricate a vendor binding.
    Native,
}

#[async_trait::async_trait]
pub trait AdbTransport: Send + Sync {
    async fn shell(&self, serial: &str, args: &[&str]) -> Result<String>;
    async fn shell_bytes(&self, serial: &str, args: &[&str]) -> Result<Vec<u8>>;
    fn kind(&self) -> BackendKind;
}

pub struct SubprocessBackend;

#[async_trait::async_trait]
impl AdbTransport for SubprocessBackend {
    async fn shell(&self, serial: &str, args: &[&str]) -> Result<String> {
        let bytes = self.shell_bytes(serial, args).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn shell_bytes(&self, serial: &str, args: &[&str]) -> Result<Vec<u8>> {
        let out = Command::new("adb")
            .args(["-s", serial])
            .args(args)
            .output()
            .await
            .map_err(|e| EngineError::transport(serial, e.to_string()))?;
        if !out.status.success() {
            return Err(EngineError::transport(serial, String::from_utf8_lossy(&out.stderr).trim().to_string()));
        }
        Ok(out.stdout)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
    }
}

/// Feeds commands to one long-lived `adb -s <serial> shell` process over
/// stdin/stdout, using a sentinel line to know when a command's output ends.
/// Only suited for text output; binary commands (screencap) fall back to a
/// one-shot subprocess.
pub struct PersistentShellBackend {
    child: Mutex<Option<Child>>,
}

impl PersistentShellBackend {
    pub fn new() -> Self {
        Self { child: Mutex::new(None) }
    }

    async fn ensure_started(&self, serial: &str) -> Result<()> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let child = Command::new("adb")
            .args(["-s", serial, "shell"])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| EngineError::transport(serial, e.to_string()))?;
        *guard = Some(child);
        Ok(())
    }
}

#[async_trait::async_trait]
impl AdbTransport for PersistentShellBackend {
    async fn shell(&self, serial: &str, args: &[&str]) -> Result<String> {
        self.ensure_started(serial).await?;
        let sentinel = format!("__DONE_{}__", uuid::Uuid::new_v4().simple());
        let mut guard = self.child.lock().await;
        let child = guard.as_mut().ok_or_else(|| EngineError::transport(serial, "shell not started"))?;
        let stdin = child.stdin.as_mut().ok_or_else(|| EngineError::transport(serial, "shell stdin closed"))?;
        let cmd_line = format!("{}; echo {}\n", args.join(" "), sentinel);
        stdin.write_all(cmd_line.as_bytes()).await.map_err(|e| EngineError::transport(serial, e.to_string()))?;
        stdin.flush().await.map_err(|e| EngineError::transport(serial, e.to_string()))?;

        let stdout = child.stdout.as_mut().ok_or_else(|| EngineError::transport(serial, "shell stdout closed"))?;
        let mut reader = BufReader::new(stdout);
        let mut out = String::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.map_err(|e| EngineError::transport(serial, e.to_string()))?;
            if n == 0 {
                *guard = None; // process died; force restart next call
                return Err(EngineError::transport(serial, "persistent shell closed unexpectedly"));
            }
            if line.trim_end() == sentinel {
                break;
            }
            out.push_str(&line);
        }
        Ok(out)
    }

    async fn shell_bytes(&self, serial: &str, args: &[&str]) -> Result<Vec<u8>> {
        // Binary-safe output needs its own pipe per invocation.
        SubprocessBackend.shell_bytes(serial, args).await
    }

    fn kind(&self) -> BackendKind {
        BackendKind::PersistentShell
    }
}

/// Tracks a rolling latency window per backend and switches when an
/// alternative is consistently >=10% faster, re-probing the idle backend
/// every N operations so a regression doesn't strand the selection forever
/// (spec.md §4.2 adaptive backend selection).
pub struct AdaptiveSelector {
    subprocess: SubprocessBackend,
    persistent: PersistentShellBackend,
    active: Mutex<BackendKind>,
    subprocess_latencies: Mutex<VecDeque<Duration>>,
    persistent_latencies: Mutex<VecDeque<Duration>>,
    ops_since_probe: Mutex<u32>,
    probe_interval: u32,
}

const LATENCY_WINDOW: usize = 20;

impl AdaptiveSelector {
    pub fn new(probe_interval: u32) -> Self {
        Self {
            subprocess: SubprocessBackend,
            persistent: PersistentShellBackend::new(),
            active: Mutex::new(BackendKind::Subprocess),
            subprocess_latencies: Mutex::new(VecDeque::new()),
            persistent_latencies: Mutex::new(VecDeque::new()),
            ops_since_probe: Mutex::new(0),
            probe_interval,
        }
    }

    pub async fn shell(&self, serial: &str, args: &[&str]) -> Result<String> {
        let use_persistent = self.should_probe_other().await || *self.active.lock().await == BackendKind::PersistentShell;
        let (backend, kind): (&dyn AdbTransport, BackendKind) = if use_persistent {
            (&self.persistent, BackendKind::PersistentShell)
        } else {
            (&self.subprocess, BackendKind::Subprocess)
        };

        let start = Instant::now();
        let result = backend.shell(serial, args).await;
        let elapsed = start.elapsed();
        self.record(kind, elapsed).await;
        if result.is_err() && kind == BackendKind::PersistentShell {
            debug!(%serial, "persistent shell failed, falling back to subprocess for this call");
            return self.subprocess.shell(serial, args).await;
        }
        result
    }

    /// Binary-safe output always goes through the one-shot subprocess path;
    /// screenshots are too infrequent to justify persistent-shell plumbing.
    pub async fn shell_bytes_via_subprocess(&self, serial: &str, args: &[&str]) -> Result<Vec<u8>> {
        self.subprocess.shell_bytes(serial, args).await
    }

    async fn should_probe_other(&self) -> bool {
        let mut ops = self.ops_since_probe.lock().await;
        *ops += 1;
        if *ops >= self.probe_interval {
            *ops = 0;
            true
        } else {
            false
        }
    }

    async fn record(&self, kind: BackendKind, elapsed: Duration) {
        let deque = match kind {
            BackendKind::PersistentShell => &self.persistent_latencies,
            _ => &self.subprocess_latencies,
        };
        let mut d = deque.lock().await;
        d.push_back(elapsed);
        if d.len() > LATENCY_WINDOW {
            d.pop_front();
        }
        drop(d);
        self.maybe_switch().await;
    }

    async fn maybe_switch(&self) {
        if self.subprocess_latencies.lock().await.len() < MIN_SAMPLES_PER_SIDE || self.persistent_latencies.lock().await.len() < MIN_SAMPLES_PER_SIDE {
            return;
        }
        let sub = avg(&self.subprocess_latencies).await;
        let pers = avg(&self.persistent_latencies).await;
        let (Some(sub), Some(pers)) = (sub, pers) else { return };
        let mut active = self.active.lock().await;
        let candidate = if pers * 1.10 < sub {
            BackendKind::PersistentShell
        } else if sub * 1.10 < pers {
            BackendKind::Subprocess
        } else {
            return;
        };
        if *active != candidate {
            warn!(from = ?*active, to = ?candidate, "adaptive backend switch");
            *active = candidate;
        }
    }
}

/// Window size used for the switch decision itself (spec.md §4.2's explicit
/// "last-10 average"), distinct from [`LATENCY_WINDOW`] which bounds how
/// many raw samples are retained at all.
const SWITCH_AVG_WINDOW: usize = 10;
/// Minimum samples required on *each* side before a switch decision is
/// made at all (spec.md §4.2: "once both windows hold >=5 samples").
const MIN_SAMPLES_PER_SIDE: usize = 5;

async fn avg(deque: &Mutex<VecDeque<Duration>>) -> Option<f64> {
    let d = deque.lock().await;
    if d.is_empty() {
        return None;
    }
    let last_n = d.iter().rev().take(SWITCH_AVG_WINDOW);
    let (sum, count) = last_n.fold((0.0, 0usize), |(sum, count), v| (sum + v.as_secs_f64(), count + 1));
    Some(sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_to_subprocess_and_does_not_switch_without_two_backends_of_data() {
        let selector = AdaptiveSelector::new(100);
        selector.record(BackendKind::Subprocess, Duration::from_millis(50)).await;
        assert_eq!(*selector.active.lock().await, BackendKind::Subprocess);
    }

    #[tokio::test]
    async fn switches_when_alternative_is_at_least_ten_percent_faster() {
        let selector = AdaptiveSelector::new(100);
        for _ in 0..5 {
            selector.record(BackendKind::Subprocess, Duration::from_millis(100)).await;
        }
        for _ in 0..5 {
            selector.record(BackendKind::PersistentShell, Duration::from_millis(50)).await;
        }
        assert_eq!(*selector.active.lock().await, BackendKind::PersistentShell);
    }

    #[tokio::test]
    async fn does_not_switch_when_within_the_ten_percent_band() {
        let selector = AdaptiveSelector::new(100);
        for _ in 0..5 {
            selector.record(BackendKind::Subprocess, Duration::from_millis(100)).await;
        }
        for _ in 0..5 {
            selector.record(BackendKind::PersistentShell, Duration::from_millis(95)).await;
        }
        assert_eq!(*selector.active.lock().await, BackendKind::Subprocess);
    }

    #[tokio::test]
    async fn does_not_switch_below_the_five_sample_minimum_even_with_a_large_gap() {
        let selector = AdaptiveSelector::new(100);
        for _ in 0..4 {
            selector.record(BackendKind::Subprocess, Duration::from_millis(100)).await;
        }
        for _ in 0..4 {
            selector.record(BackendKind::PersistentShell, Duration::from_millis(10)).await;
        }
        assert_eq!(*selector.active.lock().await, BackendKind::Subprocess);
    }

    #[tokio::test]
    async fn switch_decision_only_averages_the_last_ten_samples() {
        let selector = AdaptiveSelector::new(100);
        // Subprocess started fast, then regressed: 10 old 50ms samples
        // followed by 10 recent 200ms ones (the 20-sample cap keeps both
        // halves). Averaging the full window would read ~125ms and miss the
        // regression; averaging only the last 10 correctly reads 200ms.
        for _ in 0..10 {
            selector.record(BackendKind::Subprocess, Duration::from_millis(50)).await;
        }
        for _ in 0..10 {
            selector.record(BackendKind::Subprocess, Duration::from_millis(200)).await;
        }
        for _ in 0..5 {
            selector.record(BackendKind::PersistentShell, Duration::from_millis(180)).await;
        }
        assert_eq!(*selector.active.lock().await, BackendKind::PersistentShell);
    }

    #[tokio::test]
    async fn latency_window_caps_at_twenty_samples() {
        let selector = AdaptiveSelector::new(100);
        for _ in 0..30 {
            selector.record(BackendKind::Subprocess, Duration::from_millis(10)).await;
        }
        assert_eq!(selector.subprocess_latencies.lock().await.len(), LATENCY_WINDOW);
    }

    #[tokio::test]
    async fn probes_other_backend_exactly_every_probe_interval_ops() {
        let selector = AdaptiveSelector::new(3);
        assert!(!selector.should_probe_other().await);
        assert!(!selector.should_probe_other().await);
        assert!(selector.should_probe_other().await);
        assert!(!selector.should_probe_other().await);
    }
}
