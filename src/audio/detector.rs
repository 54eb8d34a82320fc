//! Clap detection service
//!
//! Owns the microphone session and a sampling worker that runs once per tick:
//! read captured audio, analyse it with a 256-point transform, reduce the bins
//! to a single loudness value, and fire the registered handler when the
//! loudness crosses the threshold outside the cooldown window.
//!
//! Thread Safety:
//! The capture stream is not `Send`, so it is opened, sampled and released
//! entirely on the worker thread. The owning `ClapDetector` talks to the
//! worker over crossbeam channels; threshold and cooldown are shared atomics
//! so they can be adjusted while a session runs.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::analyser::{SpectrumAnalyser, FFT_SIZE};
use super::level::{mean_loudness, ClapGate};
use super::{friendly_audio_error, AudioBackend, CaptureStream};

pub const DEFAULT_THRESHOLD: f32 = 0.15;
pub const DEFAULT_COOLDOWN_MS: u64 = 1000;
pub const MIN_COOLDOWN_MS: u64 = 100;

const PERMISSION_DENIED_MESSAGE: &str =
    "Microphone access denied. Please grant microphone permissions to use clap detection.";

/// Clap detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Loudness (0..1) a tick must exceed to count as a clap
    pub threshold: f32,
    pub cooldown_ms: u64,
    /// Sampling period; 16ms is one frame at ~60 Hz
    pub tick_interval_ms: u64,
    /// Consecutive failed ticks tolerated before the session stops
    pub max_tick_retries: u32,
    pub retry_backoff_ms: u64,
    /// Input device name (system default when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            tick_interval_ms: 16,
            max_tick_retries: 3,
            retry_backoff_ms: 1000,
            device_name: None,
        }
    }
}

/// Outcome of [`ClapDetector::start`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartResult {
    pub success: bool,
    /// User-facing explanation when `success` is false
    pub message: Option<String>,
}

impl StartResult {
    fn started() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Signal type for stopping the sampling worker
#[derive(Debug, Clone, Copy)]
struct StopSignal;

/// Threshold and cooldown, readable from the worker while a session runs
#[derive(Debug)]
struct Sensitivity {
    threshold_bits: AtomicU32,
    cooldown_ms: AtomicU64,
}

impl Sensitivity {
    fn threshold(&self) -> f32 {
        f32::from_bits(self.threshold_bits.load(Ordering::Relaxed))
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy)]
struct LoopTiming {
    tick: Duration,
    max_retries: u32,
    backoff: Duration,
}

/// Handle to a running sampling worker
struct AudioSession {
    active: Arc<AtomicBool>,
    stop_tx: Sender<StopSignal>,
    worker: Option<thread::JoinHandle<()>>,
}

impl AudioSession {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

type ClapHandler = Box<dyn FnMut() + Send + 'static>;

/// Tick error ending the session at once: the clap handler panicked
#[derive(Debug, thiserror::Error)]
#[error("Clap handler panicked")]
struct HandlerPanicked;

/// Clears the session's running flag when the worker exits, unwinding included
struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Microphone clap detector. At most one session exists at a time.
pub struct ClapDetector {
    backend: Arc<dyn AudioBackend>,
    sensitivity: Arc<Sensitivity>,
    timing: LoopTiming,
    session: Option<AudioSession>,
}

impl ClapDetector {
    pub fn new(backend: Arc<dyn AudioBackend>, config: &DetectorConfig) -> Self {
        let mut detector = Self {
            backend,
            sensitivity: Arc::new(Sensitivity {
                threshold_bits: AtomicU32::new(DEFAULT_THRESHOLD.to_bits()),
                cooldown_ms: AtomicU64::new(DEFAULT_COOLDOWN_MS),
            }),
            timing: LoopTiming {
                tick: Duration::from_millis(config.tick_interval_ms.max(1)),
                max_retries: config.max_tick_retries,
                backoff: Duration::from_millis(config.retry_backoff_ms),
            },
            session: None,
        };
        detector.set_threshold(config.threshold);
        detector.set_cooldown_period(config.cooldown_ms);
        detector
    }

    /// Check microphone access by acquiring it once and releasing it right away.
    pub fn request_permission(&self) -> bool {
        match self.backend.probe() {
            Ok(()) => true,
            Err(e) => {
                log::error!("Microphone permission denied: {:#}", e);
                false
            }
        }
    }

    /// Start listening; `on_clap` runs on the sampling worker for every clap.
    ///
    /// Returns success immediately if a session is already active.
    pub fn start<F>(&mut self, on_clap: F) -> StartResult
    where
        F: FnMut() + Send + 'static,
    {
        if self.is_active() {
            return StartResult::started();
        }
        self.reap_finished_session();

        if !self.request_permission() {
            return StartResult::failed(PERMISSION_DENIED_MESSAGE);
        }

        log::info!("Starting clap detection...");

        let (stop_tx, stop_rx) = bounded::<StopSignal>(1);
        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);
        let active = Arc::new(AtomicBool::new(false));

        let worker = {
            let backend = Arc::clone(&self.backend);
            let sensitivity = Arc::clone(&self.sensitivity);
            let active = Arc::clone(&active);
            let timing = self.timing;
            let handler: ClapHandler = Box::new(on_clap);

            thread::Builder::new()
                .name("clap-detector".to_string())
                .spawn(move || {
                    run_sampling_worker(
                        backend.as_ref(),
                        &sensitivity,
                        timing,
                        &active,
                        handler,
                        ready_tx,
                        stop_rx,
                    )
                })
        };

        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Failed to spawn clap detection worker: {}", e);
                return StartResult::failed(format!("Could not start clap detection: {}", e));
            }
        };

        let ready = ready_rx.recv();
        match ready {
            Ok(Ok(())) => {
                self.session = Some(AudioSession {
                    active,
                    stop_tx,
                    worker: Some(worker),
                });
                log::info!("✓ Clap detection started");
                StartResult::started()
            }
            Ok(Err(message)) => {
                let _ = worker.join();
                StartResult::failed(message)
            }
            Err(_) => {
                let _ = worker.join();
                StartResult::failed("Clap detection worker exited before it was ready")
            }
        }
    }

    /// Stop listening and release the microphone. No-op when nothing runs.
    pub fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if session.is_active() {
            log::info!("Stopping clap detection...");
        }

        // The worker may already have exited on its own
        let _ = session.stop_tx.try_send(StopSignal);

        if let Some(worker) = session.worker.take() {
            if worker.join().is_err() {
                log::error!("Clap detection worker panicked");
            }
        }

        log::info!("✓ Clap detection stopped");
    }

    /// Set the loudness threshold, clamped to [0, 1]. NaN is ignored.
    pub fn set_threshold(&mut self, value: f32) {
        if value.is_nan() {
            log::warn!("Ignoring NaN clap threshold");
            return;
        }
        let value = value.clamp(0.0, 1.0);
        self.sensitivity
            .threshold_bits
            .store(value.to_bits(), Ordering::Relaxed);
        log::debug!("Clap threshold set to {:.3}", value);
    }

    /// Set the minimum time between claps, never below 100ms.
    pub fn set_cooldown_period(&mut self, ms: u64) {
        let ms = ms.max(MIN_COOLDOWN_MS);
        self.sensitivity.cooldown_ms.store(ms, Ordering::Relaxed);
        log::debug!("Clap cooldown set to {}ms", ms);
    }

    pub fn threshold(&self) -> f32 {
        self.sensitivity.threshold()
    }

    pub fn cooldown_period(&self) -> Duration {
        self.sensitivity.cooldown()
    }

    pub fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(AudioSession::is_active)
    }

    /// Join a worker that ended by itself (fatal tick errors)
    fn reap_finished_session(&mut self) {
        if self.session.is_some() {
            log::debug!("Cleaning up finished clap detection session");
            self.stop();
        }
    }
}

impl Drop for ClapDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Resources owned by the worker for the lifetime of one session
struct SamplingSession {
    stream: Box<dyn CaptureStream>,
    analyser: SpectrumAnalyser,
    on_clap: Option<ClapHandler>,
    gate: ClapGate,
    samples: Vec<f32>,
    bins: Vec<u8>,
}

impl SamplingSession {
    fn open(backend: &dyn AudioBackend, on_clap: ClapHandler) -> Result<Self> {
        let mut stream = backend
            .open()
            .context("Failed to acquire microphone stream")?;

        let analyser = match SpectrumAnalyser::new(FFT_SIZE) {
            Ok(analyser) => analyser,
            Err(e) => {
                if let Err(err) = stream.disconnect() {
                    log::warn!("Failed to release microphone stream: {:#}", err);
                }
                return Err(e.context("Failed to create audio analyser"));
            }
        };

        let bins = vec![0u8; analyser.frequency_bin_count()];
        Ok(Self {
            stream,
            analyser,
            on_clap: Some(on_clap),
            gate: ClapGate::new(),
            samples: Vec::with_capacity(FFT_SIZE * 4),
            bins,
        })
    }

    /// One sampling tick. Returns whether a clap was accepted.
    fn tick(&mut self, sensitivity: &Sensitivity, now: Instant) -> Result<bool> {
        self.samples.clear();
        self.stream.read(&mut self.samples)?;
        self.analyser.push_samples(&self.samples);
        self.analyser.byte_frequency_data(&mut self.bins)?;

        let loudness = mean_loudness(&self.bins);
        log::trace!("loudness={:.3} samples={}", loudness, self.samples.len());

        if !self
            .gate
            .observe(loudness, sensitivity.threshold(), sensitivity.cooldown(), now)
        {
            return Ok(false);
        }

        log::info!("Clap detected! loudness={:.3}", loudness);
        if let Some(mut on_clap) = self.on_clap.take() {
            if panic::catch_unwind(AssertUnwindSafe(|| on_clap())).is_err() {
                return Err(HandlerPanicked.into());
            }
            self.on_clap = Some(on_clap);
        }
        Ok(true)
    }

    /// Release everything; each step runs even if an earlier one failed.
    fn teardown(&mut self) {
        if let Err(e) = self.stream.disconnect() {
            log::warn!("Failed to disconnect microphone stream: {:#}", e);
        }
        if let Err(e) = self.analyser.close() {
            log::warn!("Failed to close audio analyser: {:#}", e);
        }
        self.on_clap = None;
    }
}

/// Wait for `period` or a stop request; true means keep running.
fn wait_or_stop(stop_rx: &Receiver<StopSignal>, period: Duration) -> bool {
    matches!(
        stop_rx.recv_timeout(period),
        Err(RecvTimeoutError::Timeout)
    )
}

/// Sampling worker function that runs in a dedicated thread
fn run_sampling_worker(
    backend: &dyn AudioBackend,
    sensitivity: &Sensitivity,
    timing: LoopTiming,
    active: &AtomicBool,
    on_clap: ClapHandler,
    ready_tx: Sender<Result<(), String>>,
    stop_rx: Receiver<StopSignal>,
) {
    let mut session = match SamplingSession::open(backend, on_clap) {
        Ok(session) => session,
        Err(e) => {
            log::error!("Error starting clap detection: {:#}", e);
            let friendly = friendly_audio_error(&e);
            let _ = ready_tx.send(Err(friendly.message));
            return;
        }
    };

    active.store(true, Ordering::SeqCst);
    let _active = ActiveGuard(active);
    if ready_tx.send(Ok(())).is_err() {
        session.teardown();
        return;
    }

    log::debug!(
        "Sampling every {:?} (fft={}, retries={}, backoff={:?})",
        timing.tick,
        FFT_SIZE,
        timing.max_retries,
        timing.backoff
    );

    let mut failures = 0u32;
    loop {
        let wait = match session.tick(sensitivity, Instant::now()) {
            Ok(_) => {
                failures = 0;
                timing.tick
            }
            Err(e) if e.is::<HandlerPanicked>() => {
                log::error!("Clap detection stopped: {}", e);
                break;
            }
            Err(e) => {
                failures += 1;
                if failures > timing.max_retries {
                    log::error!(
                        "Clap detection giving up after {} failed ticks: {:#}",
                        failures,
                        e
                    );
                    break;
                }
                log::warn!(
                    "Clap detection tick failed (retry {}/{} in {:?}): {:#}",
                    failures,
                    timing.max_retries,
                    timing.backoff,
                    e
                );
                timing.backoff
            }
        };

        if !wait_or_stop(&stop_rx, wait) {
            break;
        }
    }

    session.teardown();
    log::debug!("Sampling worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Signal {
        Silent,
        Clapping,
        Broken,
        /// Three failed reads out of every four
        Flaky,
        /// Read panics
        Crashing,
    }

    #[derive(Default)]
    struct Counters {
        probes: AtomicUsize,
        opens: AtomicUsize,
        reads: AtomicUsize,
        disconnects: AtomicUsize,
    }

    struct FakeBackend {
        permission: bool,
        open_error: Option<&'static str>,
        signal: Signal,
        disconnect_fails: bool,
        counters: Arc<Counters>,
    }

    impl FakeBackend {
        fn new(signal: Signal) -> Self {
            Self {
                permission: true,
                open_error: None,
                signal,
                disconnect_fails: false,
                counters: Arc::new(Counters::default()),
            }
        }
    }

    struct FakeStream {
        signal: Signal,
        disconnect_fails: bool,
        counters: Arc<Counters>,
    }

    impl AudioBackend for FakeBackend {
        fn probe(&self) -> Result<()> {
            self.counters.probes.fetch_add(1, Ordering::SeqCst);
            if self.permission {
                Ok(())
            } else {
                anyhow::bail!("Permission denied")
            }
        }

        fn open(&self) -> Result<Box<dyn CaptureStream>> {
            self.counters.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.open_error {
                anyhow::bail!(err);
            }
            Ok(Box::new(FakeStream {
                signal: self.signal,
                disconnect_fails: self.disconnect_fails,
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    impl CaptureStream for FakeStream {
        fn read(&mut self, out: &mut Vec<f32>) -> Result<()> {
            let read = self.counters.reads.fetch_add(1, Ordering::SeqCst);
            match self.signal {
                Signal::Silent => out.extend(std::iter::repeat(0.0).take(FFT_SIZE)),
                Signal::Clapping => {
                    let mut frame = vec![0.0; FFT_SIZE];
                    frame[FFT_SIZE / 2] = 1.0;
                    out.extend(frame);
                }
                Signal::Broken => anyhow::bail!("stream glitch"),
                Signal::Flaky if read % 4 != 3 => anyhow::bail!("stream glitch"),
                Signal::Flaky => out.extend(std::iter::repeat(0.0).take(FFT_SIZE)),
                Signal::Crashing => panic!("driver crashed"),
            }
            Ok(())
        }

        fn disconnect(&mut self) -> Result<()> {
            self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
            if self.disconnect_fails {
                anyhow::bail!("already gone");
            }
            Ok(())
        }
    }

    fn fast_config() -> DetectorConfig {
        DetectorConfig {
            tick_interval_ms: 2,
            retry_backoff_ms: 5,
            ..DetectorConfig::default()
        }
    }

    fn detector(backend: FakeBackend) -> (ClapDetector, Arc<Counters>) {
        let counters = Arc::clone(&backend.counters);
        (ClapDetector::new(Arc::new(backend), &fast_config()), counters)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_defaults() {
        let (detector, _) = detector(FakeBackend::new(Signal::Silent));
        assert_eq!(detector.threshold(), 0.15);
        assert_eq!(detector.cooldown_period(), Duration::from_millis(1000));
        assert!(!detector.is_active());
    }

    #[test]
    fn test_start_is_idempotent() {
        let (mut detector, counters) = detector(FakeBackend::new(Signal::Silent));

        assert!(detector.start(|| {}).success);
        assert!(detector.is_active());
        assert!(detector.start(|| {}).success);

        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
        assert_eq!(counters.probes.load(Ordering::SeqCst), 1);

        detector.stop();
        assert!(!detector.is_active());
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_when_inactive_is_noop() {
        let (mut detector, counters) = detector(FakeBackend::new(Signal::Silent));
        detector.stop();
        detector.stop();

        assert!(!detector.is_active());
        assert_eq!(counters.opens.load(Ordering::SeqCst), 0);
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_permission_denied() {
        let mut backend = FakeBackend::new(Signal::Clapping);
        backend.permission = false;
        let (mut detector, counters) = detector(backend);

        assert!(!detector.request_permission());
        let result = detector.start(|| {});
        assert!(!result.success);
        assert!(result.message.unwrap().contains("denied"));
        assert!(!detector.is_active());
        assert_eq!(counters.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_open_failure_leaves_no_session() {
        let mut backend = FakeBackend::new(Signal::Clapping);
        backend.open_error = Some("No such device");
        let (mut detector, counters) = detector(backend);

        let result = detector.start(|| {});
        assert!(!result.success);
        assert!(result.message.unwrap().contains("unplugged"));
        assert!(!detector.is_active());
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);

        // A later stop has nothing to release
        detector.stop();
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_loud_input_fires_once_per_cooldown() {
        let (mut detector, _) = detector(FakeBackend::new(Signal::Clapping));
        detector.set_cooldown_period(60_000);

        let (tx, rx) = crossbeam_channel::unbounded();
        assert!(detector.start(move || {
            let _ = tx.send(());
        })
        .success);

        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        detector.stop();
    }

    #[test]
    fn test_silence_never_fires() {
        let (mut detector, counters) = detector(FakeBackend::new(Signal::Silent));

        let (tx, rx) = crossbeam_channel::unbounded();
        assert!(detector.start(move || {
            let _ = tx.send(());
        })
        .success);

        assert!(wait_until(|| counters.reads.load(Ordering::SeqCst) >= 10));
        assert!(rx.try_recv().is_err());
        detector.stop();
    }

    #[test]
    fn test_threshold_change_applies_to_running_session() {
        let (mut detector, _) = detector(FakeBackend::new(Signal::Clapping));
        detector.set_threshold(1.0);
        detector.set_cooldown_period(100);

        let (tx, rx) = crossbeam_channel::unbounded();
        assert!(detector.start(move || {
            let _ = tx.send(());
        })
        .success);

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        detector.set_threshold(0.15);
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        detector.stop();
    }

    #[test]
    fn test_gives_up_after_bounded_retries() {
        let (mut detector, counters) = detector(FakeBackend::new(Signal::Broken));

        assert!(detector.start(|| {}).success);
        assert!(wait_until(|| !detector.is_active()));

        // First attempt plus three retries
        assert_eq!(counters.reads.load(Ordering::SeqCst), 4);
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 1);

        // Starting again opens a fresh session
        assert!(detector.start(|| {}).success);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
        detector.stop();
    }

    #[test]
    fn test_successful_tick_resets_retry_count() {
        let (mut detector, counters) = detector(FakeBackend::new(Signal::Flaky));

        assert!(detector.start(|| {}).success);
        assert!(wait_until(|| counters.reads.load(Ordering::SeqCst) >= 20));
        assert!(detector.is_active());

        detector.stop();
        assert!(!detector.is_active());
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_handler_ends_session() {
        let (mut detector, counters) = detector(FakeBackend::new(Signal::Clapping));

        assert!(detector.start(|| panic!("handler failed")).success);
        assert!(wait_until(|| !detector.is_active()));
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 1);

        assert!(detector.start(|| {}).success);
        assert!(detector.is_active());
        assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
        detector.stop();
    }

    #[test]
    fn test_crashed_worker_is_not_reported_active() {
        let (mut detector, counters) = detector(FakeBackend::new(Signal::Crashing));

        assert!(detector.start(|| {}).success);
        assert!(wait_until(|| !detector.is_active()));

        // The dead worker is reaped and a fresh stream opened
        assert!(detector.start(|| {}).success);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
        detector.stop();
    }

    #[test]
    fn test_teardown_tolerates_errors_and_drops_handler() {
        let mut backend = FakeBackend::new(Signal::Silent);
        backend.disconnect_fails = true;
        let (mut detector, counters) = detector(backend);

        let token = Arc::new(Mutex::new(0u32));
        let held = Arc::clone(&token);
        assert!(detector.start(move || {
            if let Ok(mut count) = held.lock() {
                *count += 1;
            }
        })
        .success);
        assert_eq!(Arc::strong_count(&token), 2);

        detector.stop();
        assert!(!detector.is_active());
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(Arc::strong_count(&token), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_threshold_is_clamped(value in -10.0f32..10.0) {
            let (mut detector, _) = detector(FakeBackend::new(Signal::Silent));
            detector.set_threshold(value);
            proptest::prop_assert_eq!(detector.threshold(), value.clamp(0.0, 1.0));
        }

        #[test]
        fn prop_cooldown_has_floor(ms in 0u64..100_000) {
            let (mut detector, _) = detector(FakeBackend::new(Signal::Silent));
            detector.set_cooldown_period(ms);
            proptest::prop_assert_eq!(detector.cooldown_period(), Duration::from_millis(ms.max(100)));
        }
    }
}
