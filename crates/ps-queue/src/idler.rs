use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Cooperative pacing for long-running drains.
///
/// A drain consults the idler once per applied message: it stops when
/// [`is_cancelled`](Idler::is_cancelled) is true, and otherwise yields via
/// [`idle`](Idler::idle) whenever [`should_idle`](Idler::should_idle) is.
#[async_trait]
pub trait Idler: Send + Sync {
    fn should_idle(&self) -> bool;

    /// Hand control back to the runtime. Not a sleep.
    async fn idle(&self);

    fn is_cancelled(&self) -> bool;
}

// ---------------------------------------------------------------------------
// FrameIdler
// ---------------------------------------------------------------------------

/// Yields after each slice of `interval` worth of work.
#[derive(Debug)]
pub struct FrameIdler {
    interval: Duration,
    slice_start: Mutex<Instant>,
    token: CancellationToken,
}

impl FrameIdler {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(16);

    pub fn new(interval: Duration) -> Self {
        Self::with_token(interval, CancellationToken::new())
    }

    pub fn with_token(interval: Duration, token: CancellationToken) -> Self {
        Self {
            interval,
            slice_start: Mutex::new(Instant::now()),
            token,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Default for FrameIdler {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

#[async_trait]
impl Idler for FrameIdler {
    fn should_idle(&self) -> bool {
        self.slice_start
            .lock()
            .expect("idler lock poisoned")
            .elapsed()
            > self.interval
    }

    async fn idle(&self) {
        tokio::task::yield_now().await;
        *self.slice_start.lock().expect("idler lock poisoned") = Instant::now();
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// ManualIdler
// ---------------------------------------------------------------------------

/// Idler driven explicitly by its owner.
///
/// It counts the messages a drain reports, can request a yield every N
/// messages, can cancel after N messages, and in gated mode parks each
/// yield until [`step`](ManualIdler::step) is called.
#[derive(Debug, Default)]
pub struct ManualIdler {
    processed: AtomicUsize,
    idles: AtomicUsize,
    cancelled: AtomicBool,
    idle_every: Option<usize>,
    cancel_after: Option<usize>,
    gate: Option<Semaphore>,
}

impl ManualIdler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn idle_every(mut self, messages: usize) -> Self {
        self.idle_every = Some(messages.max(1));
        self
    }

    pub fn cancel_after(mut self, messages: usize) -> Self {
        self.cancel_after = Some(messages);
        self
    }

    /// Make every `idle()` wait for a matching `step()`.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Release one parked (or future) `idle()` call.
    pub fn step(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Messages reported so far.
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Completed `idle()` calls.
    pub fn idle_count(&self) -> usize {
        self.idles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Idler for ManualIdler {
    fn should_idle(&self) -> bool {
        let processed = self.processed();
        self.idle_every
            .is_some_and(|every| processed > 0 && processed % every == 0)
    }

    async fn idle(&self) {
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        } else {
            tokio::task::yield_now().await;
        }
        self.idles.fetch_add(1, Ordering::SeqCst);
    }

    /// Called once per applied message; doubles as the message counter.
    fn is_cancelled(&self) -> bool {
        let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        self.cancelled.load(Ordering::SeqCst)
            || self.cancel_after.is_some_and(|limit| processed >= limit)
    }
}
