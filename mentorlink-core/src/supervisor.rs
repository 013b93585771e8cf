//! Reconnection and cleanup supervision
//!
//! The session funnels every termination trigger through one
//! [`TeardownGuard`] so the teardown sequence runs exactly once. This module
//! also holds the presence deadlines that synthesize leaves for peers that
//! vanished from the relay, and the signaling reconnection loop.

use crate::config::ReconnectPolicy;
use crate::signaling::{SignalingChannel, SignalingError};
use crate::types::{EndReason, ParticipantId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;

/// Single-shot idempotency guard for teardown
#[derive(Debug, Default)]
pub struct TeardownGuard {
    state: AtomicU8,
    triggers: AtomicU32,
}

impl TeardownGuard {
    /// Create an untriggered guard
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a trigger; true only for the first one
    pub fn try_begin(&self) -> bool {
        self.triggers.fetch_add(1, Ordering::Relaxed);
        self.state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark teardown complete
    pub fn finish(&self) {
        self.state.store(DONE, Ordering::Release);
    }

    /// Whether any trigger has fired
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.state.load(Ordering::Acquire) != IDLE
    }

    /// Whether teardown has completed
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    /// How many triggers fired, including ignored repeats
    #[must_use]
    pub fn trigger_count(&self) -> u32 {
        self.triggers.load(Ordering::Relaxed)
    }
}

/// Something the supervisor can tear down
#[async_trait]
pub trait Teardown: Send + Sync {
    /// Run the teardown sequence; false if it already ran or is running
    async fn teardown(&self, reason: EndReason) -> bool;
}

/// Per-peer presence deadlines
///
/// When the relay reports a peer's socket gone, a deadline is armed. If the
/// peer does not come back in time its id is sent on the expiry channel and
/// the session synthesizes the leave.
pub struct PresenceWatch {
    timeout: Duration,
    expired: mpsc::UnboundedSender<ParticipantId>,
    deadlines: Mutex<HashMap<ParticipantId, JoinHandle<()>>>,
}

impl PresenceWatch {
    /// Create a watch reporting expiries on `expired`
    #[must_use]
    pub fn new(timeout: Duration, expired: mpsc::UnboundedSender<ParticipantId>) -> Self {
        Self {
            timeout,
            expired,
            deadlines: Mutex::new(HashMap::new()),
        }
    }

    /// Start the deadline for `peer`; an armed deadline is left running
    pub fn arm(&self, peer: ParticipantId) {
        let mut deadlines = self.deadlines.lock();
        if deadlines.get(&peer).is_some_and(|h| !h.is_finished()) {
            return;
        }
        let timeout = self.timeout;
        let expired = self.expired.clone();
        tracing::debug!(%peer, timeout_ms = timeout.as_millis(), "Presence deadline armed");
        deadlines.insert(
            peer,
            tokio::spawn(async move {
                sleep(timeout).await;
                let _ = expired.send(peer);
            }),
        );
    }

    /// Cancel the deadline for `peer`
    pub fn disarm(&self, peer: ParticipantId) -> bool {
        match self.deadlines.lock().remove(&peer) {
            Some(handle) => {
                handle.abort();
                tracing::debug!(%peer, "Presence deadline cleared");
                true
            }
            None => false,
        }
    }

    /// Cancel every deadline
    pub fn disarm_all(&self) {
        for (_, handle) in self.deadlines.lock().drain() {
            handle.abort();
        }
    }

    /// Whether a deadline is pending for `peer`
    #[must_use]
    pub fn is_armed(&self, peer: ParticipantId) -> bool {
        self.deadlines
            .lock()
            .get(&peer)
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PresenceWatch {
    fn drop(&mut self) {
        self.disarm_all();
    }
}

/// Re-establish a dropped signaling channel
///
/// Waits `policy.backoff(n)` before attempt `n`. Returns the attempt that
/// succeeded.
///
/// # Errors
///
/// Returns [`SignalingError::ChannelUnavailable`] once the attempts are
/// exhausted or shutdown is signalled
pub async fn reconnect_with_backoff(
    channel: &Arc<dyn SignalingChannel>,
    policy: &ReconnectPolicy,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<u32, SignalingError> {
    for attempt in 1..=policy.max_attempts {
        let delay = policy.backoff(attempt);
        tracing::info!(
            attempt,
            max_attempts = policy.max_attempts,
            backoff_ms = delay.as_millis(),
            "Signaling channel lost, reconnecting"
        );
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return Err(SignalingError::ChannelUnavailable),
            () = sleep(delay) => {}
        }
        match channel.reconnect().await {
            Ok(()) => {
                tracing::info!(attempt, "Signaling channel reconnected");
                return Ok(attempt);
            }
            Err(e) => tracing::warn!(attempt, error = %e, "Reconnection attempt failed"),
        }
    }
    Err(SignalingError::ChannelUnavailable)
}

/// Cleanup supervisor
///
/// Connects external termination triggers to a [`Teardown`] target. The
/// target is held weakly so a watcher never keeps a session alive.
pub struct CleanupSupervisor;

impl CleanupSupervisor {
    /// Tear `target` down with `reason` when `signal` completes
    pub fn watch_trigger<F>(
        signal: F,
        target: Weak<dyn Teardown>,
        reason: EndReason,
    ) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            signal.await;
            if let Some(target) = target.upgrade() {
                tracing::info!(?reason, "Termination trigger fired");
                target.teardown(reason).await;
            }
        })
    }

    /// Tear `target` down when the host process is interrupted (Ctrl-C)
    pub fn watch_host_exit(target: Weak<dyn Teardown>) -> JoinHandle<()> {
        Self::watch_trigger(
            async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "Cannot listen for host exit");
                    std::future::pending::<()>().await;
                }
            },
            target,
            EndReason::HostExit,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_guard_admits_first_trigger_only() {
        let guard = TeardownGuard::new();
        assert!(!guard.is_triggered());
        assert!(guard.try_begin());
        assert!(!guard.try_begin());
        assert!(guard.is_triggered());
        assert!(!guard.is_complete());
        guard.finish();
        assert!(!guard.try_begin());
        assert!(guard.is_complete());
        assert_eq!(guard.trigger_count(), 3);
    }

    #[tokio::test]
    async fn test_guard_under_concurrent_triggers() {
        let guard = Arc::new(TeardownGuard::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let guard = Arc::clone(&guard);
            tasks.push(tokio::spawn(async move { guard.try_begin() }));
        }
        let winners = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_deadline_expires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watch = PresenceWatch::new(Duration::from_secs(10), tx);
        watch.arm(ParticipantId(2));
        assert!(watch.is_armed(ParticipantId(2)));

        sleep(Duration::from_secs(9)).await;
        assert!(rx.try_recv().is_err());
        sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some(ParticipantId(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_restored_before_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watch = PresenceWatch::new(Duration::from_secs(10), tx);
        watch.arm(ParticipantId(2));
        sleep(Duration::from_secs(5)).await;
        assert!(watch.disarm(ParticipantId(2)));

        sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    struct Recorder {
        fired: AtomicBool,
    }

    #[async_trait]
    impl Teardown for Recorder {
        async fn teardown(&self, reason: EndReason) -> bool {
            assert_eq!(reason, EndReason::HostExit);
            !self.fired.swap(true, Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_trigger_tears_down_target() {
        let target = Arc::new(Recorder {
            fired: AtomicBool::new(false),
        });
        let weak: Weak<dyn Teardown> = Arc::downgrade(&(Arc::clone(&target) as Arc<dyn Teardown>));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = CleanupSupervisor::watch_trigger(
            async move {
                let _ = rx.await;
            },
            weak,
            EndReason::HostExit,
        );
        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(target.fired.load(Ordering::SeqCst));
    }
}
