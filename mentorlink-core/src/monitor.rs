//! Connection quality monitoring
//!
//! Samples each peer transport's cumulative counters on a fixed interval and
//! reports windows whose loss rate crosses the configured threshold. It only
//! reports; nothing here changes negotiation or media.

use crate::config::MonitorConfig;
use crate::peer_transport::PeerTransport;
use crate::types::{CallEvent, ConnectionStats, ParticipantId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Supplies the transports to sample
pub trait StatsSource: Send + Sync {
    /// Transports of currently connected peers
    fn connected_transports(&self) -> Vec<(ParticipantId, Arc<dyn PeerTransport>)>;
}

/// Windowed loss computation over cumulative counters
#[derive(Debug)]
pub struct ConnectionMonitor {
    threshold: f64,
    last: HashMap<ParticipantId, ConnectionStats>,
}

impl ConnectionMonitor {
    /// Create a monitor reporting above `threshold`
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            last: HashMap::new(),
        }
    }

    /// Feed a cumulative sample; returns the window if it is degraded
    ///
    /// The first sample for a peer covers everything since the transport
    /// started.
    pub fn record(&mut self, peer: ParticipantId, sample: ConnectionStats) -> Option<ConnectionStats> {
        let window = match self.last.insert(peer, sample) {
            Some(previous) => sample.since(&previous),
            None => sample,
        };
        (window.loss_rate() > self.threshold).then_some(window)
    }

    /// Drop state for a peer that left
    pub fn forget(&mut self, peer: ParticipantId) {
        self.last.remove(&peer);
    }

    /// Peers with a baseline sample
    #[must_use]
    pub fn tracked_peers(&self) -> usize {
        self.last.len()
    }

    /// Sample every transport from `source` until `shutdown` fires
    ///
    /// The source is held weakly; sampling stops once it is gone.
    pub fn spawn(
        config: &MonitorConfig,
        source: Weak<dyn StatsSource>,
        events: broadcast::Sender<CallEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut monitor = Self::new(config.loss_threshold);
        let period = config.interval();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    _ = ticker.tick() => {}
                }
                let Some(source) = source.upgrade() else {
                    break;
                };
                let transports = source.connected_transports();
                drop(source);

                let current: Vec<ParticipantId> = transports.iter().map(|(peer, _)| *peer).collect();
                monitor.last.retain(|peer, _| current.contains(peer));

                for (peer, transport) in transports {
                    match transport.stats().await {
                        Ok(sample) => {
                            if let Some(window) = monitor.record(peer, sample) {
                                let loss_rate = window.loss_rate();
                                tracing::warn!(%peer, loss_rate, "Connection degraded");
                                let _ = events.send(CallEvent::Degraded {
                                    peer,
                                    loss_rate,
                                    stats: window,
                                });
                            }
                        }
                        Err(e) => tracing::debug!(%peer, error = %e, "Stats unavailable"),
                    }
                }
            }
            tracing::trace!("Connection monitor stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_window_uses_deltas() {
        let mut monitor = ConnectionMonitor::new(0.05);
        let peer = ParticipantId(2);
        assert!(monitor.record(peer, ConnectionStats::new(1, 99)).is_none());

        // 10 lost / 100 total in this window, although cumulative loss is ~5.5%
        let window = monitor.record(peer, ConnectionStats::new(11, 189)).unwrap();
        assert_eq!(window.packets_lost, 10);
        assert_eq!(window.packets_received, 90);

        assert!(monitor.record(peer, ConnectionStats::new(11, 289)).is_none());
    }

    #[test]
    fn test_idle_window_is_not_degraded() {
        let mut monitor = ConnectionMonitor::new(0.05);
        let peer = ParticipantId(2);
        monitor.record(peer, ConnectionStats::new(5, 5));
        assert!(monitor.record(peer, ConnectionStats::new(5, 5)).is_none());
        monitor.forget(peer);
        assert_eq!(monitor.tracked_peers(), 0);
    }

    struct OneTransport(Mutex<Vec<(ParticipantId, Arc<dyn PeerTransport>)>>);

    impl StatsSource for OneTransport {
        fn connected_transports(&self) -> Vec<(ParticipantId, Arc<dyn PeerTransport>)> {
            self.0.lock().clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_emits_degraded() {
        let transport = Arc::new(FakeTransport::new(ParticipantId(2)));
        transport.set_stats(0, 100);
        let source: Arc<dyn StatsSource> = Arc::new(OneTransport(Mutex::new(vec![(
            ParticipantId(2),
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
        )])));
        let (events, mut rx) = broadcast::channel(16);
        let (stop, shutdown) = watch::channel(false);
        let handle = ConnectionMonitor::spawn(
            &MonitorConfig::default(),
            Arc::downgrade(&source),
            events,
            shutdown,
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        transport.set_stats(20, 180);
        tokio::time::sleep(Duration::from_secs(5)).await;

        match rx.recv().await.unwrap() {
            CallEvent::Degraded { peer, loss_rate, .. } => {
                assert_eq!(peer, ParticipantId(2));
                assert!((loss_rate - 0.2).abs() < 1e-9);
            }
            other => unreachable!("unexpected event {other:?}"),
        }

        stop.send_replace(true);
        handle.await.unwrap();
    }
}
