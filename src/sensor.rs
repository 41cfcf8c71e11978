//! Attach / detach control.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::AdapterSet;
use crate::channel::DeliveryChannel;
use crate::collector::{Collector, CollectorReport, Emitted, RunOptions};
use crate::config::SensorConfig;
use crate::error::SensorError;
use crate::gate::RundownGate;
use crate::host::NotificationHost;
use crate::ring::RingBuffer;
use crate::sequencer::Sequencer;

/// A running sensor: ring, adapters registered with a host, and the
/// collector task draining into `out`.
pub struct Sensor {
    host: Arc<dyn NotificationHost>,
    channel: Arc<DeliveryChannel>,
    gate: Arc<RundownGate>,
    adapters: Arc<AdapterSet>,
    cancel: CancellationToken,
    detach_requested: CancellationToken,
    collector: Option<JoinHandle<CollectorReport>>,
}

impl Sensor {
    pub async fn attach(
        cfg: &SensorConfig,
        host: Arc<dyn NotificationHost>,
        out: mpsc::Sender<Emitted>,
    ) -> Result<Self, SensorError> {
        Self::attach_with_sequencer(cfg, host, out, Sequencer::new()).await
    }

    /// Attach with numbering that continues from an earlier session.
    pub async fn attach_with_sequencer(
        cfg: &SensorConfig,
        host: Arc<dyn NotificationHost>,
        out: mpsc::Sender<Emitted>,
        sequencer: Sequencer,
    ) -> Result<Self, SensorError> {
        let ring = Arc::new(RingBuffer::with_sequencer(cfg.ring_capacity, sequencer)?);
        let channel = Arc::new(DeliveryChannel::new(ring));
        let gate = Arc::new(RundownGate::new());
        let adapters = Arc::new(AdapterSet::new(
            channel.clone(),
            gate.clone(),
            cfg.ignored_domains.clone(),
        ));

        let cancel = CancellationToken::new();
        let detach_requested = CancellationToken::new();
        let (ready_tx, mut ready_rx) = mpsc::channel(1);
        let collector = Collector::new(channel.clone(), adapters.clone(), cfg);
        let handle = tokio::spawn(
            collector.run(
                out,
                RunOptions::new()
                    .with_ready(ready_tx)
                    .with_cancellation(cancel.clone())
                    .with_detach_request(detach_requested.clone()),
            ),
        );

        // collector first, so nothing published during registration is missed
        if ready_rx.recv().await.is_none() {
            return Err(SensorError::Collector("collector exited before ready".into()));
        }

        if let Err(e) = host.register(adapters.clone()) {
            warn!(error = %e, "host registration failed; tearing down collector");
            gate.close();
            cancel.cancel();
            channel.wake();
            let _ = handle.await;
            return Err(e.into());
        }

        info!(capacity = cfg.ring_capacity, "sensor attached");
        Ok(Self {
            host,
            channel,
            gate,
            adapters,
            cancel,
            detach_requested,
            collector: Some(handle),
        })
    }

    /// Unregister, wait out in-flight publishes, then let the collector run
    /// its final drain. Once this returns no publish reaches the ring; any
    /// notification still arriving is counted as rejected.
    pub async fn detach(mut self, drain_timeout: Duration) -> Result<CollectorReport, SensorError> {
        self.host.unregister();
        self.gate.close_and_wait().await;
        self.cancel.cancel();
        self.channel.wake();

        let Some(mut handle) = self.collector.take() else {
            return Err(SensorError::Collector("sensor already detached".into()));
        };
        match tokio::time::timeout(drain_timeout, &mut handle).await {
            Ok(Ok(report)) => {
                info!(
                    delivered = report.stats.delivered,
                    dropped = report.stats.dropped_total,
                    "sensor detached"
                );
                Ok(report)
            }
            Ok(Err(join)) => Err(SensorError::Collector(join.to_string())),
            Err(_) => {
                handle.abort();
                Err(SensorError::DrainTimeout(drain_timeout))
            }
        }
    }

    pub fn adapters(&self) -> &Arc<AdapterSet> {
        &self.adapters
    }

    pub fn dropped_count(&self) -> u64 {
        self.channel.ring().dropped_count()
    }

    pub fn last_sequence(&self) -> u64 {
        self.channel.ring().last_sequence()
    }

    /// Cancelled by the collector when it hit a fatal error; the owner
    /// should call `detach`.
    pub fn detach_requested(&self) -> CancellationToken {
        self.detach_requested.clone()
    }
}

impl Drop for Sensor {
    fn drop(&mut self) {
        if self.collector.is_some() {
            self.host.unregister();
            self.gate.close();
            self.cancel.cancel();
            self.channel.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;

    struct RefusingHost;

    impl NotificationHost for RefusingHost {
        fn register(&self, _: Arc<AdapterSet>) -> Result<(), HostError> {
            Err(HostError::Rejected("no filter altitude".into()))
        }

        fn unregister(&self) {}
    }

    #[tokio::test]
    async fn bad_capacity_fails_attach() {
        let (tx, _rx) = mpsc::channel(8);
        let cfg = SensorConfig {
            ring_capacity: 12,
            ..SensorConfig::default()
        };
        let err = Sensor::attach(&cfg, Arc::new(RefusingHost), tx).await.err();
        assert!(matches!(err, Some(SensorError::InvalidCapacity(12))));
    }

    #[tokio::test]
    async fn refused_registration_shuts_the_collector_down() {
        let (tx, mut rx) = mpsc::channel(8);
        let err = Sensor::attach(&SensorConfig::default(), Arc::new(RefusingHost), tx)
            .await
            .err();
        assert!(matches!(err, Some(SensorError::Host(HostError::Rejected(_)))));
        // collector closed: only its final stats event, then the channel ends
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        assert!(matches!(items.as_slice(), [Emitted::Stats(_)]));
    }
}
