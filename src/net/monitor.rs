//! Processor health monitor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tracing::{error, warn};

use super::NetworkProcessor;
use crate::error::Result;
use crate::executor::{Executors, ScheduledHandle};
use crate::metrics;

/// Interval between checks.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// A processor silent for this long is reported.
pub const SILENCE_THRESHOLD: Duration = Duration::from_secs(100);

/// Result of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Nothing to report.
    Healthy,
    /// No packet within [`SILENCE_THRESHOLD`] or the network pool is down.
    Degraded,
    /// The processor reports itself non-operational.
    Dead,
}

/// Evaluate one processor.
pub fn check(processor: &dyn NetworkProcessor, pool_operational: bool, now: Instant) -> Health {
    if !processor.is_operational() {
        return Health::Dead;
    }
    let silent = now.saturating_duration_since(processor.last_activity()) >= SILENCE_THRESHOLD;
    if silent || !pool_operational {
        Health::Degraded
    } else {
        Health::Healthy
    }
}

/// Schedule a periodic check of `processor`. The task stops once the
/// processor is dropped or closed.
pub fn spawn(
    processor: Weak<dyn NetworkProcessor>,
    executors: &Arc<Executors>,
) -> Result<ScheduledHandle> {
    let pools = Arc::downgrade(executors);
    let warned = AtomicBool::new(false);
    executors
        .scheduler()
        .schedule_at_fixed_rate(CHECK_INTERVAL, CHECK_INTERVAL, move || {
            let Some(processor) = processor.upgrade() else {
                return;
            };
            let pool_operational = pools
                .upgrade()
                .is_some_and(|e| e.network().is_operational());

            match check(processor.as_ref(), pool_operational, Instant::now()) {
                Health::Healthy => warned.store(false, Ordering::Relaxed),
                Health::Degraded => {
                    if !warned.swap(true, Ordering::Relaxed) {
                        warn!(
                            local_addr = %processor.local_addr(),
                            idle_secs = processor.last_activity().elapsed().as_secs(),
                            pool_operational,
                            "network processor may be stalled"
                        );
                    }
                }
                Health::Dead => {
                    error!(local_addr = %processor.local_addr(), "network processor is not operational, closing");
                    metrics::record_processor_closed(processor.kind(), "monitor");
                    processor.close();
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::metrics::ProcessorKind;
    use parking_lot::Mutex;
    use std::net::SocketAddr;

    struct Fake {
        operational: AtomicBool,
        last: Mutex<Instant>,
        closed: AtomicBool,
    }

    impl Fake {
        fn new(last: Instant) -> Arc<Self> {
            Arc::new(Self {
                operational: AtomicBool::new(true),
                last: Mutex::new(last),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl NetworkProcessor for Fake {
        fn kind(&self) -> ProcessorKind {
            ProcessorKind::Multicast
        }
        fn local_addr(&self) -> SocketAddr {
            "127.0.0.1:5353".parse().unwrap()
        }
        fn max_payload_size(&self) -> usize {
            1452
        }
        fn send(&self, _data: &[u8]) -> crate::error::Result<()> {
            Err(Error::Closed("fake"))
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn is_operational(&self) -> bool {
            self.operational.load(Ordering::SeqCst)
        }
        fn last_activity(&self) -> Instant {
            *self.last.lock()
        }
    }

    #[test]
    fn test_check_states() {
        let now = Instant::now();
        let fake = Fake::new(now);
        assert_eq!(check(fake.as_ref(), true, now), Health::Healthy);
        assert_eq!(check(fake.as_ref(), false, now), Health::Degraded);
        assert_eq!(
            check(fake.as_ref(), true, now + SILENCE_THRESHOLD),
            Health::Degraded
        );

        fake.operational.store(false, Ordering::SeqCst);
        assert_eq!(check(fake.as_ref(), true, now), Health::Dead);
    }

    #[test]
    fn test_monitor_closes_dead_processor() {
        let executors = Executors::new(&Default::default()).unwrap();
        let fake = Fake::new(Instant::now());
        fake.operational.store(false, Ordering::SeqCst);

        let as_dyn: Arc<dyn NetworkProcessor> = fake.clone();
        let handle = spawn(Arc::downgrade(&as_dyn), &executors).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !fake.closed.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(fake.closed.load(Ordering::SeqCst));

        handle.cancel();
        executors.shutdown();
    }
}
