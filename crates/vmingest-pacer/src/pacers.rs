//! The two pace limiters the storage engine shares between its components.

use crate::{PaceGuard, PaceLimiter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use vmingest_observe::{obs_count, Meter, PaceEvt, VizEvent};

/// Pace limiters with fixed storage roles.
///
/// - `search`: searches yield while assisted merges run. An assisted merge
///   happens on the ingestion path when too many small parts pile up, and it
///   must not compete with query load.
/// - `big_merges`: big merges yield while small merges run, so a long
///   compaction cannot starve the merges that keep part counts low.
///
/// Built once per storage instance and handed to every component that needs
/// it. Cloning shares the underlying limiters.
#[derive(Debug, Clone, Default)]
pub struct StoragePacers {
    pub search: Arc<PaceLimiter>,
    pub big_merges: Arc<PaceLimiter>,
    // Delay totals already published by `report`, per role.
    reported: Arc<[AtomicU64; 2]>,
}

impl StoragePacers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an assisted merge; searches wait until the guard is dropped.
    pub fn assisted_merge(&self) -> PaceGuard<'_> {
        self.search.enter()
    }

    /// Registers a small merge; big merges wait until the guard is dropped.
    pub fn small_merge(&self) -> PaceGuard<'_> {
        self.big_merges.enter()
    }

    /// Called by searches between chunks of work.
    pub fn search_wait(&self) {
        self.search.wait_if_needed();
    }

    /// Called by big merges between chunks of work.
    pub fn big_merge_wait(&self) {
        self.big_merges.wait_if_needed();
    }

    /// Publishes the delay counters of both roles.
    ///
    /// Only the delays added since the previous call are counted, so calling
    /// this periodically keeps the counters equal to `delays_total`.
    pub fn report(&self, meter: &dyn Meter) {
        let search = self.search.delays_total();
        let big_merges = self.big_merges.delays_total();

        let prev = self.reported[0].swap(search, Ordering::Relaxed);
        obs_count!(meter, "vm_search_delays_total", &[], search.saturating_sub(prev));
        let prev = self.reported[1].swap(big_merges, Ordering::Relaxed);
        obs_count!(meter, "vm_big_merges_delays_total", &[], big_merges.saturating_sub(prev));

        meter.emit(VizEvent::Pace(PaceEvt {
            role: "search",
            delays_total: search,
        }));
        meter.emit(VizEvent::Pace(PaceEvt {
            role: "big_merges",
            delays_total: big_merges,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use vmingest_observe::RecordingMeter;

    #[test]
    fn test_roles_are_independent() {
        let pacers = StoragePacers::new();
        let _merge = pacers.assisted_merge();

        // Big merges are not affected by assisted merges.
        pacers.big_merge_wait();
        assert_eq!(pacers.big_merges.delays_total(), 0);
        assert_eq!(pacers.search.active(), 1);
        assert_eq!(pacers.big_merges.active(), 0);
    }

    #[test]
    fn test_search_waits_for_assisted_merge() {
        let pacers = StoragePacers::new();
        let guard = pacers.assisted_merge();

        let (tx, rx) = mpsc::channel();
        {
            let pacers = pacers.clone();
            thread::spawn(move || {
                pacers.search_wait();
                tx.send(()).unwrap();
            });
        }
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        drop(guard);
        rx.recv_timeout(Duration::from_secs(5))
            .expect("search was not released after the merge finished");
        assert!(pacers.search.delays_total() > 0);
    }

    #[test]
    fn test_report_publishes_delays() {
        let pacers = StoragePacers::new();
        let meter = RecordingMeter::new();

        let guard = pacers.small_merge();
        let waiter = {
            let pacers = pacers.clone();
            thread::spawn(move || pacers.big_merge_wait())
        };
        thread::sleep(Duration::from_millis(50));
        drop(guard);
        waiter.join().unwrap();

        pacers.report(&meter);

        assert_eq!(meter.value("vm_search_delays_total", &[]), 0);
        assert_eq!(
            meter.value("vm_big_merges_delays_total", &[]),
            pacers.big_merges.delays_total() as i64
        );
        assert_eq!(meter.events().len(), 2);
    }

    #[test]
    fn test_repeated_report_counts_each_delay_once() {
        let pacers = StoragePacers::new();
        let meter = RecordingMeter::new();

        let guard = pacers.assisted_merge();
        let waiter = {
            let pacers = pacers.clone();
            thread::spawn(move || pacers.search_wait())
        };
        thread::sleep(Duration::from_millis(50));
        drop(guard);
        waiter.join().unwrap();

        pacers.report(&meter);
        pacers.report(&meter);
        pacers.clone().report(&meter);

        let delays = pacers.search.delays_total();
        assert!(delays > 0);
        assert_eq!(meter.value("vm_search_delays_total", &[]), delays as i64);
        assert_eq!(meter.value("vm_big_merges_delays_total", &[]), 0);
    }
}
