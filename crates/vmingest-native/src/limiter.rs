//! Limits how many streams read their request bodies at the same time.
//!
//! A stream takes a slot on its first read and gives it back with
//! [`ReadTicket::dec_concurrency`] after each record is handed to the
//! workers, so a slow client that stops sending does not pin a slot while
//! its data is being decoded. The next read takes a slot again.

use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use vmingest_observe::{Counter, Gauge, Meter, NoopMeter};

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error(
        "cannot process insert request for {:.3} seconds because {max_concurrent} concurrent insert requests are executed",
        .waited.as_secs_f64()
    )]
    Timeout {
        waited: Duration,
        max_concurrent: usize,
    },
}

/// Counting semaphore with a bounded wait.
pub struct ConcurrencyLimiter {
    capacity: usize,
    max_queue_duration: Duration,
    in_use: Mutex<usize>,
    cond: Condvar,
    limit_reached: Box<dyn Counter>,
    timeouts: Box<dyn Counter>,
    current: Box<dyn Gauge>,
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("capacity", &self.capacity)
            .field("max_queue_duration", &self.max_queue_duration)
            .field("in_use", &*self.in_use.lock())
            .finish()
    }
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize, max_queue_duration: Duration) -> Self {
        Self::with_meter(capacity, max_queue_duration, &NoopMeter)
    }

    pub fn with_meter(capacity: usize, max_queue_duration: Duration, meter: &dyn Meter) -> Self {
        Self {
            capacity,
            max_queue_duration,
            in_use: Mutex::new(0),
            cond: Condvar::new(),
            limit_reached: meter.counter("vm_concurrent_insert_limit_reached_total", &[]),
            timeouts: meter.counter("vm_concurrent_insert_limit_timeout_total", &[]),
            current: meter.gauge("vm_concurrent_insert_current", &[]),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_queue_duration(&self) -> Duration {
        self.max_queue_duration
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        *self.in_use.lock()
    }

    /// Takes a slot, waiting up to `max_queue_duration` for one to free up.
    pub fn acquire(&self) -> Result<(), LimiterError> {
        let mut in_use = self.in_use.lock();
        if *in_use < self.capacity {
            *in_use += 1;
            self.current.set(*in_use as i64);
            return Ok(());
        }

        self.limit_reached.inc(1);
        let started = Instant::now();
        let deadline = started + self.max_queue_duration;
        while *in_use >= self.capacity {
            if self.cond.wait_until(&mut in_use, deadline).timed_out() && *in_use >= self.capacity {
                self.timeouts.inc(1);
                tracing::warn!(
                    "read slot not available after {:?}; {} streams are being read",
                    self.max_queue_duration,
                    self.capacity
                );
                return Err(LimiterError::Timeout {
                    waited: started.elapsed(),
                    max_concurrent: self.capacity,
                });
            }
        }
        *in_use += 1;
        self.current.set(*in_use as i64);
        Ok(())
    }

    pub fn release(&self) {
        let mut in_use = self.in_use.lock();
        debug_assert!(*in_use > 0, "BUG: releasing a slot that was not acquired");
        *in_use = in_use.saturating_sub(1);
        self.current.set(*in_use as i64);
        self.cond.notify_one();
    }
}

/// Tracks whether one stream holds a limiter slot.
///
/// Lives on the stack of the reading thread. Dropping it gives back a held
/// slot, so every exit path of a parse releases the limiter.
#[derive(Debug)]
pub struct ReadTicket {
    limiter: Arc<ConcurrencyLimiter>,
    held: Cell<bool>,
}

impl ReadTicket {
    pub fn new(limiter: Arc<ConcurrencyLimiter>) -> Self {
        Self {
            limiter,
            held: Cell::new(false),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.get()
    }

    fn acquire_if_needed(&self) -> Result<(), LimiterError> {
        if !self.held.get() {
            self.limiter.acquire()?;
            self.held.set(true);
        }
        Ok(())
    }

    /// Gives the slot back until the next read.
    pub fn dec_concurrency(&self) {
        if self.held.replace(false) {
            self.limiter.release();
        }
    }
}

impl Drop for ReadTicket {
    fn drop(&mut self) {
        self.dec_concurrency();
    }
}

/// Reader that holds a limiter slot while reading.
///
/// A timed out wait surfaces as an [`io::ErrorKind::TimedOut`] error.
pub struct LimitedReader<'t, R> {
    inner: R,
    ticket: &'t ReadTicket,
}

impl<'t, R: Read> LimitedReader<'t, R> {
    pub fn new(inner: R, ticket: &'t ReadTicket) -> Self {
        Self { inner, ticket }
    }
}

impl<R: Read> Read for LimitedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ticket
            .acquire_if_needed()
            .map_err(|e| io::Error::new(io::ErrorKind::TimedOut, e))?;
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use vmingest_observe::RecordingMeter;

    #[test]
    fn test_acquire_and_release() {
        let limiter = ConcurrencyLimiter::new(2, Duration::from_secs(1));
        limiter.acquire().unwrap();
        limiter.acquire().unwrap();
        assert_eq!(limiter.in_use(), 2);
        limiter.release();
        limiter.release();
        assert_eq!(limiter.in_use(), 0);
    }

    #[test]
    fn test_acquire_times_out() {
        let meter = RecordingMeter::new();
        let limiter = ConcurrencyLimiter::with_meter(1, Duration::from_millis(50), &meter);
        limiter.acquire().unwrap();

        let err = limiter.acquire().unwrap_err();
        assert!(err.to_string().contains("1 concurrent insert requests"));
        assert_eq!(meter.value("vm_concurrent_insert_limit_reached_total", &[]), 1);
        assert_eq!(meter.value("vm_concurrent_insert_limit_timeout_total", &[]), 1);
        assert_eq!(meter.value("vm_concurrent_insert_current", &[]), 1);
    }

    #[test]
    fn test_waiter_gets_released_slot() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1, Duration::from_secs(10)));
        limiter.acquire().unwrap();

        let waiter = {
            let limiter = limiter.clone();
            thread::spawn(move || limiter.acquire())
        };
        thread::sleep(Duration::from_millis(50));
        limiter.release();

        waiter.join().unwrap().unwrap();
        assert_eq!(limiter.in_use(), 1);
    }

    #[test]
    fn test_reader_takes_slot_lazily() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1, Duration::from_secs(1)));
        let ticket = ReadTicket::new(limiter.clone());
        let mut reader = LimitedReader::new(&b"hello"[..], &ticket);
        assert_eq!(limiter.in_use(), 0);

        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).unwrap();
        assert!(ticket.is_held());
        assert_eq!(limiter.in_use(), 1);

        ticket.dec_concurrency();
        assert_eq!(limiter.in_use(), 0);
        // Releasing twice is a no-op.
        ticket.dec_concurrency();
        assert_eq!(limiter.in_use(), 0);

        reader.read_exact(&mut buf).unwrap();
        assert_eq!(limiter.in_use(), 1);

        drop(reader);
        drop(ticket);
        assert_eq!(limiter.in_use(), 0);
    }

    #[test]
    fn test_reader_reports_timeout() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1, Duration::from_millis(20)));
        limiter.acquire().unwrap();

        let ticket = ReadTicket::new(limiter.clone());
        let mut reader = LimitedReader::new(&b"data"[..], &ticket);
        let err = reader.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(!ticket.is_held());
        assert_eq!(limiter.in_use(), 1);
    }
}
