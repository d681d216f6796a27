use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outbound submission gate. A breaker is *disabled* when it imposes no
/// limit, and *open* when it is currently rejecting submissions.
pub trait Breaker: Send + Sync {
    fn disabled(&self) -> bool;
    fn open(&self) -> bool;
    /// Record a submission, rejecting with `Throttled` if the breaker is
    /// open.
    fn submit(&self) -> Result<()>;
}

/// Sliding-window rate breaker: at most `capacity` submissions per
/// `window`. Capacity 0 disables the breaker.
pub struct RateBreaker {
    capacity: usize,
    window: Duration,
    hits: Mutex<VecDeque<Instant>>,
}

impl RateBreaker {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            hits: Mutex::new(VecDeque::new()),
        }
    }

    fn pruned_len(&self, hits: &mut VecDeque<Instant>) -> usize {
        if let Some(cutoff) = Instant::now().checked_sub(self.window) {
            while hits.front().is_some_and(|t| *t < cutoff) {
                hits.pop_front();
            }
        }
        hits.len()
    }
}

impl Breaker for RateBreaker {
    fn disabled(&self) -> bool {
        self.capacity == 0
    }

    fn open(&self) -> bool {
        if self.disabled() {
            return false;
        }
        match self.hits.lock() {
            Ok(mut hits) => self.pruned_len(&mut hits) >= self.capacity,
            Err(_) => false,
        }
    }

    fn submit(&self) -> Result<()> {
        if self.disabled() {
            return Ok(());
        }
        let mut hits = self
            .hits
            .lock()
            .map_err(|e| Error::Throttled(e.to_string()))?;
        if self.pruned_len(&mut hits) >= self.capacity {
            return Err(Error::Throttled(format!(
                "over {} submissions per {:?}",
                self.capacity, self.window
            )));
        }
        hits.push_back(Instant::now());
        Ok(())
    }
}

/// Composite of breakers: open if any enabled constituent is open, disabled
/// only if every constituent is disabled.
pub struct CompositeBreaker {
    parts: Vec<Arc<dyn Breaker>>,
}

impl CompositeBreaker {
    pub fn new(parts: Vec<Arc<dyn Breaker>>) -> Self {
        Self { parts }
    }
}

impl Breaker for CompositeBreaker {
    fn disabled(&self) -> bool {
        self.parts.iter().all(|p| p.disabled())
    }

    fn open(&self) -> bool {
        self.parts.iter().any(|p| p.open())
    }

    fn submit(&self) -> Result<()> {
        for part in &self.parts {
            part.submit()?;
        }
        Ok(())
    }
}

/// Bounded admission counter. `acquire` rejects with `TooMany` once `limit`
/// requests are in flight; the returned guard releases its slot on drop.
/// Limit 0 means unbounded.
pub struct Admission {
    limit: usize,
    current: Arc<AtomicUsize>,
}

pub struct AdmissionGuard {
    current: Arc<AtomicUsize>,
}

impl Admission {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            current: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn acquire(&self) -> Result<AdmissionGuard> {
        if self.limit > 0 && self.current.fetch_add(1, Ordering::SeqCst) >= self.limit {
            self.current.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::TooMany);
        }
        Ok(AdmissionGuard {
            current: Arc::clone(&self.current),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_breaker_rejects_over_capacity() {
        let breaker = RateBreaker::new(2, Duration::from_secs(60));
        breaker.submit().expect("first");
        breaker.submit().expect("second");
        assert!(breaker.open());
        assert!(matches!(breaker.submit(), Err(Error::Throttled(_))));
    }

    #[test]
    fn rate_breaker_window_slides() {
        let breaker = RateBreaker::new(1, Duration::from_millis(20));
        breaker.submit().expect("first");
        assert!(breaker.submit().is_err());
        std::thread::sleep(Duration::from_millis(30));
        breaker.submit().expect("after window");
    }

    #[test]
    fn zero_capacity_is_disabled() {
        let breaker = RateBreaker::new(0, Duration::from_secs(1));
        assert!(breaker.disabled());
        assert!(!breaker.open());
        for _ in 0..100 {
            breaker.submit().expect("disabled never throttles");
        }
    }

    #[test]
    fn composite_is_open_if_any_part_is() {
        let tight = Arc::new(RateBreaker::new(1, Duration::from_secs(60)));
        let loose = Arc::new(RateBreaker::new(100, Duration::from_secs(60)));
        let both = CompositeBreaker::new(vec![tight.clone(), loose]);
        both.submit().expect("first");
        assert!(both.open());
        assert!(both.submit().is_err());
    }

    #[test]
    fn composite_is_disabled_only_when_all_are() {
        let off = Arc::new(RateBreaker::new(0, Duration::from_secs(1)));
        let on = Arc::new(RateBreaker::new(5, Duration::from_secs(1)));
        assert!(CompositeBreaker::new(vec![off.clone(), off.clone()]).disabled());
        assert!(!CompositeBreaker::new(vec![off, on]).disabled());
    }

    #[test]
    fn admission_limits_in_flight_requests() {
        let admission = Admission::new(2);
        let a = admission.acquire().expect("a");
        let _b = admission.acquire().expect("b");
        assert!(matches!(admission.acquire(), Err(Error::TooMany)));
        drop(a);
        let _c = admission.acquire().expect("slot freed");
        assert_eq!(admission.in_flight(), 2);
    }
}
