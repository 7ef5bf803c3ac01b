use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic millisecond counter plus a blocking sleep.
pub trait Monotonic {
    /// Milliseconds since boot. Never goes backwards.
    fn now_ms(&self) -> i64;

    fn sleep(&self, duration: Duration);
}

impl<T: Monotonic + ?Sized> Monotonic for &T {
    fn now_ms(&self) -> i64 {
        (**self).now_ms()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

impl<T: Monotonic + ?Sized> Monotonic for std::rc::Rc<T> {
    fn now_ms(&self) -> i64 {
        (**self).now_ms()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// `std::time::Instant` based timer.
pub struct StdMonotonic {
    origin: Instant,
}

impl StdMonotonic {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdMonotonic {
    fn default() -> Self {
        Self::new()
    }
}

impl Monotonic for StdMonotonic {
    fn now_ms(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// User-initiated stop request, set from the console thread.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Clamp a duration to whole milliseconds in `i64`.
pub fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_is_shared_between_clones() {
        let a = Interrupt::new();
        let b = a.clone();
        assert!(!b.is_set());
        a.trigger();
        assert!(b.is_set());
    }

    #[test]
    fn std_timer_moves_forward() {
        let t = StdMonotonic::new();
        let before = t.now_ms();
        t.sleep(Duration::from_millis(2));
        assert!(t.now_ms() >= before + 1);
    }
}
