//! Driver timers: a delta queue multiplexing one hardware countdown
//!
//! One general-purpose countdown timer serves every driver-owned one-shot
//! timer. Entries sit in a singly linked list sorted by fire time, each
//! storing microseconds *relative to its predecessor*, so only the head's
//! remaining time has to track the hardware. The queue itself is pure
//! bookkeeping; the engine programs the countdown with whatever
//! [`Reprogram`] value an operation hands back.

use crate::driver::DriverId;
use crate::pool::{Handle, Slab};

/// Requests below this are silently ignored. A hard floor, not a rounding:
/// the reprogramming overhead makes shorter countdowns meaningless.
pub const MIN_TIMER_US: u32 = 100;

/// Handle to a pending timer
pub type TimerHandle = Handle<Timer>;

/// One pending one-shot timer
pub struct Timer {
    /// Microseconds after the predecessor entry fires
    delta_us: u32,
    /// Owning driver, dispatched on fire
    driver: DriverId,
    /// Opaque driver payload, handed back on fire
    payload: u32,
    next: Option<TimerHandle>,
}

/// What the caller must do to the hardware countdown after an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reprogram {
    /// Leave the countdown alone
    Keep,
    /// Stop the countdown; the queue is empty
    Stop,
    /// Restart the countdown with this many microseconds
    Start(u32),
}

/// Sorted delta queue over pooled timer records
pub struct TimerQueue<const N: usize> {
    slab: Slab<Timer, N>,
    head: Option<TimerHandle>,
}

impl<const N: usize> TimerQueue<N> {
    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            slab: Slab::new(),
            head: None,
        }
    }

    /// Pending timer count
    pub fn len(&self) -> usize {
        self.slab.in_use()
    }

    /// Whether no timers are pending
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Sync the head's stored delta to the hardware's remaining time
    ///
    /// Later entries are relative to the head, so their absolute fire times
    /// are unchanged by this.
    fn normalize_head(&mut self, head_remaining_us: u32) {
        if let Some(h) = self.head {
            if let Some(head) = self.slab.get_mut(h) {
                head.delta_us = head_remaining_us;
            }
        }
    }

    /// Insert a one-shot timer firing `micros` from now
    ///
    /// `head_remaining_us` is the hardware countdown's current value (ignored
    /// when the queue is empty). Returns `None` when `micros` is under the
    /// floor or the pool is exhausted; otherwise the handle plus the
    /// countdown action.
    pub fn start(
        &mut self,
        driver: DriverId,
        payload: u32,
        micros: u32,
        head_remaining_us: u32,
    ) -> Option<(TimerHandle, Reprogram)> {
        if micros < MIN_TIMER_US {
            return None;
        }
        if self.slab.is_full() {
            return None;
        }
        self.normalize_head(head_remaining_us);

        // Find the insertion point: the entry the new timer fires before
        let mut remaining = micros;
        let mut prev: Option<TimerHandle> = None;
        let mut cursor = self.head;
        while let Some(c) = cursor {
            let delta = self.slab.get(c).map(|t| t.delta_us).unwrap_or(0);
            if remaining < delta {
                break;
            }
            remaining -= delta;
            prev = Some(c);
            cursor = self.slab.get(c).and_then(|t| t.next);
        }

        let handle = self.slab.acquire(Timer {
            delta_us: remaining,
            driver,
            payload,
            next: cursor,
        })?;

        // The successor is now relative to the new entry
        if let Some(c) = cursor {
            if let Some(succ) = self.slab.get_mut(c) {
                succ.delta_us -= remaining;
            }
        }

        match prev {
            Some(p) => {
                if let Some(pred) = self.slab.get_mut(p) {
                    pred.next = Some(handle);
                }
                Some((handle, Reprogram::Keep))
            }
            None => {
                self.head = Some(handle);
                Some((handle, Reprogram::Start(remaining)))
            }
        }
    }

    /// Remove a pending timer without firing it
    ///
    /// The removed entry's remaining delta folds into its successor, so no
    /// other entry's absolute fire time moves. Stale handles return
    /// `Reprogram::Keep`.
    pub fn stop(&mut self, handle: TimerHandle, head_remaining_us: u32) -> Reprogram {
        if !self.slab.contains(handle) {
            return Reprogram::Keep;
        }
        self.normalize_head(head_remaining_us);

        // Locate the predecessor
        let mut prev: Option<TimerHandle> = None;
        let mut cursor = self.head;
        while let Some(c) = cursor {
            if c == handle {
                break;
            }
            prev = Some(c);
            cursor = self.slab.get(c).and_then(|t| t.next);
        }
        if cursor != Some(handle) {
            return Reprogram::Keep;
        }

        let removed = match self.slab.release(handle) {
            Some(t) => t,
            None => return Reprogram::Keep,
        };

        if let Some(n) = removed.next {
            if let Some(succ) = self.slab.get_mut(n) {
                succ.delta_us += removed.delta_us;
            }
        }

        match prev {
            Some(p) => {
                if let Some(pred) = self.slab.get_mut(p) {
                    pred.next = removed.next;
                }
                Reprogram::Keep
            }
            None => {
                self.head = removed.next;
                match self.head {
                    Some(h) => {
                        let delta = self.slab.get(h).map(|t| t.delta_us).unwrap_or(0);
                        Reprogram::Start(delta)
                    }
                    None => Reprogram::Stop,
                }
            }
        }
    }

    /// The hardware countdown expired: pop the head entry
    ///
    /// Returns the owner and payload to dispatch, plus the countdown action
    /// for the new head.
    pub fn fire(&mut self) -> Option<(DriverId, u32, Reprogram)> {
        let h = self.head?;
        let fired = self.slab.release(h)?;
        self.head = fired.next;
        let reprogram = match self.head {
            Some(n) => {
                let delta = self.slab.get(n).map(|t| t.delta_us).unwrap_or(0);
                Reprogram::Start(delta)
            }
            None => Reprogram::Stop,
        };
        Some((fired.driver, fired.payload, reprogram))
    }

    /// Remove every timer owned by `driver` (device disconnect path)
    pub fn stop_all_for(&mut self, driver: DriverId, head_remaining_us: u32) -> Reprogram {
        let mut result = Reprogram::Keep;
        // Removing the head changes what the countdown would be showing;
        // every later removal must see that effective value, not the
        // entry-time snapshot
        let mut head_remaining = head_remaining_us;
        loop {
            let mut victim = None;
            let mut cursor = self.head;
            while let Some(c) = cursor {
                if self.slab.get(c).map(|t| t.driver) == Some(driver) {
                    victim = Some(c);
                    break;
                }
                cursor = self.slab.get(c).and_then(|t| t.next);
            }
            match victim {
                Some(v) => match self.stop(v, head_remaining) {
                    Reprogram::Keep => {}
                    Reprogram::Stop => result = Reprogram::Stop,
                    Reprogram::Start(us) => {
                        head_remaining = us;
                        result = Reprogram::Start(us);
                    }
                },
                None => return result,
            }
        }
    }

    #[cfg(test)]
    fn absolute_fire_times(&self) -> heapless::Vec<(TimerHandle, u64), N> {
        let mut out = heapless::Vec::new();
        let mut total = 0u64;
        let mut cursor = self.head;
        while let Some(c) = cursor {
            let t = self.slab.get(c).unwrap();
            total += t.delta_us as u64;
            out.push((c, total)).ok();
            cursor = t.next;
        }
        out
    }
}

impl<const N: usize> Default for TimerQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}
