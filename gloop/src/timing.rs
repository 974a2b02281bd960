//! Hashed timing wheel driving the watchdog.
//!
//! Use [`with_wheel`]: handles carry the wheel's generativity brand, so a
//! handle from one wheel cannot be used to cancel a timer in another.

mod slab;
mod wheel;

pub use wheel::{TICK, TimerHandle, Wheel, WheelError};

/// Runs `f` with a fresh wheel of `SLOTS` one-millisecond slots holding at
/// most `capacity` timers. Branded handles cannot escape the closure.
///
/// A handle only fits the wheel that issued it:
///
/// ```compile_fail
/// use gloop::timing::with_wheel;
///
/// with_wheel::<u32, 8, _>(4, |a| {
///     let handle = a.schedule_after(1, 1).unwrap();
///     with_wheel::<u32, 8, _>(4, |b| {
///         b.cancel(&handle);
///     });
/// });
/// ```
pub fn with_wheel<T, const SLOTS: usize, R>(
    capacity: u32,
    f: impl for<'id> FnOnce(&mut Wheel<'id, T, SLOTS>) -> R,
) -> R {
    generativity::make_guard!(guard);
    let mut wheel: Wheel<'_, T, SLOTS> = Wheel::new(guard.into(), capacity);
    f(&mut wheel)
}
