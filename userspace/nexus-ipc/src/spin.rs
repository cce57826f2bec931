// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cooperative suspension for blocking IPC operations
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (host)
//!
//! Blocking calls in this crate (`Rpc::call`, `DataChannel::receive`, transient
//! send retries) never sleep on their own; they poll a predicate and hand the
//! processor back through a [`Yield`] hook between attempts. The loops are
//! unbounded: a silent peer keeps the caller spinning.

use nexus_abi::ChanError;

/// Hook invoked between attempts of a blocking loop.
pub trait Yield {
    /// Gives other work a chance to run.
    fn yield_now(&self);
}

/// Yields the current OS thread to the scheduler.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadYield;

impl Yield for ThreadYield {
    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

/// Busy-waits with a CPU spin hint; for peers polled on another core.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpinYield;

impl Yield for SpinYield {
    fn yield_now(&self) {
        core::hint::spin_loop();
    }
}

impl<Y: Yield + ?Sized> Yield for &Y {
    fn yield_now(&self) {
        (**self).yield_now()
    }
}

/// Spins until `ready` returns `true`, yielding between attempts.
pub fn spin_until(hook: &dyn Yield, mut ready: impl FnMut() -> bool) {
    while !ready() {
        hook.yield_now();
    }
}

/// Repeats `op` while it fails with [`ChanError::Transient`].
///
/// Any other failure is returned to the caller untouched.
pub fn retry_transient<T>(
    hook: &dyn Yield,
    mut op: impl FnMut() -> nexus_abi::Result<T>,
) -> nexus_abi::Result<T> {
    let mut spins: u64 = 0;
    loop {
        match op() {
            Err(err) if err.is_transient() => {
                spins = spins.wrapping_add(1);
                if spins & 0x3ff == 0 {
                    log::trace!("endpoint still saturated after {spins} retries");
                }
                hook.yield_now();
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    struct Counting(Cell<usize>);

    impl Yield for Counting {
        fn yield_now(&self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn spin_until_yields_between_failed_attempts() {
        let hook = Counting(Cell::new(0));
        let mut attempts = 0;
        spin_until(&hook, || {
            attempts += 1;
            attempts == 4
        });
        assert_eq!(hook.0.get(), 3);
    }

    #[test]
    fn transient_is_retried_and_fatal_is_not() {
        let hook = Counting(Cell::new(0));
        let mut attempts = 0;
        let out = retry_transient(&hook, || {
            attempts += 1;
            if attempts < 3 {
                Err(ChanError::Transient)
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(out, Ok(3));
        assert_eq!(hook.0.get(), 2);

        let fatal: nexus_abi::Result<()> = retry_transient(&hook, || Err(ChanError::NotConnected));
        assert_eq!(fatal, Err(ChanError::NotConnected));
        assert_eq!(hook.0.get(), 2);
    }
}
