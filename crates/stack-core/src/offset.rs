//! Scoped weight-offset adjustment.
//!
//! A stage that calls its base with sub-index `k` shifts every example's
//! `ft_offset` by `base.increment * k` for the duration of the call. The
//! shift is undone when the guard drops, on every exit path: normal return,
//! `?` propagation and unwinding panics alike.

use std::ops::{Deref, DerefMut};

use crate::data_model::{Example, MultiEx};

/// Anything whose weight offset can be shifted for a nested call.
pub trait Offset {
    fn shift(&mut self, delta: u64);
    fn unshift(&mut self, delta: u64);
}

impl Offset for Example {
    fn shift(&mut self, delta: u64) {
        self.ft_offset += delta;
    }

    fn unshift(&mut self, delta: u64) {
        self.ft_offset -= delta;
    }
}

impl Offset for MultiEx {
    fn shift(&mut self, delta: u64) {
        for ex in self.iter_mut() {
            ex.ft_offset += delta;
        }
    }

    fn unshift(&mut self, delta: u64) {
        for ex in self.iter_mut() {
            ex.ft_offset -= delta;
        }
    }
}

/// Holds a unit shifted by `delta` and restores it on drop.
pub struct OffsetGuard<'a, U: Offset + ?Sized> {
    unit: &'a mut U,
    delta: u64,
}

impl<'a, U: Offset + ?Sized> OffsetGuard<'a, U> {
    pub fn new(unit: &'a mut U, delta: u64) -> Self {
        if delta != 0 {
            unit.shift(delta);
        }
        Self { unit, delta }
    }

    pub fn delta(&self) -> u64 {
        self.delta
    }
}

impl<U: Offset + ?Sized> Deref for OffsetGuard<'_, U> {
    type Target = U;

    fn deref(&self) -> &U {
        self.unit
    }
}

impl<U: Offset + ?Sized> DerefMut for OffsetGuard<'_, U> {
    fn deref_mut(&mut self) -> &mut U {
        self.unit
    }
}

impl<U: Offset + ?Sized> Drop for OffsetGuard<'_, U> {
    fn drop(&mut self) {
        if self.delta != 0 {
            self.unit.unshift(self.delta);
        }
    }
}
