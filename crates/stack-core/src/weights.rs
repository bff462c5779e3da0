//! Shared weight arena.
//!
//! One flat `f32` buffer serves every stage of a stack. A stage with
//! increment `inc` owns the offsets `[o, o + inc)` below each feature slot,
//! where `o` is the offset it was called with. The feature slot itself is
//! `f << stride_shift`, with `stride_shift = ceil(log2(total_increment))`, so
//! the regions of different features never overlap.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StackError};
use crate::io::ModelIo;

/// Widest address a weight vector may use: `bits + stride_shift`.
pub const MAX_ADDRESS_BITS: u32 = 32;

/// Immutable addressing parameters, fixed at assembly time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrideLayout {
    pub bits: u32,
    pub stride_shift: u32,
    /// Increment of the top stage: the number of offsets a feature needs
    pub total_increment: u64,
}

impl StrideLayout {
    pub fn new(bits: u32, total_increment: u64) -> Self {
        Self {
            bits,
            stride_shift: ceil_log2(total_increment.max(1)),
            total_increment: total_increment.max(1),
        }
    }

    /// Like `new`, but rejects layouts wider than [`MAX_ADDRESS_BITS`].
    pub fn checked(bits: u32, total_increment: u64) -> Result<Self> {
        let layout = Self::new(bits, total_increment);
        match bits.checked_add(layout.stride_shift) {
            Some(width) if width <= MAX_ADDRESS_BITS => Ok(layout),
            _ => Err(StackError::AddressSpace {
                bits,
                stride_shift: layout.stride_shift,
                max: MAX_ADDRESS_BITS,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.bits
            .checked_add(self.stride_shift)
            .and_then(|width| 1usize.checked_shl(width))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mask(&self) -> u64 {
        (self.len() as u64).wrapping_sub(1)
    }
}

/// Physical index of feature `feature` at accumulated call offset `offset`.
pub fn address(layout: &StrideLayout, feature: u64, offset: u64) -> usize {
    debug_assert!(offset < (1u64 << layout.stride_shift));
    (((feature << layout.stride_shift).wrapping_add(offset)) & layout.mask()) as usize
}

/// Stacking a stage with `multiplier` over a base with `base_increment`.
pub fn allocate(base_increment: u64, multiplier: u64) -> u64 {
    base_increment * multiplier
}

fn ceil_log2(v: u64) -> u32 {
    if v <= 1 {
        0
    } else {
        64 - (v - 1).leading_zeros()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightVector {
    layout: StrideLayout,
    data: Vec<f32>,
}

impl WeightVector {
    pub fn new(bits: u32, total_increment: u64) -> Result<Self> {
        let layout = StrideLayout::checked(bits, total_increment)?;
        Ok(Self {
            data: vec![0.0; layout.len()],
            layout,
        })
    }

    pub fn layout(&self) -> &StrideLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn address(&self, feature: u64, offset: u64) -> usize {
        address(&self.layout, feature, offset)
    }

    pub fn get(&self, feature: u64, offset: u64) -> f32 {
        self.data[self.address(feature, offset)]
    }

    pub fn get_mut(&mut self, feature: u64, offset: u64) -> &mut f32 {
        let idx = self.address(feature, offset);
        &mut self.data[idx]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Dot product of `features` against the region at `offset`.
    pub fn dot(&self, features: &[(u64, f32)], offset: u64) -> f32 {
        features
            .iter()
            .map(|(f, v)| self.get(*f, offset) * v)
            .sum()
    }

    /// Writes (or reads) the non-zero weights as `(index, value)` records,
    /// terminated by `u64::MAX`.
    pub fn save_load(&mut self, io: &mut dyn ModelIo, read: bool) -> std::io::Result<()> {
        if read {
            let mut loaded = vec![0.0f32; self.data.len()];
            loop {
                let idx = io.read_u64()?;
                if idx == u64::MAX {
                    break;
                }
                let value = io.read_f32()?;
                let slot = loaded.get_mut(idx as usize).ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("weight index {} outside {} slots", idx, self.data.len()),
                    )
                })?;
                *slot = value;
            }
            self.data = loaded;
        } else if io.text_mode() {
            for (idx, w) in self.data.iter().enumerate() {
                if *w != 0.0 {
                    io.write_text(&format!("{}:{}\n", idx, w))?;
                }
            }
        } else {
            for (idx, w) in self.data.iter().enumerate() {
                if *w != 0.0 {
                    io.write_u64("index", idx as u64)?;
                    io.write_f32("weight", *w)?;
                }
            }
            io.write_u64("end", u64::MAX)?;
        }
        Ok(())
    }

    pub fn check_same_layout(&self, other: &WeightVector) -> Result<()> {
        if self.layout != other.layout {
            return Err(StackError::StructureMismatch {
                depth: 0,
                detail: format!(
                    "weight layouts differ: {:?} vs {:?}",
                    self.layout, other.layout
                ),
            });
        }
        Ok(())
    }
}
