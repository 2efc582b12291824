//! Element precisions and host-array conversion.
//!
//! Host arrays are converted to the block's storage precision on write and back
//! on read. Matching precisions are copied bit for bit; a narrowing round trip
//! (e.g. f64 stored as f16) is exact up to the storage format's resolution.

use half::f16;
use serde::{Deserialize, Serialize};

/// Storage precision of elements inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Half,
    Float,
    Double,
}

impl Precision {
    pub fn size_bytes(&self) -> usize {
        match self {
            Precision::Half => 2,
            Precision::Float => 4,
            Precision::Double => 8,
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precision::Half => write!(f, "f16"),
            Precision::Float => write!(f, "f32"),
            Precision::Double => write!(f, "f64"),
        }
    }
}

/// Element types a host array may hold.
pub trait HostScalar: bytemuck::Pod {
    const PRECISION: Precision;

    fn to_f64(self) -> f64;

    fn from_f64(value: f64) -> Self;
}

impl HostScalar for f16 {
    const PRECISION: Precision = Precision::Half;

    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }

    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
}

impl HostScalar for f32 {
    const PRECISION: Precision = Precision::Float;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl HostScalar for f64 {
    const PRECISION: Precision = Precision::Double;

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }
}

/// Bytes `len` elements occupy when stored at `precision`.
pub fn stored_len(precision: Precision, len: usize) -> u64 {
    (len as u64).saturating_mul(precision.size_bytes() as u64)
}

/// Convert a host array into stored bytes.
pub fn encode<T: HostScalar>(precision: Precision, data: &[T]) -> Vec<u8> {
    if T::PRECISION == precision {
        return bytemuck::cast_slice(data).to_vec();
    }
    let mut out = Vec::with_capacity(data.len() * precision.size_bytes());
    for &value in data {
        let v = value.to_f64();
        match precision {
            Precision::Half => out.extend_from_slice(&f16::from_f64(v).to_ne_bytes()),
            Precision::Float => out.extend_from_slice(&(v as f32).to_ne_bytes()),
            Precision::Double => out.extend_from_slice(&v.to_ne_bytes()),
        }
    }
    out
}

/// Convert stored bytes back into a host array. `bytes` must hold exactly
/// `out.len()` elements at `precision`.
pub fn decode<T: HostScalar>(precision: Precision, bytes: &[u8], out: &mut [T]) {
    if T::PRECISION == precision {
        bytemuck::cast_slice_mut::<T, u8>(out).copy_from_slice(bytes);
        return;
    }
    let width = precision.size_bytes();
    for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(width)) {
        let v = match precision {
            Precision::Half => f16::from_ne_bytes([chunk[0], chunk[1]]).to_f64(),
            Precision::Float => {
                f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64
            }
            Precision::Double => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_ne_bytes(raw)
            }
        };
        *slot = T::from_f64(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_precision_bit_exact() {
        let data = [1.5f32, -0.0, f32::MIN_POSITIVE, 3.25e7];
        let bytes = encode(Precision::Float, &data);
        assert_eq!(bytes.len(), 16);

        let mut out = [0f32; 4];
        decode(Precision::Float, &bytes, &mut out);
        for (a, b) in data.iter().zip(out.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_narrowing_within_tolerance() {
        let data: Vec<f64> = (0..64).map(|i| i as f64 * 0.37 - 5.0).collect();
        let bytes = encode(Precision::Half, &data);
        assert_eq!(bytes.len(), 128);

        let mut out = vec![0f64; 64];
        decode(Precision::Half, &bytes, &mut out);
        for (a, b) in data.iter().zip(out.iter()) {
            // f16 has an 11-bit significand.
            assert!((a - b).abs() <= a.abs() * 1e-3 + 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn test_widening_exact() {
        let data = [f16::from_f32(0.5), f16::from_f32(-2.0)];
        let bytes = encode(Precision::Double, &data);
        let mut out = [f16::ZERO; 2];
        decode(Precision::Double, &bytes, &mut out);
        assert_eq!(out, data);
    }
}
