//! Cache keys for descriptor/workspace bundles.

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::memory::precision::Precision;
use crate::native::DescriptorSpec;

/// Everything that changes the descriptors, algorithm or workspace of one
/// operation. Two keys compare equal only when the native calls they drive
/// would be identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeKey {
    /// Input tensor dimensions.
    pub input: Vec<usize>,

    /// Kernel/filter dimensions.
    pub filter: Vec<usize>,

    /// Output tensor dimensions.
    pub output: Vec<usize>,

    pub stride: Vec<usize>,

    pub padding: Vec<usize>,

    pub precision: Precision,

    /// Sequence/batch length for recurrent operations (0 when unused).
    pub batch_len: usize,

    /// Device the bundle is resident on.
    pub device: DeviceId,
}

impl ShapeKey {
    /// A 2-D convolution key. Output dimensions are derived from the input,
    /// filter, stride and padding.
    pub fn conv2d(
        device: DeviceId,
        precision: Precision,
        input: [usize; 4],
        filter: [usize; 4],
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Self {
        let [n, _c, h, w] = input;
        let [k, _, fh, fw] = filter;
        let out = |size: usize, f: usize, s: usize, p: usize| {
            (size + 2 * p).saturating_sub(f) / s.max(1) + 1
        };
        Self {
            input: input.to_vec(),
            filter: filter.to_vec(),
            output: vec![
                n,
                k,
                out(h, fh, stride[0], padding[0]),
                out(w, fw, stride[1], padding[1]),
            ],
            stride: stride.to_vec(),
            padding: padding.to_vec(),
            precision,
            batch_len: 0,
            device,
        }
    }

    pub fn with_batch_len(mut self, batch_len: usize) -> Self {
        self.batch_len = batch_len;
        self
    }

    /// Descriptor specs for the input, output and filter tensors, in that order.
    pub fn descriptor_specs(&self) -> [DescriptorSpec; 3] {
        [&self.input, &self.output, &self.filter].map(|dims| DescriptorSpec {
            dims: dims.clone(),
            precision: self.precision,
        })
    }
}

impl std::fmt::Display for ShapeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}*{:?}->{:?} s{:?} p{:?} {} b{} @{}",
            self.input,
            self.filter,
            self.output,
            self.stride,
            self.padding,
            self.precision,
            self.batch_len,
            self.device
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn key() -> ShapeKey {
        ShapeKey::conv2d(0, Precision::Float, [8, 3, 32, 32], [16, 3, 3, 3], [1, 1], [1, 1])
    }

    #[test]
    fn test_conv2d_output_shape() {
        assert_eq!(key().output, vec![8, 16, 32, 32]);
        let strided =
            ShapeKey::conv2d(0, Precision::Float, [1, 3, 32, 32], [4, 3, 3, 3], [2, 2], [0, 0]);
        assert_eq!(strided.output, vec![1, 4, 15, 15]);
    }

    #[test]
    fn test_every_field_distinguishes() {
        let base = key();
        let mut variants = vec![base.clone()];
        variants.push(ShapeKey { device: 1, ..base.clone() });
        variants.push(ShapeKey { precision: Precision::Half, ..base.clone() });
        variants.push(base.clone().with_batch_len(4));
        variants.push(ShapeKey { stride: vec![2, 2], ..base.clone() });
        variants.push(ShapeKey { padding: vec![0, 0], ..base.clone() });
        variants.push(ShapeKey { filter: vec![16, 3, 5, 5], ..base.clone() });

        let unique: HashSet<_> = variants.iter().cloned().collect();
        assert_eq!(unique.len(), variants.len());
        assert_eq!(base, key());
    }

    #[test]
    fn test_descriptor_specs_order() {
        let specs = key().descriptor_specs();
        assert_eq!(specs[0].dims, vec![8, 3, 32, 32]);
        assert_eq!(specs[1].dims, vec![8, 16, 32, 32]);
        assert_eq!(specs[2].dims, vec![16, 3, 3, 3]);
    }
}
