//! Workgroup, partition and padding arithmetic shared by every operator.
//!
//! Nothing in here touches a GPU; dispatchers feed tensor shapes and the
//! resolved `ShaderConfig` in and get group counts and partition plans out.

use crate::tuning::ShaderConfig;
use crate::{Error, Result};

/// Per-axis ceiling on the number of workgroups in one dispatch.
pub const MAX_GROUP_COUNT: u32 = 65535;

/// Number of `local`-sized groups needed to cover `x` items (`ceil(x / local)`).
///
/// `local` must be positive; a zero divisor is treated as one.
pub fn align(x: u32, local: u32) -> u32 {
    x.div_ceil(local.max(1))
}

/// Workgroup counts for a GEMM-shaped convolution dispatch.
///
/// - x covers the `n` output channels in `block_width` tiles
/// - y covers the `m` spatial positions in `block_height` tiles
/// - z covers the batch in `block_depth` tiles
pub fn gemm_workgroups(m: u32, n: u32, batch: u32, config: &ShaderConfig) -> [u32; 3] {
    [
        align(align(n, config.block_width), config.local_size_x),
        align(align(m, config.block_height), config.local_size_y),
        align(align(batch, config.block_depth), config.local_size_z),
    ]
}

/// Number of partitions needed to cover `n` channels in chunks of `group_y`.
pub fn partition_count(n: u32, group_y: u32) -> u32 {
    align(n, group_y)
}

/// One chunk of a linear (element-count driven) dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearChunk {
    /// First element covered by this chunk.
    pub offset: u32,
    /// Workgroups along x for this chunk.
    pub groups: u32,
}

/// Split a dispatch over `total` elements with `local`-wide workgroups into
/// chunks that each stay within `max_groups` workgroups.
pub fn linear_chunks(total: u32, local: u32, max_groups: u32) -> Vec<LinearChunk> {
    let local = local.max(1);
    let max_groups = max_groups.max(1);
    let mut remaining = align(total, local);
    let mut chunks = Vec::with_capacity(align(remaining, max_groups) as usize);
    let mut offset = 0u32;
    while remaining > 0 {
        let groups = remaining.min(max_groups);
        chunks.push(LinearChunk { offset, groups });
        offset = offset.saturating_add(groups.saturating_mul(local));
        remaining -= groups;
    }
    chunks
}

/// Check a workgroup triple against the per-axis limit.
pub fn check_group_limits(workgroups: [u32; 3], max_groups: u32) -> Result<()> {
    if let Some((axis, count)) = workgroups
        .iter()
        .enumerate()
        .find(|(_, count)| **count > max_groups)
    {
        return Err(Error::Dispatch(format!(
            "workgroup count {count} on axis {axis} exceeds the device limit {max_groups}"
        )));
    }
    Ok(())
}

/// Implicit padding scheme, numbered as the NN runtime encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaddingScheme {
    Same = 1,
    Valid = 2,
}

impl PaddingScheme {
    /// Best-effort scheme for an explicit padding operand set.
    ///
    /// Zero left and top padding reads as `Valid`, anything else as `Same`.
    /// Asymmetric explicit padding does not round-trip through this.
    pub fn infer(padding_left: u32, padding_top: u32) -> Self {
        if padding_left == 0 && padding_top == 0 {
            PaddingScheme::Valid
        } else {
            PaddingScheme::Same
        }
    }
}

impl TryFrom<u32> for PaddingScheme {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            1 => Ok(PaddingScheme::Same),
            2 => Ok(PaddingScheme::Valid),
            other => Err(Error::InvalidArgument(format!(
                "invalid padding scheme {other}"
            ))),
        }
    }
}

/// Output extent along one spatial axis for an implicit padding scheme.
///
/// `valid`: `ceil((in - (filter - 1) * dilation) / stride)`;
/// `same`: `ceil(in / stride)`.
pub fn output_size(
    input: u32,
    filter: u32,
    stride: u32,
    dilation: u32,
    scheme: PaddingScheme,
) -> u32 {
    match scheme {
        PaddingScheme::Valid => {
            let effective = filter.saturating_sub(1) * dilation;
            align(input.saturating_sub(effective), stride)
        }
        PaddingScheme::Same => align(input, stride),
    }
}

/// Output extent along one axis for explicit head/tail padding.
pub fn explicit_output_size(
    input: u32,
    filter: u32,
    stride: u32,
    dilation: u32,
    head: u32,
    tail: u32,
) -> u32 {
    let padded = input + head + tail;
    let effective = filter.saturating_sub(1) * dilation + 1;
    if padded < effective {
        return 0;
    }
    (padded - effective) / stride.max(1) + 1
}

/// Explicit `(head, tail)` padding realising an implicit scheme.
pub fn explicit_padding(
    input: u32,
    filter: u32,
    stride: u32,
    dilation: u32,
    scheme: PaddingScheme,
) -> (u32, u32) {
    match scheme {
        PaddingScheme::Valid => (0, 0),
        PaddingScheme::Same => {
            let out = output_size(input, filter, stride, dilation, scheme);
            let effective = filter.saturating_sub(1) * dilation + 1;
            let needed = (out.saturating_sub(1) * stride.max(1) + effective).saturating_sub(input);
            let head = needed / 2;
            (head, needed - head)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_is_ceiling_division() {
        for x in 1..200u32 {
            for local in 1..20u32 {
                let groups = align(x, local);
                assert_eq!(groups, (x + local - 1) / local);
                assert!(groups * local >= x);
                assert!((groups - 1) * local < x);
            }
        }
        assert_eq!(align(0, 16), 0);
    }

    #[test]
    fn test_partition_coverage() {
        for n in 1..300u32 {
            for group_y in 1..40u32 {
                let p = partition_count(n, group_y);
                assert!(p * group_y >= n);
                assert!((p - 1) * group_y < n);
            }
        }
    }

    #[test]
    fn test_gemm_workgroups_with_default_conv_config() {
        let config = ShaderConfig::new([1, 16, 1], [1, 1, 1]);
        // 8x8 output, 8 channels, batch 1
        assert_eq!(gemm_workgroups(64, 8, 1, &config), [8, 4, 1]);
    }

    #[test]
    fn test_gemm_workgroups_with_blocking() {
        let config = ShaderConfig::new([4, 8, 1], [4, 4, 1]);
        // n=32 -> 8 blocks -> 2 groups; m=100 -> 25 blocks -> 4 groups
        assert_eq!(gemm_workgroups(100, 32, 2, &config), [2, 4, 2]);
    }

    #[test]
    fn test_linear_chunks_respect_limit() {
        let chunks = linear_chunks(1000, 10, 30);
        // 100 groups total -> 30 + 30 + 30 + 10
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], LinearChunk { offset: 0, groups: 30 });
        assert_eq!(chunks[1].offset, 300);
        assert_eq!(chunks[3], LinearChunk { offset: 900, groups: 10 });
        assert_eq!(chunks.iter().map(|c| c.groups).sum::<u32>(), 100);

        assert!(linear_chunks(0, 256, MAX_GROUP_COUNT).is_empty());
        assert_eq!(linear_chunks(256, 256, MAX_GROUP_COUNT).len(), 1);
    }

    #[test]
    fn test_group_limit_check() {
        assert!(check_group_limits([MAX_GROUP_COUNT, 1, 1], MAX_GROUP_COUNT).is_ok());
        assert!(check_group_limits([1, MAX_GROUP_COUNT + 1, 1], MAX_GROUP_COUNT).is_err());
    }

    #[test]
    fn test_valid_padding_is_zero() {
        assert_eq!(explicit_padding(10, 3, 2, 1, PaddingScheme::Valid), (0, 0));
        assert_eq!(output_size(10, 3, 2, 1, PaddingScheme::Valid), 4);
    }

    #[test]
    fn test_same_padding_output_size() {
        assert_eq!(output_size(10, 3, 2, 1, PaddingScheme::Same), 5);
        let (head, tail) = explicit_padding(10, 3, 2, 1, PaddingScheme::Same);
        assert_eq!(explicit_output_size(10, 3, 2, 1, head, tail), 5);

        // 224 input, 3x3 filter, stride 2: one pixel of padding, all at the tail
        assert_eq!(explicit_padding(224, 3, 2, 1, PaddingScheme::Same), (0, 1));
        // stride 1 keeps the extent and splits the padding evenly
        assert_eq!(explicit_padding(8, 3, 1, 1, PaddingScheme::Same), (1, 1));
    }

    #[test]
    fn test_padding_scheme_heuristic() {
        assert_eq!(PaddingScheme::infer(0, 0), PaddingScheme::Valid);
        assert_eq!(PaddingScheme::infer(1, 1), PaddingScheme::Same);
        assert_eq!(PaddingScheme::infer(0, 1), PaddingScheme::Same);
        assert_eq!(PaddingScheme::try_from(2).unwrap(), PaddingScheme::Valid);
        assert!(PaddingScheme::try_from(0).is_err());
    }
}
