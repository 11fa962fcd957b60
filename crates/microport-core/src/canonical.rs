//! Maps a declared tensor shape onto a canonical (height, width, channels)
//! triple.
//!
//! Each (role, rank) pair selects one [`RankRule`] from a static table. A rule
//! names which declared axis feeds each canonical axis, whether a leading
//! batch axis must be 1, and whether the channel count is restricted. Shapes
//! that don't satisfy their rule are rejected; nothing is clamped or guessed.

use crate::{Hwc, PipelineError, PipelineResult, TensorRole};

/// Where a canonical axis takes its value from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    /// Declared dimension at this index.
    Dim(usize),
    /// Implicit unit axis not present in the declaration.
    Unit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelPolicy {
    /// Grayscale or RGB only: channels must be 1 or 3.
    ImageLike,
    /// Any positive channel count (feature maps and vectors).
    Unrestricted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RankRule {
    /// Declared axis that must equal 1, if the rank carries a batch axis.
    pub batch: Option<usize>,
    pub height: Axis,
    pub width: Axis,
    pub channels: Axis,
    pub channel_policy: ChannelPolicy,
}

impl RankRule {
    const fn new(batch: Option<usize>, hwc: [Axis; 3], channel_policy: ChannelPolicy) -> Self {
        Self {
            batch,
            height: hwc[0],
            width: hwc[1],
            channels: hwc[2],
            channel_policy,
        }
    }
}

use Axis::{Dim, Unit};
use ChannelPolicy::{ImageLike, Unrestricted};

/// Indexed by declared rank; `None` marks an unsupported rank.
const INPUT_RULES: [Option<RankRule>; 5] = [
    None,
    None,
    // [h][w], single channel implied
    Some(RankRule::new(None, [Dim(0), Dim(1), Unit], ImageLike)),
    // [h][w][c]
    Some(RankRule::new(None, [Dim(0), Dim(1), Dim(2)], ImageLike)),
    // [n==1][h][w][c]
    Some(RankRule::new(Some(0), [Dim(1), Dim(2), Dim(3)], ImageLike)),
];

const OUTPUT_RULES: [Option<RankRule>; 5] = [
    None,
    // [c]
    Some(RankRule::new(None, [Unit, Unit, Dim(0)], Unrestricted)),
    // [n==1][c]
    Some(RankRule::new(Some(0), [Unit, Unit, Dim(1)], Unrestricted)),
    // [h][w][c]
    Some(RankRule::new(None, [Dim(0), Dim(1), Dim(2)], Unrestricted)),
    // [n==1][h][w][c]
    Some(RankRule::new(Some(0), [Dim(1), Dim(2), Dim(3)], Unrestricted)),
];

/// Looks up the canonicalization rule for a tensor of the given role and rank.
pub fn rule_for(role: TensorRole, rank: usize) -> Option<&'static RankRule> {
    let table = match role {
        TensorRole::Input => &INPUT_RULES,
        TensorRole::Output => &OUTPUT_RULES,
    };
    table.get(rank).and_then(Option::as_ref)
}

/// Derives the canonical (height, width, channels) for `dims`.
///
/// Checks run in a fixed order: rank, batch axis, channel count, then zero
/// sized axes. The first violated constraint is the one reported.
pub fn canonicalize(role: TensorRole, dims: &[usize]) -> PipelineResult<Hwc> {
    let rule = rule_for(role, dims.len()).ok_or_else(|| PipelineError::UnsupportedRank {
        role,
        rank: dims.len(),
        dims: dims.to_vec(),
    })?;

    if let Some(axis) = rule.batch {
        if dims[axis] != 1 {
            return Err(PipelineError::InvalidBatchSize {
                role,
                batch: dims[axis],
            });
        }
    }

    let resolve = |axis: Axis| match axis {
        Dim(i) => dims[i],
        Unit => 1,
    };
    let hwc = Hwc::new(
        resolve(rule.height),
        resolve(rule.width),
        resolve(rule.channels),
    );

    if rule.channel_policy == ImageLike && !matches!(hwc.channels, 1 | 3) {
        return Err(PipelineError::InvalidChannelCount {
            role,
            channels: hwc.channels,
        });
    }

    for axis in [rule.height, rule.width, rule.channels] {
        if let Dim(i) = axis {
            if dims[i] == 0 {
                return Err(PipelineError::ZeroDimension {
                    role,
                    axis: i,
                    dims: dims.to_vec(),
                });
            }
        }
    }

    Ok(hwc)
}
