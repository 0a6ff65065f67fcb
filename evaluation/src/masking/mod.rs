//! Replacing parts of images with baseline values.

mod baseline;
mod masker;

use std::{fmt, str::FromStr};

pub use baseline::Baseline;
pub use masker::Masker;

use crate::{EvalErr, Result};

/// The unit at which a masker operates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    /// One unit per spatial location, all channels masked together.
    Pixel,
    /// One unit per channel.
    Channel,
    /// One unit per segment label.
    Segment,
}

impl FromStr for Granularity {
    type Err = EvalErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pixel" => Ok(Self::Pixel),
            "channel" => Ok(Self::Channel),
            "segment" => Ok(Self::Segment),
            other => Err(EvalErr::config(format!("unsupported masking granularity {other:?}"))),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Granularity::Pixel => "pixel",
            Granularity::Channel => "channel",
            Granularity::Segment => "segment",
        };
        f.write_str(s)
    }
}

/// The order in which units are ranked by their importance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankOrder {
    MostRelevantFirst,
    LeastRelevantFirst,
}
