use serde::{Deserialize, Serialize};

/// Values masked units are replaced with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineSpec {
    Constant { value: f32 },
    ChannelMean,
    Blur { radius: usize },
    Uniform { low: f32, high: f32 },
}

impl Default for BaselineSpec {
    fn default() -> Self {
        Self::Constant { value: 0.0 }
    }
}

/// How to split an image into segments for segment level masking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmenterSpec {
    Grid { rows: usize, cols: usize },
}

/// A masker configuration.
///
/// `granularity` is kept as text so an unsupported value is reported by the
/// masker itself as a configuration error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskerSpec {
    pub granularity: String,
    #[serde(default)]
    pub baseline: BaselineSpec,
    #[serde(default)]
    pub segmenter: Option<SegmenterSpec>,
}
