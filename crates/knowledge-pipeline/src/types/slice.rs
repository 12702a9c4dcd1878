//! Chunking configuration carried on file records and slice requests

use serde::{Deserialize, Serialize};

/// Separator used when a custom config arrives without one
pub const DEFAULT_SEPARATOR: &str = "\n";

/// Whether the splitter uses service defaults or caller-supplied settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SliceType {
    #[default]
    Default,
    Custom,
}

/// Requested chunking parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SliceConfig {
    #[serde(rename = "type", default)]
    pub slice_type: SliceType,
    #[serde(default)]
    pub separators: Vec<String>,
    /// Inclusive `[min, max]` chunk length in characters
    pub length_range: (usize, usize),
}

impl SliceConfig {
    pub fn custom(separators: Vec<String>, min: usize, max: usize) -> Self {
        Self {
            slice_type: SliceType::Custom,
            separators,
            length_range: (min, max),
        }
    }

    pub fn min_len(&self) -> usize {
        self.length_range.0
    }

    pub fn max_len(&self) -> usize {
        self.length_range.1
    }

    /// Fill in defaults: `Default` configs take the configured separators and range,
    /// custom configs only get a separator when none was supplied.
    pub fn resolved(&self, defaults: &SliceConfig) -> SliceConfig {
        match self.slice_type {
            SliceType::Default => SliceConfig {
                slice_type: SliceType::Default,
                separators: defaults.separators.clone(),
                length_range: defaults.length_range,
            },
            SliceType::Custom => {
                let separators: Vec<String> = self
                    .separators
                    .iter()
                    .filter(|s| !s.is_empty())
                    .cloned()
                    .collect();
                SliceConfig {
                    slice_type: SliceType::Custom,
                    separators: if separators.is_empty() {
                        vec![DEFAULT_SEPARATOR.to_string()]
                    } else {
                        separators
                    },
                    length_range: self.length_range,
                }
            }
        }
    }
}
