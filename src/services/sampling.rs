use crate::core::state::{Mode, Stage};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Sampling parameters for one completion call. Providers map the fields
/// they understand and ignore the rest.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SamplingProfile {
    pub name: String,
    pub temperature: f32,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub reasoning_budget: Option<u32>,
}

impl SamplingProfile {
    /// Lower temperature, modest reasoning: stays close to the source.
    pub fn outline_default() -> Self {
        Self {
            name: "outline".to_string(),
            temperature: 0.85,
            top_p: None,
            top_k: None,
            reasoning_budget: Some(6000),
        }
    }

    /// Higher temperature with nucleus sampling for stylistic variance.
    pub fn segment_default() -> Self {
        Self {
            name: "segment".to_string(),
            temperature: 0.9,
            top_p: Some(0.95),
            top_k: None,
            reasoning_budget: Some(8000),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            bail!(
                "Sampling profile '{}': temperature {} out of range [0, 2]",
                self.name,
                self.temperature
            );
        }
        if let Some(top_p) = self.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                bail!("Sampling profile '{}': top_p {} out of range (0, 1]", self.name, top_p);
            }
        }
        if self.top_k == Some(0) {
            bail!("Sampling profile '{}': top_k must be at least 1", self.name);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SamplingProfiles {
    #[serde(default = "SamplingProfile::outline_default")]
    pub outline: SamplingProfile,
    #[serde(default = "SamplingProfile::segment_default")]
    pub segment: SamplingProfile,
    /// Used instead of `segment` for female-channel runs when set.
    #[serde(default)]
    pub female_segment: Option<SamplingProfile>,
}

impl Default for SamplingProfiles {
    fn default() -> Self {
        Self {
            outline: SamplingProfile::outline_default(),
            segment: SamplingProfile::segment_default(),
            female_segment: None,
        }
    }
}

impl SamplingProfiles {
    pub fn profile_for(&self, stage: Stage, mode: Mode) -> &SamplingProfile {
        match (stage, mode) {
            (Stage::Outline, _) => &self.outline,
            (Stage::Segment, Mode::Female) => self.female_segment.as_ref().unwrap_or(&self.segment),
            (Stage::Segment, Mode::Male) => &self.segment,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.outline.validate()?;
        self.segment.validate()?;
        if let Some(profile) = &self.female_segment {
            profile.validate()?;
        }
        Ok(())
    }
}
