use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The closed set of remote services a request can be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendId {
    Stability,
    Automatic1111,
    StableHorde,
}

impl BackendId {
    pub const ALL: [BackendId; 3] = [
        BackendId::Stability,
        BackendId::Automatic1111,
        BackendId::StableHorde,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendId::Stability => "stability",
            BackendId::Automatic1111 => "automatic1111",
            BackendId::StableHorde => "stablehorde",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            BackendId::Stability => "Stability AI",
            BackendId::Automatic1111 => "Automatic1111",
            BackendId::StableHorde => "Stable Horde",
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendId {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "stability" | "dreamstudio" => Ok(BackendId::Stability),
            "automatic1111" | "a1111" => Ok(BackendId::Automatic1111),
            "stablehorde" | "stable_horde" | "horde" => Ok(BackendId::StableHorde),
            _ => Err(format!("Unknown backend '{}'.", raw.trim())),
        }
    }
}

/// Canonical sampler identifiers. Each backend translates these to its own
/// labels in the parameter mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sampler {
    #[serde(rename = "k_euler")]
    Euler,
    #[serde(rename = "k_euler_ancestral")]
    EulerAncestral,
    #[serde(rename = "k_heun")]
    Heun,
    #[serde(rename = "k_dpm_2")]
    Dpm2,
    #[serde(rename = "k_dpm_2_ancestral")]
    Dpm2Ancestral,
    #[serde(rename = "k_lms")]
    Lms,
    #[serde(rename = "k_dpmpp_2s_ancestral")]
    DpmPp2sAncestral,
    #[serde(rename = "k_dpmpp_2m")]
    DpmPp2m,
    #[serde(rename = "k_dpmpp_sde")]
    DpmPpSde,
    #[serde(rename = "ddim")]
    Ddim,
    #[serde(rename = "plms")]
    Plms,
}

impl Sampler {
    pub const ALL: [Sampler; 11] = [
        Sampler::Euler,
        Sampler::EulerAncestral,
        Sampler::Heun,
        Sampler::Dpm2,
        Sampler::Dpm2Ancestral,
        Sampler::Lms,
        Sampler::DpmPp2sAncestral,
        Sampler::DpmPp2m,
        Sampler::DpmPpSde,
        Sampler::Ddim,
        Sampler::Plms,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Sampler::Euler => "k_euler",
            Sampler::EulerAncestral => "k_euler_ancestral",
            Sampler::Heun => "k_heun",
            Sampler::Dpm2 => "k_dpm_2",
            Sampler::Dpm2Ancestral => "k_dpm_2_ancestral",
            Sampler::Lms => "k_lms",
            Sampler::DpmPp2sAncestral => "k_dpmpp_2s_ancestral",
            Sampler::DpmPp2m => "k_dpmpp_2m",
            Sampler::DpmPpSde => "k_dpmpp_sde",
            Sampler::Ddim => "ddim",
            Sampler::Plms => "plms",
        }
    }
}

impl fmt::Display for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sampler {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Sampler::ALL
            .into_iter()
            .find(|sampler| sampler.as_str() == normalized)
            .ok_or_else(|| format!("Unknown sampler '{}'.", raw.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Seed {
    #[default]
    Random,
    Fixed(u64),
}

impl FromStr for Seed {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("random") {
            return Ok(Seed::Random);
        }
        trimmed
            .parse::<u64>()
            .map(Seed::Fixed)
            .map_err(|_| {
                format!("Seed must be 'random' or a non-negative integer, got '{trimmed}'.")
            })
    }
}

/// Backend-agnostic description of one image-to-image transformation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub seed: Seed,
    /// How closely the output should resemble the source, in [0, 1].
    pub similarity: f64,
    pub guidance_scale: f64,
    pub steps: u32,
    pub sampler: Sampler,
    pub source_image: PathBuf,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, source_image: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: 512,
            height: 512,
            seed: Seed::Random,
            similarity: 0.5,
            guidance_scale: 7.0,
            steps: 30,
            sampler: Sampler::Lms,
            source_image: source_image.into(),
        }
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Negative prompt with surrounding whitespace removed, `None` when blank.
    pub fn trimmed_negative_prompt(&self) -> Option<&str> {
        self.negative_prompt
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpscaleRequest {
    pub source_image: PathBuf,
    pub factor: f64,
    pub upscaler: String,
}
