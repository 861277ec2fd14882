//! Pure translation from [`GenerationRequest`] to each backend's wire schema.

use dreamdeck_contracts::{
    BackendCapabilities, BackendId, ErrorKey, GenerationError, GenerationRequest, Sampler, Seed,
};
use serde::Serialize;

use crate::backends::capabilities_for;
use crate::transport::MultipartField;

/// Largest seed Stability accepts; `0` asks it to pick one.
pub const STABILITY_MAX_SEED: u64 = 4_294_967_295;

#[derive(Debug, Clone, PartialEq)]
pub enum WireParams {
    Stability(StabilityParams),
    Automatic1111(Automatic1111Params),
    StableHorde(StableHordeParams),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextPrompt {
    pub text: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StabilityParams {
    pub text_prompts: Vec<TextPrompt>,
    pub init_image_mode: &'static str,
    /// Stability's image strength is the similarity to the init image.
    pub image_strength: f64,
    pub cfg_scale: f64,
    pub seed: u64,
    pub steps: u32,
    pub sampler: &'static str,
    pub samples: u32,
}

impl StabilityParams {
    /// Text fields of the multipart body; the init image part is added by the
    /// client.
    pub fn form_fields(&self) -> Vec<MultipartField> {
        let mut fields = Vec::new();
        let mut text = |name: String, value: String| {
            fields.push(MultipartField::Text { name, value });
        };
        for (idx, prompt) in self.text_prompts.iter().enumerate() {
            text(format!("text_prompts[{idx}][text]"), prompt.text.clone());
            text(format!("text_prompts[{idx}][weight]"), trim_float(prompt.weight));
        }
        text("init_image_mode".to_string(), self.init_image_mode.to_string());
        text("image_strength".to_string(), trim_float(self.image_strength));
        text("cfg_scale".to_string(), trim_float(self.cfg_scale));
        text("seed".to_string(), self.seed.to_string());
        text("steps".to_string(), self.steps.to_string());
        text("sampler".to_string(), self.sampler.to_string());
        text("samples".to_string(), self.samples.to_string());
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Automatic1111Params {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub seed: i64,
    pub denoising_strength: f64,
    pub cfg_scale: f64,
    pub steps: u32,
    pub sampler_name: &'static str,
    pub batch_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StableHordeGenerationParams {
    pub sampler_name: &'static str,
    pub cfg_scale: f64,
    pub denoising_strength: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub n: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StableHordeParams {
    /// Horde encodes the negative prompt after a `###` separator.
    pub prompt: String,
    pub params: StableHordeGenerationParams,
    pub source_processing: &'static str,
    pub nsfw: bool,
    pub censor_nsfw: bool,
    pub r2: bool,
}

/// Maps a validated request to the wire parameters of `backend`.
pub fn map(request: &GenerationRequest, backend: BackendId) -> Result<WireParams, GenerationError> {
    map_with_capabilities(request, &capabilities_for(backend))
}

pub fn map_with_capabilities(
    request: &GenerationRequest,
    capabilities: &BackendCapabilities,
) -> Result<WireParams, GenerationError> {
    let backend = capabilities.backend;
    let sampler = sampler_label(backend, request.sampler).ok_or_else(|| {
        GenerationError::new(
            format!(
                "The sampler '{}' is not available on {}.",
                request.sampler,
                backend.display_name()
            ),
            ErrorKey::Sampler,
        )
    })?;
    let negative_prompt = if capabilities.supports_negative_prompts {
        request.trimmed_negative_prompt().map(str::to_string)
    } else {
        None
    };
    let prompt = request.prompt.trim().to_string();

    let params = match backend {
        BackendId::Stability => {
            let seed = match request.seed {
                Seed::Random => 0,
                Seed::Fixed(value) if value <= STABILITY_MAX_SEED => value,
                Seed::Fixed(_) => return Err(seed_out_of_range(backend, STABILITY_MAX_SEED)),
            };
            let mut text_prompts = vec![TextPrompt {
                text: prompt,
                weight: 1.0,
            }];
            if let Some(negative) = negative_prompt {
                text_prompts.push(TextPrompt {
                    text: negative,
                    weight: -1.0,
                });
            }
            WireParams::Stability(StabilityParams {
                text_prompts,
                init_image_mode: "IMAGE_STRENGTH",
                image_strength: round2(request.similarity),
                cfg_scale: request.guidance_scale,
                seed,
                steps: request.steps,
                sampler,
                samples: 1,
            })
        }
        BackendId::Automatic1111 => {
            let seed = match request.seed {
                Seed::Random => -1,
                Seed::Fixed(value) => i64::try_from(value)
                    .map_err(|_| seed_out_of_range(backend, i64::MAX as u64))?,
            };
            WireParams::Automatic1111(Automatic1111Params {
                prompt,
                negative_prompt,
                width: request.width,
                height: request.height,
                seed,
                denoising_strength: strength_from_similarity(request.similarity),
                cfg_scale: request.guidance_scale,
                steps: request.steps,
                sampler_name: sampler,
                batch_size: 1,
            })
        }
        BackendId::StableHorde => {
            if request.width % 64 != 0 || request.height % 64 != 0 {
                return Err(GenerationError::new(
                    format!(
                        "Stable Horde needs width and height in multiples of 64; got {}x{}.",
                        request.width, request.height
                    ),
                    ErrorKey::InvalidDimensions,
                ));
            }
            let prompt = match negative_prompt {
                Some(negative) => format!("{prompt} ### {negative}"),
                None => prompt,
            };
            WireParams::StableHorde(StableHordeParams {
                prompt,
                params: StableHordeGenerationParams {
                    sampler_name: sampler,
                    cfg_scale: request.guidance_scale,
                    denoising_strength: strength_from_similarity(request.similarity),
                    seed: match request.seed {
                        Seed::Random => None,
                        Seed::Fixed(value) => Some(value.to_string()),
                    },
                    width: request.width,
                    height: request.height,
                    steps: request.steps,
                    n: 1,
                },
                source_processing: "img2img",
                nsfw: false,
                censor_nsfw: true,
                r2: true,
            })
        }
    };
    Ok(params)
}

/// Denoising strength for a similarity: `round(1 - similarity, 2)`, kept in
/// [0, 1] even for slightly out-of-range floats.
pub fn strength_from_similarity(similarity: f64) -> f64 {
    round2(1.0 - similarity).clamp(0.0, 1.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// The backend's native label for a canonical sampler, if it has one.
pub fn sampler_label(backend: BackendId, sampler: Sampler) -> Option<&'static str> {
    let label = match backend {
        BackendId::Stability => match sampler {
            Sampler::Euler => "K_EULER",
            Sampler::EulerAncestral => "K_EULER_ANCESTRAL",
            Sampler::Heun => "K_HEUN",
            Sampler::Dpm2 => "K_DPM_2",
            Sampler::Dpm2Ancestral => "K_DPM_2_ANCESTRAL",
            Sampler::Lms => "K_LMS",
            Sampler::DpmPp2sAncestral => "K_DPMPP_2S_ANCESTRAL",
            Sampler::DpmPp2m => "K_DPMPP_2M",
            Sampler::Ddim => "DDIM",
            Sampler::DpmPpSde | Sampler::Plms => return None,
        },
        BackendId::Automatic1111 => match sampler {
            Sampler::Euler => "Euler",
            Sampler::EulerAncestral => "Euler a",
            Sampler::Heun => "Heun",
            Sampler::Dpm2 => "DPM2",
            Sampler::Dpm2Ancestral => "DPM2 a",
            Sampler::Lms => "LMS",
            Sampler::DpmPp2sAncestral => "DPM++ 2S a",
            Sampler::DpmPp2m => "DPM++ 2M",
            Sampler::DpmPpSde => "DPM++ SDE",
            Sampler::Ddim => "DDIM",
            Sampler::Plms => "PLMS",
        },
        BackendId::StableHorde => match sampler {
            Sampler::Euler => "k_euler",
            Sampler::EulerAncestral => "k_euler_a",
            Sampler::Heun => "k_heun",
            Sampler::Dpm2 => "k_dpm_2",
            Sampler::Dpm2Ancestral => "k_dpm_2_a",
            Sampler::Lms => "k_lms",
            Sampler::DpmPp2sAncestral => "k_dpmpp_2s_a",
            Sampler::DpmPp2m => "k_dpmpp_2m",
            Sampler::DpmPpSde => "k_dpmpp_sde",
            Sampler::Ddim => "DDIM",
            Sampler::Plms => return None,
        },
    };
    Some(label)
}

fn seed_out_of_range(backend: BackendId, max: u64) -> GenerationError {
    GenerationError::new(
        format!(
            "{} accepts seeds between 0 and {max}.",
            backend.display_name()
        ),
        ErrorKey::Seed,
    )
}

fn trim_float(value: f64) -> String {
    let text = format!("{value:.4}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use dreamdeck_contracts::{BackendId, ErrorKey, GenerationRequest, Sampler, Seed};

    use super::{
        map, map_with_capabilities, sampler_label, strength_from_similarity, WireParams,
    };
    use crate::backends::capabilities_for;

    fn castle() -> GenerationRequest {
        let mut request = GenerationRequest::new("a castle", "castle.png");
        request.width = 512;
        request.height = 512;
        request.similarity = 0.15;
        request.seed = Seed::Fixed(42);
        request.sampler = Sampler::Lms;
        request.steps = 25;
        request
    }

    #[test]
    fn castle_scenario_maps_to_automatic1111_wire_params() {
        let WireParams::Automatic1111(params) = map(&castle(), BackendId::Automatic1111).unwrap()
        else {
            panic!("expected automatic1111 params");
        };
        assert_eq!(params.denoising_strength, 0.85);
        assert_eq!(params.seed, 42);
        assert_eq!(params.sampler_name, "LMS");
        assert_eq!(params.steps, 25);
        assert_eq!(params.negative_prompt, None);

        let json = serde_json::to_value(&params).unwrap();
        assert!(json.get("negative_prompt").is_none());
        assert_eq!(json["sampler_name"], "LMS");
    }

    #[test]
    fn stability_keeps_similarity_as_image_strength() {
        let WireParams::Stability(params) = map(&castle(), BackendId::Stability).unwrap() else {
            panic!("expected stability params");
        };
        assert_eq!(params.image_strength, 0.15);
        assert_eq!(params.sampler, "K_LMS");
        assert_eq!(params.seed, 42);

        let fields = params.form_fields();
        let find = |name: &str| {
            fields.iter().find_map(|field| match field {
                crate::transport::MultipartField::Text { name: key, value } if key == name => {
                    Some(value.clone())
                }
                _ => None,
            })
        };
        assert_eq!(find("image_strength").as_deref(), Some("0.15"));
        assert_eq!(find("text_prompts[0][text]").as_deref(), Some("a castle"));
        assert_eq!(find("text_prompts[0][weight]").as_deref(), Some("1"));
        assert_eq!(find("text_prompts[1][text]"), None);
    }

    #[test]
    fn strength_stays_in_unit_range() {
        for step in 0..=1000 {
            let similarity = step as f64 / 1000.0;
            let strength = strength_from_similarity(similarity);
            assert!((0.0..=1.0).contains(&strength), "{similarity} -> {strength}");
            assert!((strength - (1.0 - similarity)).abs() <= 0.005 + 1e-9);
        }
        assert_eq!(strength_from_similarity(0.0), 1.0);
        assert_eq!(strength_from_similarity(1.0), 0.0);
    }

    #[test]
    fn unmapped_sampler_fails_with_sampler_key() {
        let mut request = castle();
        request.sampler = Sampler::Plms;
        let err = map(&request, BackendId::Stability).expect_err("plms on stability");
        assert!(err.is(ErrorKey::Sampler));
        assert_eq!(sampler_label(BackendId::StableHorde, Sampler::Plms), None);
        assert_eq!(sampler_label(BackendId::Automatic1111, Sampler::Plms), Some("PLMS"));
    }

    #[test]
    fn negative_prompt_is_omitted_when_backend_lacks_support() {
        let mut request = castle();
        request.negative_prompt = Some("fog".to_string());

        let WireParams::Automatic1111(params) = map(&request, BackendId::Automatic1111).unwrap()
        else {
            panic!("expected automatic1111 params");
        };
        assert_eq!(params.negative_prompt.as_deref(), Some("fog"));

        let mut caps = capabilities_for(BackendId::Automatic1111);
        caps.supports_negative_prompts = false;
        let WireParams::Automatic1111(params) = map_with_capabilities(&request, &caps).unwrap()
        else {
            panic!("expected automatic1111 params");
        };
        assert_eq!(params.negative_prompt, None);
        let json = serde_json::to_value(&params).unwrap();
        assert!(json.get("negative_prompt").is_none());
    }

    #[test]
    fn random_seed_uses_each_backend_convention() {
        let mut request = castle();
        request.seed = Seed::Random;
        match map(&request, BackendId::Automatic1111).unwrap() {
            WireParams::Automatic1111(params) => assert_eq!(params.seed, -1),
            other => panic!("unexpected {other:?}"),
        }
        match map(&request, BackendId::Stability).unwrap() {
            WireParams::Stability(params) => assert_eq!(params.seed, 0),
            other => panic!("unexpected {other:?}"),
        }
        match map(&request, BackendId::StableHorde).unwrap() {
            WireParams::StableHorde(params) => {
                assert_eq!(params.params.seed, None);
                let json = serde_json::to_value(&params).unwrap();
                assert!(json["params"].get("seed").is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn out_of_range_seed_fails_with_seed_key() {
        let mut request = castle();
        request.seed = Seed::Fixed(u64::MAX);
        let err = map(&request, BackendId::Stability).expect_err("seed too large");
        assert!(err.is(ErrorKey::Seed));
    }

    #[test]
    fn horde_joins_negative_prompt_and_requires_multiples_of_64() {
        let mut request = castle();
        request.negative_prompt = Some("fog".to_string());
        match map(&request, BackendId::StableHorde).unwrap() {
            WireParams::StableHorde(params) => {
                assert_eq!(params.prompt, "a castle ### fog");
                assert_eq!(params.params.sampler_name, "k_lms");
                assert_eq!(params.params.denoising_strength, 0.85);
                assert_eq!(params.params.seed.as_deref(), Some("42"));
            }
            other => panic!("unexpected {other:?}"),
        }

        request.width = 500;
        let err = map(&request, BackendId::StableHorde).expect_err("not a multiple of 64");
        assert!(err.is(ErrorKey::InvalidDimensions));
    }
}
