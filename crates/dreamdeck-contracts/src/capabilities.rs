use crate::errors::{ErrorKey, GenerationError};
use crate::request::{BackendId, GenerationRequest, Sampler};

/// Static facts about a backend. Built once per client and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCapabilities {
    pub backend: BackendId,
    pub default_sampler: Sampler,
    pub samplers: Vec<Sampler>,
    /// Minimum total pixel count (width * height).
    pub min_image_size: u64,
    /// Maximum total pixel count (width * height).
    pub max_image_size: u64,
    pub max_steps: u32,
    pub supports_negative_prompts: bool,
    pub supports_model_choice: bool,
    pub supports_upscaling: bool,
    pub supports_inpainting: bool,
    pub requires_api_key: bool,
    pub output_extension: &'static str,
}

impl BackendCapabilities {
    pub fn supports_sampler(&self, sampler: Sampler) -> bool {
        self.samplers.contains(&sampler)
    }

    /// Checks the request shape. Runs before any network I/O.
    pub fn validate(&self, request: &GenerationRequest) -> Result<(), GenerationError> {
        if request.prompt.trim().is_empty() {
            return Err(GenerationError::new(
                "Please enter a prompt describing the image you want.",
                ErrorKey::Prompt,
            ));
        }
        if request.width == 0 || request.height == 0 {
            return Err(GenerationError::new(
                "Image width and height must both be greater than zero.",
                ErrorKey::InvalidDimensions,
            ));
        }
        let pixels = request.pixel_count();
        if pixels < self.min_image_size || pixels > self.max_image_size {
            return Err(GenerationError::new(
                format!(
                    "{} supports images between {} and {} total pixels; {}x{} is {} pixels.",
                    self.backend.display_name(),
                    self.min_image_size,
                    self.max_image_size,
                    request.width,
                    request.height,
                    pixels
                ),
                ErrorKey::InvalidDimensions,
            ));
        }
        if request.steps == 0 || request.steps > self.max_steps {
            return Err(GenerationError::new(
                format!(
                    "Steps must be between 1 and {} for {}.",
                    self.max_steps,
                    self.backend.display_name()
                ),
                ErrorKey::Steps,
            ));
        }
        if !request.similarity.is_finite() || !(0.0..=1.0).contains(&request.similarity) {
            return Err(GenerationError::new(
                "Image similarity must be between 0 and 1.",
                ErrorKey::PromptStrength,
            ));
        }
        if !self.supports_sampler(request.sampler) {
            return Err(GenerationError::new(
                format!(
                    "The sampler '{}' is not available on {}.",
                    request.sampler,
                    self.backend.display_name()
                ),
                ErrorKey::Sampler,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::BackendCapabilities;
    use crate::errors::ErrorKey;
    use crate::request::{BackendId, GenerationRequest, Sampler};

    fn caps() -> BackendCapabilities {
        BackendCapabilities {
            backend: BackendId::Stability,
            default_sampler: Sampler::Lms,
            samplers: vec![Sampler::Lms, Sampler::Euler],
            min_image_size: 256 * 256,
            max_image_size: 1024 * 1024,
            max_steps: 50,
            supports_negative_prompts: true,
            supports_model_choice: true,
            supports_upscaling: false,
            supports_inpainting: false,
            requires_api_key: true,
            output_extension: "png",
        }
    }

    #[test]
    fn accepts_request_inside_bounds() {
        let request = GenerationRequest::new("a castle", "in.png");
        assert_eq!(caps().validate(&request), Ok(()));
    }

    #[test]
    fn rejects_oversized_and_undersized_images() {
        let mut request = GenerationRequest::new("a castle", "in.png");
        request.width = 2048;
        request.height = 1024;
        let err = caps().validate(&request).expect_err("too large");
        assert!(err.is(ErrorKey::InvalidDimensions));

        request.width = 64;
        request.height = 64;
        let err = caps().validate(&request).expect_err("too small");
        assert!(err.is(ErrorKey::InvalidDimensions));
    }

    #[test]
    fn rejects_blank_prompt_unknown_sampler_and_bad_steps() {
        let mut request = GenerationRequest::new("  ", "in.png");
        let err = caps().validate(&request).expect_err("blank prompt");
        assert!(err.is(ErrorKey::Prompt));

        request.prompt = "a castle".to_string();
        request.sampler = Sampler::Plms;
        let err = caps().validate(&request).expect_err("unsupported sampler");
        assert!(err.is(ErrorKey::Sampler));

        request.sampler = Sampler::Lms;
        request.steps = 0;
        let err = caps().validate(&request).expect_err("zero steps");
        assert!(err.is(ErrorKey::Steps));
    }

    #[test]
    fn rejects_similarity_outside_unit_range() {
        let mut request = GenerationRequest::new("a castle", "in.png");
        request.similarity = 1.5;
        let err = caps().validate(&request).expect_err("similarity");
        assert!(err.is(ErrorKey::PromptStrength));
    }
}
