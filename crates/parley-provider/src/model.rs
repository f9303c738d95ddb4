use parley_config::BackendProfile;
use parley_util::token;
use serde::{Deserialize, Serialize};

use crate::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Short,
    Long,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChoice {
    pub tier: ModelTier,
    pub model: String,
}

/// Context size in the unit `threshold` is expressed in: estimated tokens.
pub fn context_size(chat_context: &str, prompt: &str) -> usize {
    token::estimate_all(&[chat_context, prompt])
}

/// Picks `long_model` only when `context_size` exceeds the threshold.
/// Fails only when the chosen tier has no model configured.
pub fn select(profile: &BackendProfile, context_size: usize) -> Result<ModelChoice, ProviderError> {
    let (tier, model) = if context_size as u64 > profile.threshold {
        (ModelTier::Long, &profile.long_model)
    } else {
        (ModelTier::Short, &profile.short_model)
    };
    let model = model.trim();
    if model.is_empty() {
        return Err(ProviderError::InvalidRequest(format!(
            "backend {} has no {:?} model configured",
            profile.name, tier
        )));
    }
    Ok(ModelChoice {
        tier,
        model: model.to_string(),
    })
}
