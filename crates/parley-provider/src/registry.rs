use parley_config::{BackendProfile, Config, SYDNEY_BACKEND};
use std::collections::HashMap;

use crate::{BackendKind, ProviderError};

/// Result of resolving a workspace's backend name.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedBackend {
    OpenAiCompatible(BackendProfile),
    Sydney,
}

impl ResolvedBackend {
    pub fn kind(&self) -> BackendKind {
        match self {
            ResolvedBackend::OpenAiCompatible(_) => BackendKind::OpenAiCompatible,
            ResolvedBackend::Sydney => BackendKind::Sydney,
        }
    }
}

/// Configured backends by exact name. Read-only once built; share it behind
/// an `Arc` across concurrent asks.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    profiles: Vec<BackendProfile>,
    index: HashMap<String, usize>,
}

impl BackendRegistry {
    /// Duplicate names are reported by config validation; the first wins here.
    pub fn new(profiles: Vec<BackendProfile>) -> Self {
        let mut index = HashMap::with_capacity(profiles.len());
        for (position, profile) in profiles.iter().enumerate() {
            index.entry(profile.name.clone()).or_insert(position);
        }
        Self { profiles, index }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.open_ai_backends.clone())
    }

    pub fn resolve(&self, name: &str) -> Result<&BackendProfile, ProviderError> {
        self.index
            .get(name)
            .map(|&position| &self.profiles[position])
            .ok_or_else(|| ProviderError::BackendNotFound(name.to_string()))
    }

    /// Like `resolve`, but also accepts the Sydney marker.
    pub fn resolve_backend(&self, name: &str) -> Result<ResolvedBackend, ProviderError> {
        if is_sydney(name) {
            return Ok(ResolvedBackend::Sydney);
        }
        self.resolve(name)
            .map(|profile| ResolvedBackend::OpenAiCompatible(profile.clone()))
    }

    /// Profiles in configuration order.
    pub fn list(&self) -> &[BackendProfile] {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

pub fn is_sydney(name: &str) -> bool {
    name == SYDNEY_BACKEND
}
