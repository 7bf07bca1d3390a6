//! Exposure filters
//!
//! A flat list of patterns decides which entities leave the host:
//! `light.kitchen` exposes one entity, `light` or `light.*` a whole domain.
//! Matching is case-insensitive.

use embodied_core::domain_of;
use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExposureFilter {
    entities: HashSet<String>,
    domains: HashSet<String>,
}

impl ExposureFilter {
    /// Compile patterns; empty and whitespace-only patterns are dropped
    pub fn compile<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        for pattern in patterns {
            let normalized = pattern.as_ref().trim().to_lowercase();
            if normalized.is_empty() {
                continue;
            }
            if let Some(domain) = normalized.strip_suffix(".*") {
                filter.domains.insert(domain.to_string());
            } else if !normalized.contains('.') {
                filter.domains.insert(normalized);
            } else {
                filter.entities.insert(normalized);
            }
        }
        filter
    }

    pub fn allows(&self, entity_id: &str) -> bool {
        let entity_id = entity_id.to_lowercase();
        if self.entities.contains(&entity_id) {
            return true;
        }
        self.domains.contains(domain_of(&entity_id))
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.domains.is_empty()
    }

    pub fn entities(&self) -> &HashSet<String> {
        &self.entities
    }

    pub fn domains(&self) -> &HashSet<String> {
        &self.domains
    }
}
