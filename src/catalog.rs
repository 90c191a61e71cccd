//! Static catalog of provider models.
//!
//! Concurrency ceilings and context lengths mirror what the upstream
//! enforces per account; prices are per million tokens and feed the
//! cost-aware routing strategies.

use std::collections::HashMap;

/// Immutable description of one provider model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub id: &'static str,
    /// Upstream per-account concurrency ceiling.
    pub max_concurrency: usize,
    /// Context window in tokens, when published.
    pub context_length: Option<usize>,
    pub price_in: f64,
    pub price_out: f64,
}

impl ModelDescriptor {
    /// Blended cost used for tie-breaking and pool scoring.
    pub fn effective_cost(&self) -> f64 {
        self.price_in + self.price_out
    }
}

/// Lookup table over the known provider models.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: HashMap<&'static str, ModelDescriptor>,
}

const BUILTIN: &[ModelDescriptor] = &[
    ModelDescriptor {
        id: "glm-5",
        max_concurrency: 10,
        context_length: Some(200_000),
        price_in: 1.0,
        price_out: 3.2,
    },
    ModelDescriptor {
        id: "glm-4.7",
        max_concurrency: 30,
        context_length: Some(200_000),
        price_in: 0.6,
        price_out: 2.2,
    },
    ModelDescriptor {
        id: "glm-4.7-flash",
        max_concurrency: 50,
        context_length: Some(200_000),
        price_in: 0.1,
        price_out: 0.3,
    },
    ModelDescriptor {
        id: "glm-4.6",
        max_concurrency: 30,
        context_length: Some(128_000),
        price_in: 0.6,
        price_out: 2.2,
    },
    ModelDescriptor {
        id: "glm-4.5-air",
        max_concurrency: 50,
        context_length: Some(128_000),
        price_in: 0.2,
        price_out: 1.1,
    },
];

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelCatalog {
    /// The built-in provider catalog.
    pub fn builtin() -> Self {
        Self { models: BUILTIN.iter().map(|m| (m.id, m.clone())).collect() }
    }

    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.models.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
