//! Hot-reloadable model -> price table registry.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::cost::{CostBreakdown, ToolInvocations};
use super::pricing::{CompletionPriceInfo, PricingError};
use crate::types::TokenUsage;

/// Price tables keyed by model id. Every (re)load validates every entry; a
/// table that fails validation rejects the whole load and the previous
/// snapshot stays in place.
pub struct PriceBook {
    tables: ArcSwap<HashMap<String, Arc<CompletionPriceInfo>>>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self {
            tables: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Replace the whole book.
    pub fn load(&self, tables: HashMap<String, CompletionPriceInfo>) -> Result<(), PricingError> {
        let mut validated = HashMap::with_capacity(tables.len());
        for (model, info) in tables {
            info.validate()
                .map_err(|e| PricingError::Invalid(format!("model '{}': {}", model, e)))?;
            validated.insert(model, Arc::new(info));
        }
        tracing::info!(models = validated.len(), "price book reloaded");
        self.tables.store(Arc::new(validated));
        Ok(())
    }

    /// Load a JSON object of `{ "<model>": <price table>, ... }`.
    pub fn load_json(&self, json: &str) -> Result<(), PricingError> {
        let tables: HashMap<String, CompletionPriceInfo> = serde_json::from_str(json)
            .map_err(|e| PricingError::Invalid(format!("malformed JSON: {}", e)))?;
        self.load(tables)
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let raw = std::fs::read_to_string(path)?;
        self.load_json(&raw)?;
        Ok(())
    }

    /// Add or replace a single model without touching the others.
    pub fn upsert(&self, model: impl Into<String>, info: CompletionPriceInfo) -> Result<(), PricingError> {
        info.validate()?;
        let model = model.into();
        let current = self.tables.load();
        let mut updated: HashMap<String, Arc<CompletionPriceInfo>> = current
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        updated.insert(model, Arc::new(info));
        self.tables.store(Arc::new(updated));
        Ok(())
    }

    pub fn get(&self, model: &str) -> Option<Arc<CompletionPriceInfo>> {
        self.tables.load().get(model).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cost(&self, model: &str, usage: &TokenUsage, tools: &ToolInvocations) -> Result<CostBreakdown, PricingError> {
        let info = self
            .get(model)
            .ok_or_else(|| PricingError::UnknownModel(model.to_string()))?;
        info.cost(usage, tools)
    }
}

impl Default for PriceBook {
    fn default() -> Self {
        Self::new()
    }
}
