//! Smart router for tier-aware model selection.
//!
//! Routes each valet stage to the model prescribed for its tier, adjusting
//! for provider preference, capability requirements, and budget, and hands
//! the orchestrator a pure tier-escalation mapping for adaptive retries.

use serde::{Deserialize, Serialize};

use super::types::{ModelSpec, ModelTier, Provider};

/// Context for routing decisions.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    /// Current recursion depth
    pub depth: u32,
    /// Maximum allowed depth
    pub max_depth: u32,
    /// Remaining budget in USD
    pub remaining_budget: Option<f64>,
    /// Preferred provider (if any)
    pub preferred_provider: Option<Provider>,
    /// Require caching support
    pub require_caching: bool,
    /// Require vision support
    pub require_vision: bool,
    /// Require tool use support
    pub require_tools: bool,
}

impl RoutingContext {
    pub fn new() -> Self {
        Self {
            depth: 0,
            max_depth: 5,
            remaining_budget: None,
            preferred_provider: None,
            require_caching: false,
            require_vision: false,
            require_tools: false,
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_budget(mut self, budget: f64) -> Self {
        self.remaining_budget = Some(budget);
        self
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.preferred_provider = Some(provider);
        self
    }

    pub fn requiring_caching(mut self) -> Self {
        self.require_caching = true;
        self
    }

    pub fn requiring_vision(mut self) -> Self {
        self.require_vision = true;
        self
    }

    pub fn requiring_tools(mut self) -> Self {
        self.require_tools = true;
        self
    }
}

/// Routing decision output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Selected model
    pub model: ModelSpec,
    /// Recommended tier
    pub tier: ModelTier,
    /// Reasoning for selection
    pub reason: String,
    /// Estimated cost (if calculable)
    pub estimated_cost: Option<f64>,
}

/// Smart router for model selection.
pub struct SmartRouter {
    /// Available models
    models: Vec<ModelSpec>,
    /// Default model for each tier
    tier_defaults: TierDefaults,
}

/// Default models for each tier.
#[derive(Debug, Clone)]
pub struct TierDefaults {
    pub strong: ModelSpec,
    pub balanced: ModelSpec,
    pub fast: ModelSpec,
}

impl Default for TierDefaults {
    fn default() -> Self {
        Self {
            strong: ModelSpec::claude_opus(),
            balanced: ModelSpec::claude_sonnet(),
            fast: ModelSpec::claude_haiku(),
        }
    }
}

impl SmartRouter {
    /// Create a new router with default Anthropic models.
    pub fn new() -> Self {
        Self {
            models: vec![
                ModelSpec::claude_opus(),
                ModelSpec::claude_sonnet(),
                ModelSpec::claude_haiku(),
                ModelSpec::gpt4o(),
                ModelSpec::gpt4o_mini(),
            ],
            tier_defaults: TierDefaults::default(),
        }
    }

    /// Create with custom models.
    pub fn with_models(models: Vec<ModelSpec>) -> Self {
        // Find best model for each tier
        let strong = models
            .iter()
            .filter(|m| m.tier == ModelTier::Strong)
            .min_by(|a, b| a.input_cost_per_m.partial_cmp(&b.input_cost_per_m).unwrap())
            .cloned()
            .unwrap_or_else(ModelSpec::claude_opus);

        let balanced = models
            .iter()
            .filter(|m| m.tier == ModelTier::Balanced)
            .min_by(|a, b| a.input_cost_per_m.partial_cmp(&b.input_cost_per_m).unwrap())
            .cloned()
            .unwrap_or_else(ModelSpec::claude_sonnet);

        let fast = models
            .iter()
            .filter(|m| m.tier == ModelTier::Fast)
            .min_by(|a, b| a.input_cost_per_m.partial_cmp(&b.input_cost_per_m).unwrap())
            .cloned()
            .unwrap_or_else(ModelSpec::claude_haiku);

        Self {
            models,
            tier_defaults: TierDefaults {
                strong,
                balanced,
                fast,
            },
        }
    }

    /// Set custom tier defaults.
    pub fn with_tier_defaults(mut self, defaults: TierDefaults) -> Self {
        self.tier_defaults = defaults;
        self
    }

    /// Route directly to a fixed tier.
    ///
    /// Used by the orchestrator to route each valet stage to its prescribed
    /// tier (V1/V2/V3 fast, V4 strong) and by adaptive escalation to re-run
    /// a stage one tier up.
    pub fn route_for_tier(&self, tier: ModelTier, context: &RoutingContext) -> RoutingDecision {
        let model = self.select_model(tier, context);
        RoutingDecision {
            model,
            tier,
            reason: format!("explicit tier request: {:?}", tier).to_lowercase(),
            estimated_cost: None,
        }
    }

    /// The next tier up from `tier`, or `None` if already at the top.
    pub fn escalate(tier: ModelTier) -> Option<ModelTier> {
        match tier {
            ModelTier::Fast => Some(ModelTier::Balanced),
            ModelTier::Balanced => Some(ModelTier::Strong),
            ModelTier::Strong => None,
        }
    }

    /// Select the best model for the tier and constraints.
    fn select_model(&self, tier: ModelTier, context: &RoutingContext) -> ModelSpec {
        // Filter models by requirements
        let candidates: Vec<_> = self
            .models
            .iter()
            .filter(|m| {
                // Check tier
                m.tier <= tier
                    // Check provider preference
                    && context.preferred_provider.map_or(true, |p| m.provider == p)
                    // Check capability requirements
                    && (!context.require_caching || m.supports_caching)
                    && (!context.require_vision || m.supports_vision)
                    && (!context.require_tools || m.supports_tools)
                    // Check budget (rough estimate for 10k tokens)
                    && context.remaining_budget.map_or(true, |b| {
                        m.calculate_cost(10_000, 1_000) < b
                    })
            })
            .collect();

        // Pick the best candidate (prefer exact tier match, then cheapest)
        candidates
            .iter()
            .filter(|m| m.tier == tier)
            .min_by(|a, b| a.input_cost_per_m.partial_cmp(&b.input_cost_per_m).unwrap())
            .cloned()
            .cloned()
            .or_else(|| {
                candidates
                    .iter()
                    .min_by(|a, b| a.input_cost_per_m.partial_cmp(&b.input_cost_per_m).unwrap())
                    .cloned()
                    .cloned()
            })
            .unwrap_or_else(|| self.tier_default(tier))
    }

    /// Get the default model for a tier.
    fn tier_default(&self, tier: ModelTier) -> ModelSpec {
        match tier {
            ModelTier::Strong => self.tier_defaults.strong.clone(),
            ModelTier::Balanced => self.tier_defaults.balanced.clone(),
            ModelTier::Fast => self.tier_defaults.fast.clone(),
        }
    }

    /// Get all available models.
    pub fn models(&self) -> &[ModelSpec] {
        &self.models
    }

    /// Add a model to the router.
    pub fn add_model(&mut self, model: ModelSpec) {
        self.models.push(model);
    }
}

impl Default for SmartRouter {
    fn default() -> Self {
        Self::new()
    }
}
