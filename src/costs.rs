use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default model short name when nothing else matches.
pub const DEFAULT_MODEL: &str = "sonnet";

/// Per-million-token pricing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pricing {
    pub input: f64,
    pub output: f64,
}

/// Cost thresholds in USD. `warn` and `alert` fire latched callbacks;
/// `max` is a hard gate with no callback.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CostThresholds {
    pub warn: f64,
    pub alert: f64,
    pub max: f64,
}

impl Default for CostThresholds {
    fn default() -> Self {
        Self {
            warn: 10.0,
            alert: 25.0,
            max: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdLevel {
    Ok,
    Warning,
    Alert,
    Stop,
}

/// Map a short alias to its full API model id.
fn full_model_id(short: &str) -> Option<&'static str> {
    match short {
        "haiku" => Some("claude-haiku-4-5-20251001"),
        "sonnet" => Some("claude-sonnet-4-5-20250929"),
        "opus" => Some("claude-opus-4-5-20251101"),
        _ => None,
    }
}

/// Resolve a model name to a full API model id. Short aliases map through
/// the alias table; ids that already look like API ids pass through;
/// anything else falls back by substring, defaulting to the mid tier.
pub fn resolve_model_id(model: &str) -> String {
    let lower = model.to_ascii_lowercase();
    if let Some(id) = full_model_id(&lower) {
        return id.to_string();
    }
    if model.starts_with("claude-") {
        return model.to_string();
    }
    let family = if lower.contains("haiku") {
        "haiku"
    } else if lower.contains("opus") {
        "opus"
    } else {
        DEFAULT_MODEL
    };
    full_model_id(family).unwrap_or_default().to_string()
}

/// Short name for a model, for pricing lookup and reporting.
pub fn model_short_name(model: &str) -> &'static str {
    let lower = model.to_ascii_lowercase();
    if lower.contains("haiku") {
        "haiku"
    } else if lower.contains("opus") {
        "opus"
    } else {
        DEFAULT_MODEL
    }
}

pub fn default_pricing() -> HashMap<String, Pricing> {
    HashMap::from([
        (
            "haiku".to_string(),
            Pricing {
                input: 1.0,
                output: 5.0,
            },
        ),
        (
            "sonnet".to_string(),
            Pricing {
                input: 3.0,
                output: 15.0,
            },
        ),
        (
            "opus".to_string(),
            Pricing {
                input: 5.0,
                output: 25.0,
            },
        ),
    ])
}

/// Overlay configured pricing on the defaults. Keys are normalized to
/// short names so either form works in config.
pub fn pricing_with_overrides(overrides: &HashMap<String, Pricing>) -> HashMap<String, Pricing> {
    let mut pricing = default_pricing();
    for (model, rates) in overrides {
        pricing.insert(model_short_name(model).to_string(), *rates);
    }
    pricing
}

type CostCallback = Box<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, Serialize)]
struct ModelTokens {
    input: u64,
    output: u64,
}

/// Point-in-time cost summary for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct CostSummary {
    pub total_cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub api_calls: u64,
    pub threshold_level: ThresholdLevel,
    pub remaining_budget: f64,
    pub cost_by_model: HashMap<String, f64>,
}

/// Accumulates token usage and USD cost per model, firing each threshold
/// callback at most once per tracker lifetime.
pub struct CostTracker {
    thresholds: CostThresholds,
    pricing: HashMap<String, Pricing>,
    on_warning: Option<CostCallback>,
    on_alert: Option<CostCallback>,

    total_cost: f64,
    input_tokens: u64,
    output_tokens: u64,
    api_calls: u64,
    cost_by_model: HashMap<String, f64>,
    tokens_by_model: HashMap<String, ModelTokens>,

    warning_acknowledged: bool,
    alert_acknowledged: bool,
}

impl CostTracker {
    pub fn new(thresholds: CostThresholds, pricing: HashMap<String, Pricing>) -> Self {
        Self {
            thresholds,
            pricing,
            on_warning: None,
            on_alert: None,
            total_cost: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            api_calls: 0,
            cost_by_model: HashMap::new(),
            tokens_by_model: HashMap::new(),
            warning_acknowledged: false,
            alert_acknowledged: false,
        }
    }

    pub fn set_warning_callback(&mut self, cb: impl Fn(f64) + Send + Sync + 'static) {
        self.on_warning = Some(Box::new(cb));
    }

    pub fn set_alert_callback(&mut self, cb: impl Fn(f64) + Send + Sync + 'static) {
        self.on_alert = Some(Box::new(cb));
    }

    fn pricing_for(&self, model: &str) -> Pricing {
        let short = model_short_name(model);
        self.pricing.get(short).copied().unwrap_or(Pricing {
            input: 3.0,
            output: 15.0,
        })
    }

    /// Cost of a single call at this tracker's rates.
    pub fn call_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let pricing = self.pricing_for(model);
        (input_tokens as f64 / 1_000_000.0) * pricing.input
            + (output_tokens as f64 / 1_000_000.0) * pricing.output
    }

    /// Record usage from one API call. Returns the cost of that call.
    pub fn add_usage(&mut self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let cost = self.call_cost(model, input_tokens, output_tokens);

        self.total_cost += cost;
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.api_calls += 1;

        *self.cost_by_model.entry(model.to_string()).or_default() += cost;
        let tokens = self.tokens_by_model.entry(model.to_string()).or_default();
        tokens.input += input_tokens;
        tokens.output += output_tokens;

        debug!(model, input_tokens, output_tokens, cost, total = self.total_cost, "usage added");
        self.check_thresholds();
        cost
    }

    fn check_thresholds(&mut self) {
        if self.total_cost >= self.thresholds.warn && !self.warning_acknowledged {
            self.warning_acknowledged = true;
            if let Some(cb) = &self.on_warning {
                cb(self.total_cost);
            }
        }
        if self.total_cost >= self.thresholds.alert && !self.alert_acknowledged {
            self.alert_acknowledged = true;
            if let Some(cb) = &self.on_alert {
                cb(self.total_cost);
            }
        }
    }

    pub fn threshold_level(&self) -> ThresholdLevel {
        if self.total_cost >= self.thresholds.max {
            ThresholdLevel::Stop
        } else if self.total_cost >= self.thresholds.alert {
            ThresholdLevel::Alert
        } else if self.total_cost >= self.thresholds.warn {
            ThresholdLevel::Warning
        } else {
            ThresholdLevel::Ok
        }
    }

    /// Hard gate: the loop must not make another model call once this is true.
    pub fn should_stop(&self) -> bool {
        self.total_cost >= self.thresholds.max
    }

    pub fn remaining_budget(&self) -> f64 {
        (self.thresholds.max - self.total_cost).max(0.0)
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    pub fn api_calls(&self) -> u64 {
        self.api_calls
    }

    /// Clear the latches, e.g. when a resumed run gets a fresh budget.
    pub fn reset_alerts(&mut self) {
        self.warning_acknowledged = false;
        self.alert_acknowledged = false;
    }

    /// Seed the total from a checkpoint and re-evaluate thresholds so
    /// crossings from prior sessions latch (and fire) immediately.
    pub fn set_initial_cost(&mut self, cost: f64) {
        self.total_cost = cost;
        self.check_thresholds();
    }

    pub fn summary(&self) -> CostSummary {
        CostSummary {
            total_cost: self.total_cost,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
            api_calls: self.api_calls,
            threshold_level: self.threshold_level(),
            remaining_budget: self.remaining_budget(),
            cost_by_model: self.cost_by_model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn tracker(warn: f64, alert: f64, max: f64) -> CostTracker {
        CostTracker::new(
            CostThresholds { warn, alert, max },
            default_pricing(),
        )
    }

    #[test]
    fn resolves_short_names() {
        assert_eq!(resolve_model_id("sonnet"), "claude-sonnet-4-5-20250929");
        assert_eq!(resolve_model_id("HAIKU"), "claude-haiku-4-5-20251001");
        assert_eq!(resolve_model_id("opus"), "claude-opus-4-5-20251101");
    }

    #[test]
    fn passes_full_ids_through() {
        assert_eq!(
            resolve_model_id("claude-sonnet-4-20250514"),
            "claude-sonnet-4-20250514"
        );
    }

    #[test]
    fn falls_back_by_substring() {
        assert_eq!(resolve_model_id("my-haiku-variant"), "claude-haiku-4-5-20251001");
        assert_eq!(resolve_model_id("unknown"), "claude-sonnet-4-5-20250929");
    }

    #[test]
    fn short_name_extraction() {
        assert_eq!(model_short_name("claude-opus-4-5-20251101"), "opus");
        assert_eq!(model_short_name("haiku"), "haiku");
        assert_eq!(model_short_name("gibberish"), "sonnet");
    }

    #[test]
    fn computes_call_cost() {
        let tracker = tracker(10.0, 25.0, 50.0);
        // sonnet: 3 $/M in, 15 $/M out
        let cost = tracker.call_cost("sonnet", 1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn accumulates_per_model() {
        let mut tracker = tracker(100.0, 200.0, 300.0);
        tracker.add_usage("sonnet", 1000, 500);
        tracker.add_usage("haiku", 2000, 100);
        tracker.add_usage("sonnet", 1000, 500);

        assert_eq!(tracker.api_calls(), 3);
        let summary = tracker.summary();
        assert_eq!(summary.input_tokens, 4000);
        assert_eq!(summary.output_tokens, 1100);
        assert_eq!(summary.cost_by_model.len(), 2);
    }

    #[test]
    fn warning_fires_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut tracker = tracker(0.01, 1.0, 2.0);
        let counter = fired.clone();
        tracker.set_warning_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Nothing before the threshold.
        tracker.add_usage("sonnet", 100, 100);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Crossing fires once; further usage does not re-fire.
        tracker.add_usage("sonnet", 1_000_000, 0);
        tracker.add_usage("sonnet", 1_000_000, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn alert_fires_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut tracker = tracker(0.01, 0.02, 100.0);
        let counter = fired.clone();
        tracker.set_alert_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tracker.add_usage("sonnet", 1_000_000, 0);
        tracker.add_usage("sonnet", 1_000_000, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn initial_cost_triggers_latches() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut tracker = tracker(5.0, 25.0, 50.0);
        let counter = fired.clone();
        tracker.set_warning_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tracker.set_initial_cost(6.0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Already latched: more usage never re-fires.
        tracker.add_usage("sonnet", 1_000_000, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hard_stop_at_max() {
        let mut tracker = tracker(0.01, 0.02, 0.03);
        assert!(!tracker.should_stop());
        // 10k in + 10k out on sonnet ≈ $0.18
        tracker.add_usage("sonnet", 10_000, 10_000);
        assert!(tracker.should_stop());
        assert_eq!(tracker.threshold_level(), ThresholdLevel::Stop);
        assert_eq!(tracker.remaining_budget(), 0.0);
    }

    #[test]
    fn threshold_levels_in_order() {
        let mut tracker = tracker(1.0, 2.0, 3.0);
        assert_eq!(tracker.threshold_level(), ThresholdLevel::Ok);
        tracker.set_initial_cost(1.5);
        assert_eq!(tracker.threshold_level(), ThresholdLevel::Warning);
        tracker.set_initial_cost(2.5);
        assert_eq!(tracker.threshold_level(), ThresholdLevel::Alert);
    }

    #[test]
    fn pricing_overrides_normalize_keys() {
        let overrides = HashMap::from([(
            "claude-haiku-4-5-20251001".to_string(),
            Pricing {
                input: 0.25,
                output: 1.25,
            },
        )]);
        let pricing = pricing_with_overrides(&overrides);
        assert_eq!(pricing["haiku"].input, 0.25);
        // Untouched entries keep defaults.
        assert_eq!(pricing["sonnet"].input, 3.0);
    }

    #[test]
    fn reset_alerts_allows_refire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut tracker = tracker(0.01, 1.0, 2.0);
        let counter = fired.clone();
        tracker.set_warning_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tracker.add_usage("sonnet", 1_000_000, 0);
        tracker.reset_alerts();
        tracker.add_usage("sonnet", 1_000_000, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
