//! Target-weight strategies feeding the governance triggers.

use std::collections::HashMap;

use crate::config::WeightsConfig;

/// Supplies target allocation weights when a proposal is raised.
///
/// Implementations are injected into the governance engine; the stock ones
/// below cover the sandbox, external callers bring their own.
pub trait WeightStrategy: Send + Sync {
    /// Strategy name (for logs and reports)
    fn name(&self) -> &str;

    /// Compute target weights from the latest known prices. Keys of the
    /// returned map are the assets the proposal will cover.
    fn target_weights(&self, prices: &HashMap<String, f64>) -> HashMap<String, f64>;
}

/// Spread the allocation evenly over every known asset.
pub struct EqualWeights;

impl WeightStrategy for EqualWeights {
    fn name(&self) -> &str {
        "equal"
    }

    fn target_weights(&self, prices: &HashMap<String, f64>) -> HashMap<String, f64> {
        if prices.is_empty() {
            return HashMap::new();
        }
        let share = 1.0 / prices.len() as f64;
        prices.keys().map(|asset| (asset.clone(), share)).collect()
    }
}

/// Always propose the configured target map, regardless of prices.
pub struct FixedWeights {
    targets: HashMap<String, f64>,
}

impl FixedWeights {
    pub fn new(targets: HashMap<String, f64>) -> Self {
        Self { targets }
    }
}

impl WeightStrategy for FixedWeights {
    fn name(&self) -> &str {
        "fixed"
    }

    fn target_weights(&self, _prices: &HashMap<String, f64>) -> HashMap<String, f64> {
        self.targets.clone()
    }
}

/// Build the strategy named in config; unknown names fall back to equal
/// weighting.
pub fn from_config(config: &WeightsConfig) -> Box<dyn WeightStrategy> {
    match config.strategy.as_str() {
        "fixed" => Box::new(FixedWeights::new(config.targets.clone())),
        _ => Box::new(EqualWeights),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prices(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(a, p)| (a.to_string(), *p)).collect()
    }

    #[test]
    fn test_equal_weights_two_assets() {
        let weights = EqualWeights.target_weights(&prices(&[("BTC", 50_000.0), ("ETH", 3_000.0)]));
        assert_eq!(weights.len(), 2);
        assert_eq!(weights.get("BTC"), Some(&0.5));
        assert_eq!(weights.get("ETH"), Some(&0.5));
    }

    #[test]
    fn test_equal_weights_sum_to_one() {
        let weights =
            EqualWeights.target_weights(&prices(&[("A", 1.0), ("B", 2.0), ("C", 3.0), ("D", 4.0)]));
        let sum: f64 = weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_equal_weights_empty_universe() {
        assert!(EqualWeights.target_weights(&HashMap::new()).is_empty());
    }

    #[test]
    fn test_fixed_weights_ignore_prices() {
        let targets = prices(&[("BTC", 0.7), ("ETH", 0.3)]);
        let strategy = FixedWeights::new(targets.clone());
        assert_eq!(strategy.target_weights(&HashMap::new()), targets);
        assert_eq!(strategy.target_weights(&prices(&[("SOL", 100.0)])), targets);
    }

    #[test]
    fn test_from_config_fixed() {
        let config = WeightsConfig {
            strategy: "fixed".to_string(),
            targets: prices(&[("BTC", 1.0)]),
        };
        let strategy = from_config(&config);
        assert_eq!(strategy.name(), "fixed");
        assert_eq!(
            strategy.target_weights(&HashMap::new()).get("BTC"),
            Some(&1.0)
        );
    }

    #[test]
    fn test_from_config_unknown_falls_back_to_equal() {
        let config = WeightsConfig {
            strategy: "momentum".to_string(),
            targets: HashMap::new(),
        };
        assert_eq!(from_config(&config).name(), "equal");
    }
}
