use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::band::{BandBreakoutFactory, BandOscillatorFactory};
use super::bracket::BracketFactory;
use super::ripple::RippleFactory;
use super::targets::TargetsFactory;
use super::trailing::TrailingFactory;
use super::{Strategy, StrategyOptions};
use crate::errors::{Error, Result};
use crate::market::Gateway;

/// Factory trait for creating strategies
#[async_trait]
pub trait StrategyFactory: Send + Sync {
    /// Build a strategy bound to `gateway`.
    ///
    /// `args` are the plan's own arguments (pair first); `buy` asks the
    /// plan to open its position instead of managing an existing one.
    async fn create(
        &self,
        name: &str,
        gateway: Arc<dyn Gateway>,
        args: &[String],
        buy: bool,
        options: &StrategyOptions,
    ) -> Result<Box<dyn Strategy>>;
}

/// Registry for strategy factories
pub struct StrategyRegistry {
    factories: HashMap<String, Box<dyn StrategyFactory>>,
}

impl StrategyRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in plan
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("auto_bb", BandBreakoutFactory);
        registry.register("auto_bbrsi", BandOscillatorFactory);
        registry.register("targets", TargetsFactory);
        registry.register("trailing", TrailingFactory);
        registry.register("cut", BracketFactory);
        registry.register("ripple", RippleFactory);
        registry
    }

    /// Register a strategy factory
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: StrategyFactory + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Registered plan names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Create a strategy by name
    pub async fn create_strategy(
        &self,
        name: &str,
        gateway: Arc<dyn Gateway>,
        args: &[String],
        buy: bool,
        options: &StrategyOptions,
    ) -> Result<Box<dyn Strategy>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownStrategy(name.to_string()))?;
        factory.create(name, gateway, args, buy, options).await
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::mock::MockGateway;

    #[test]
    fn test_default_plans() {
        let registry = StrategyRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["auto_bb", "auto_bbrsi", "cut", "ripple", "targets", "trailing"]);
    }

    #[tokio::test]
    async fn test_unknown_strategy() {
        let registry = StrategyRegistry::with_defaults();
        let result = registry
            .create_strategy("martingale", Arc::new(MockGateway::new()), &[], false, &StrategyOptions::default())
            .await;
        assert!(matches!(result, Err(Error::UnknownStrategy(_))));
    }

    #[tokio::test]
    async fn test_bad_arguments() {
        let registry = StrategyRegistry::with_defaults();
        let args = vec!["BTC-ETH".to_string()];
        let result = registry
            .create_strategy("cut", Arc::new(MockGateway::new()), &args, false, &StrategyOptions::default())
            .await;
        assert!(matches!(result, Err(Error::InvalidArgs(_))));
    }
}
