//! Directive and service registries.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use super::{builtin, Directive};
use crate::config::RegistryConfig;
use crate::error::{EngineError, Result};

/// One directive found on one node.
#[derive(Debug, Clone)]
pub struct Matched {
    /// The matched definition.
    pub directive: Arc<Directive>,
    /// Full attribute name that matched, empty for element directives.
    pub attribute: String,
    /// The `:arg` suffix of the attribute, if any.
    pub arg: Option<String>,
    /// The attribute value.
    pub expression: String,
}

/// Named definitions plus the markup spelling used to find them.
#[derive(Debug, Clone, Default)]
pub struct DirectiveRegistry {
    config: RegistryConfig,
    directives: IndexMap<String, Arc<Directive>>,
}

impl DirectiveRegistry {
    /// An empty registry with the default spelling.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty registry with a custom spelling.
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            config,
            directives: IndexMap::new(),
        }
    }

    /// A registry holding `if`, `for`, `text` and `show`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry);
        registry
    }

    /// Prefix and reserved names this registry validates against.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Add a directive.
    ///
    /// Rejected: an empty or duplicate name, a name containing the argument
    /// separator, a definition with neither behavior nor template, and an
    /// async definition without fallback markup.
    pub fn register(&mut self, directive: Directive) -> Result<()> {
        let name = directive.name().to_string();
        let invalid = |reason: &str| EngineError::InvalidDirective {
            name: name.clone(),
            reason: reason.to_string(),
        };

        if name.is_empty() || name.contains(':') {
            return Err(invalid("names must be non-empty and must not contain ':'"));
        }
        if self.directives.contains_key(&name) {
            return Err(invalid("already registered"));
        }
        if directive.behavior_fn().is_none() && directive.template_markup().is_none() {
            return Err(invalid("neither a behavior nor a template"));
        }
        if let Some(options) = directive.async_options() {
            if options.fallback.is_none() {
                return Err(invalid("asynchronous directives need fallback markup"));
            }
        }

        tracing::debug!(directive = %name, "registered directive");
        self.directives.insert(name, Arc::new(directive));
        Ok(())
    }

    /// A registered directive by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Directive>> {
        self.directives.get(name)
    }

    /// Number of registered directives.
    pub fn len(&self) -> usize {
        self.directives.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    /// Every directive applying to an element, in execution order.
    pub fn discover(&self, tag: &str, attributes: &[(String, String)]) -> Vec<Matched> {
        let prefix = self.config.prefix.as_str();
        let mut matched = Vec::new();

        if let Some(name) = tag.strip_prefix(prefix) {
            if let Some(directive) = self.directives.get(name).filter(|d| d.is_element()) {
                matched.push(Matched {
                    directive: directive.clone(),
                    attribute: String::new(),
                    arg: None,
                    expression: String::new(),
                });
            }
        }

        for (attribute, value) in attributes {
            if *attribute == self.config.data_attribute {
                continue;
            }
            let Some(rest) = attribute.strip_prefix(prefix) else {
                continue;
            };
            let (name, arg) = match rest.split_once(':') {
                Some((name, arg)) => (name, Some(arg.to_string())),
                None => (rest, None),
            };
            if let Some(directive) = self.directives.get(name).filter(|d| !d.is_element()) {
                matched.push(Matched {
                    directive: directive.clone(),
                    attribute: attribute.clone(),
                    arg,
                    expression: value.clone(),
                });
            }
        }

        matched.sort_by(|a, b| a.directive.execution_order(&b.directive));
        matched
    }
}

/// Application services directives can depend on by name.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: IndexMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ServiceRegistry {
    /// An empty service registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a service.
    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, service: T) {
        self.services.insert(name.into(), Arc::new(service));
    }

    pub(crate) fn get_any(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(name).cloned()
    }

    /// A service by name and type.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get_any(name).and_then(|service| service.downcast::<T>().ok())
    }

    /// Whether a service is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.services.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::{AsyncOptions, DirectiveClass, Outcome};
    use serde_json::Value;

    fn plain(name: &str, priority: i32) -> Directive {
        Directive::new(name)
            .priority(priority)
            .behavior(|_| Ok(Outcome::Continue))
    }

    fn attrs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn rejects_meaningless_definitions() {
        let mut registry = DirectiveRegistry::new();
        assert!(matches!(
            registry.register(Directive::new("empty")),
            Err(EngineError::InvalidDirective { .. })
        ));

        let no_fallback = Directive::new("load")
            .template("<p></p>")
            .asynchronous(AsyncOptions::new(|_| async { Ok(Value::Null) }));
        assert!(registry.register(no_fallback).is_err());

        registry.register(plain("once", 0)).unwrap();
        assert!(registry.register(plain("once", 1)).is_err());
        assert!(registry.register(plain("a:b", 0)).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn discovers_in_execution_order() {
        let mut registry = DirectiveRegistry::new();
        registry.register(plain("low", 1)).unwrap();
        registry.register(plain("high", 10)).unwrap();
        registry
            .register(plain("gate", -5).class(DirectiveClass::Conditional))
            .unwrap();

        let found = registry.discover(
            "div",
            &attrs(&[("x-low", ""), ("class", "c"), ("x-high", ""), ("x-gate", "ok")]),
        );
        let names: Vec<_> = found.iter().map(|m| m.directive.name()).collect();
        assert_eq!(names, vec!["gate", "high", "low"]);
    }

    #[test]
    fn parses_argument_suffix_and_skips_data_attribute() {
        let mut registry = DirectiveRegistry::new();
        registry.register(plain("on", 0)).unwrap();
        registry.register(plain("data", 0)).unwrap();

        let found = registry.discover("button", &attrs(&[("x-on:click", "go"), ("x-data", "{}")]));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].arg.as_deref(), Some("click"));
        assert_eq!(found[0].expression, "go");
    }

    #[test]
    fn element_directives_match_tags_only() {
        let mut registry = DirectiveRegistry::new();
        registry
            .register(Directive::new("card").template("<div></div>").element())
            .unwrap();

        assert_eq!(registry.discover("x-card", &[]).len(), 1);
        assert!(registry.discover("div", &attrs(&[("x-card", "")])).is_empty());
    }

    #[test]
    fn services_downcast_by_type() {
        let mut services = ServiceRegistry::new();
        services.insert("greeting", String::from("hi"));
        assert_eq!(services.get::<String>("greeting").as_deref().map(String::as_str), Some("hi"));
        assert!(services.get::<u32>("greeting").is_none());
        assert!(!services.contains("missing"));
    }
}
