//! Read-side configuration surface.
//!
//! The core consumes three kinds of settings: a shared-memory backing path
//! per ether (with a `"default"` fallback entry), a reset flag per ether,
//! and free-form `(object, attribute)` strings that components parse
//! themselves. How the store gets populated (JSON file, environment, a
//! host service) is the embedding application's business; the core only
//! reads.

use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no shared-memory path configured for ether '{0}'")]
    MissingEtherPath(String),
}

#[derive(Debug, Default)]
pub struct Config {
    ethers: HashMap<String, String>,
    ether_init: HashMap<String, bool>,
    attributes: HashMap<String, HashMap<String, String>>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the backing file path for a shared ether. The name
    /// `"default"` serves as a fallback for ethers with no entry of their
    /// own.
    pub fn set_ether_path(&mut self, ether: &str, path: &str) {
        self.ethers.insert(ether.to_string(), path.to_string());
    }

    /// Sets whether the assembly initializes this ether's region
    /// (`reset = true`) instead of joining it.
    pub fn set_ether_reset(&mut self, ether: &str, reset: bool) {
        self.ether_init.insert(ether.to_string(), reset);
    }

    pub fn set_attribute(&mut self, object: &str, attribute: &str, value: &str) {
        self.attributes
            .entry(object.to_string())
            .or_default()
            .insert(attribute.to_string(), value.to_string());
    }

    /// Backing file path for an ether, falling back to the `"default"`
    /// entry.
    pub fn ether_path(&self, ether: &str) -> Result<&str, ConfigError> {
        self.ethers
            .get(ether)
            .or_else(|| self.ethers.get("default"))
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingEtherPath(ether.to_string()))
    }

    /// Whether the assembly resets this ether's region. Defaults to
    /// `false`: joining an existing region is the common case, exactly one
    /// process should initialize it.
    pub fn ether_reset(&self, ether: &str) -> bool {
        self.ether_init.get(ether).copied().unwrap_or(false)
    }

    /// Reads and parses an attribute, falling back to parsing `default`
    /// when the attribute is missing or unparsable.
    ///
    /// # Panics
    ///
    /// Panics if `default` itself does not parse as `T`; defaults are
    /// compile-time strings and a bad one is a programming error.
    pub fn attribute<T: FromStr>(&self, object: &str, attribute: &str, default: &str) -> T {
        self.attributes
            .get(object)
            .and_then(|attrs| attrs.get(attribute))
            .and_then(|value| value.parse().ok())
            .unwrap_or_else(|| match default.parse() {
                Ok(value) => value,
                Err(_) => panic!(
                    "default '{}' for ({}, {}) does not parse",
                    default, object, attribute
                ),
            })
    }
}

/// Application context threaded through an assembly: the application name
/// plus its configuration.
#[derive(Debug, Default)]
pub struct Context {
    pub appname: String,
    pub config: Config,
}

impl Context {
    pub fn new(appname: &str, config: Config) -> Self {
        Self {
            appname: appname.to_string(),
            config,
        }
    }

    pub fn attribute<T: FromStr>(&self, object: &str, attribute: &str, default: &str) -> T {
        self.config.attribute(object, attribute, default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ether_path_prefers_exact_entry_over_default() {
        let mut config = Config::new();
        config.set_ether_path("default", "/tmp/default.ether");
        config.set_ether_path("OrderPath", "/tmp/orders.ether");

        assert_eq!(config.ether_path("OrderPath").unwrap(), "/tmp/orders.ether");
        assert_eq!(config.ether_path("Anything").unwrap(), "/tmp/default.ether");
    }

    #[test]
    fn missing_ether_path_is_an_error() {
        let config = Config::new();
        match config.ether_path("OrderPath") {
            Err(ConfigError::MissingEtherPath(name)) => assert_eq!(name, "OrderPath"),
            other => panic!("expected missing-path error, got {:?}", other),
        }
    }

    #[test]
    fn ether_reset_defaults_to_false() {
        let mut config = Config::new();
        assert!(!config.ether_reset("OrderPath"));
        config.set_ether_reset("OrderPath", true);
        assert!(config.ether_reset("OrderPath"));
    }

    #[test]
    fn attributes_parse_with_defaults() {
        let mut config = Config::new();
        config.set_attribute("gateway", "max_inflight", "128");
        config.set_attribute("gateway", "venue", "XNAS");

        assert_eq!(config.attribute::<u32>("gateway", "max_inflight", "16"), 128);
        assert_eq!(
            config.attribute::<String>("gateway", "venue", "NONE"),
            "XNAS"
        );
        // Missing attribute and missing object both fall back.
        assert_eq!(config.attribute::<u32>("gateway", "spread_bps", "3"), 3);
        assert_eq!(config.attribute::<bool>("risk", "enabled", "true"), true);
    }

    #[test]
    fn unparsable_value_falls_back_to_default() {
        let mut config = Config::new();
        config.set_attribute("gateway", "max_inflight", "not-a-number");
        assert_eq!(config.attribute::<u32>("gateway", "max_inflight", "16"), 16);
    }

    #[test]
    #[should_panic(expected = "does not parse")]
    fn unparsable_default_panics() {
        let config = Config::new();
        let _: u32 = config.attribute("gateway", "max_inflight", "not-a-number");
    }

    #[test]
    fn context_forwards_attribute_reads() {
        let mut config = Config::new();
        config.set_attribute("sink", "report_every", "1000");
        let ctx = Context::new("demo", config);
        assert_eq!(ctx.appname, "demo");
        assert_eq!(ctx.attribute::<u64>("sink", "report_every", "1"), 1000);
    }
}
