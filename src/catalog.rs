//! Immutable registry of declared services
//!
//! Built once from [`Config`] at startup. Every definition is validated here,
//! so an ambiguous image/build source is rejected before any listener binds.

use crate::config::{Config, ServiceConfig};
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Network address of a backend
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Where a service's image comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchSource {
    /// Registry image reference
    Image(String),
    /// Directory containing a Dockerfile
    BuildContext(PathBuf),
}

/// A validated service definition
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub name: String,
    pub source: LaunchSource,
    pub env: HashMap<String, String>,
    pub profile: Option<String>,
    pub internal_port: u16,
    pub readiness_pattern: Option<Regex>,
    /// Fixed address that replaces container management when set
    pub override_address: Option<Address>,
}

impl ServiceDefinition {
    /// Validate a raw service config
    pub fn from_config(config: &ServiceConfig) -> std::result::Result<Self, String> {
        let name = config.name.trim();
        if name.is_empty() {
            return Err("service name must not be empty".to_string());
        }

        let source = match (&config.image, &config.build_context) {
            (Some(image), None) => LaunchSource::Image(image.clone()),
            (None, Some(path)) => LaunchSource::BuildContext(context_dir(path)),
            (Some(_), Some(_)) => {
                return Err(format!(
                    "Service '{}': define either 'image' or 'build_context', not both",
                    name
                ))
            }
            (None, None) => {
                return Err(format!(
                    "Service '{}': either define an image name or a path to a Dockerfile",
                    name
                ))
            }
        };

        if config.internal_port == 0 {
            return Err(format!(
                "Service '{}': 'internal_port' must be greater than 0",
                name
            ));
        }

        let readiness_pattern = config
            .readiness_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| format!("Service '{}': invalid readiness pattern: {}", name, e))?;

        Ok(Self {
            name: name.to_string(),
            source,
            env: config.env.clone(),
            profile: config.profile.clone(),
            internal_port: config.internal_port,
            readiness_pattern,
            override_address: None,
        })
    }

    pub fn is_overridden(&self) -> bool {
        self.override_address.is_some()
    }
}

/// A path pointing at a `Dockerfile` builds from that file's directory
fn context_dir(path: &Path) -> PathBuf {
    if path.file_name().is_some_and(|f| f == "Dockerfile") {
        path.parent()
            .map(Path::to_path_buf)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."))
    } else {
        path.to_path_buf()
    }
}

/// Loaded-once set of service definitions, in declaration order
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    services: Vec<ServiceDefinition>,
    index: HashMap<String, usize>,
}

impl ServiceCatalog {
    /// Build and validate the catalog. All problems are reported together.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut errors = Vec::new();
        let mut services = Vec::new();
        let mut index = HashMap::new();

        for raw in &config.services {
            match ServiceDefinition::from_config(raw) {
                Ok(def) => {
                    if index.contains_key(&def.name) {
                        errors.push(format!("Service '{}' is declared more than once", def.name));
                        continue;
                    }
                    index.insert(def.name.clone(), services.len());
                    services.push(def);
                }
                Err(e) => errors.push(e),
            }
        }

        let mut overwritten = HashSet::new();
        for overwrite in &config.overwrites {
            match index.get(&overwrite.name) {
                Some(&i) if overwritten.insert(overwrite.name.clone()) => {
                    services[i].override_address =
                        Some(Address::new(overwrite.host.clone(), overwrite.port));
                }
                Some(_) => errors.push(format!(
                    "Overwrite for '{}' is declared more than once",
                    overwrite.name
                )),
                None => errors.push(format!(
                    "Overwrite '{}' does not match a declared service",
                    overwrite.name
                )),
            }
        }

        if !errors.is_empty() {
            return Err(Error::Configuration(errors.join("; ")));
        }

        Ok(Self { services, index })
    }

    pub fn lookup(&self, name: &str) -> Result<&ServiceDefinition> {
        self.index
            .get(name)
            .map(|&i| &self.services[i])
            .ok_or_else(|| Error::UnknownService(name.to_string()))
    }

    pub fn all(&self) -> impl Iterator<Item = &ServiceDefinition> {
        self.services.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|s| s.name.as_str())
    }

    pub fn override_for(&self, name: &str) -> Option<&Address> {
        self.lookup(name).ok().and_then(|s| s.override_address.as_ref())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
