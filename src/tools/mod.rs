//! Capability registry and calculator seam
//!
//! The registry maps `(country, tool)` to calculator metadata and is loaded
//! once at startup from declarative TOML. It is immutable afterwards and
//! shared read-only across requests. Calculators themselves live behind the
//! [`Calculator`] trait.

use crate::country::Country;
use crate::error::OrchestrationError;
use crate::models::{Citation, MemberContext, QueryParams};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

pub mod http;
pub mod reference;

pub use http::HttpCalculator;
pub use reference::ReferenceCalculator;

const BUNDLED_REGISTRY: &str = include_str!("../../config/capabilities.toml");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ToolId {
    Eligibility,
    Tax,
    Benefit,
    Projection,
}

impl ToolId {
    pub const ALL: [ToolId; 4] = [ToolId::Eligibility, ToolId::Tax, ToolId::Benefit, ToolId::Projection];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolId::Eligibility => "eligibility",
            ToolId::Tax => "tax",
            ToolId::Benefit => "benefit",
            ToolId::Projection => "projection",
        }
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolId {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "eligibility" => Ok(ToolId::Eligibility),
            "tax" => Ok(ToolId::Tax),
            "benefit" => Ok(ToolId::Benefit),
            "projection" => Ok(ToolId::Projection),
            other => Err(OrchestrationError::UnknownTool(other.to_string())),
        }
    }
}

/// Calculator metadata for one `(country, tool)` pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub country: Country,
    pub tool: ToolId,
    pub name: String,
    pub authority: String,
    pub description: String,
    /// Calculator function name on the calculator service
    pub callable: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

/// Opaque calculator reachable by capability
#[async_trait::async_trait]
pub trait Calculator: Send + Sync {
    async fn invoke(
        &self,
        capability: &Capability,
        member: &MemberContext,
        params: &QueryParams,
    ) -> Result<Value>;
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    capability: Vec<Capability>,
}

/// Read-only `(country, tool)` lookup
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    capabilities: HashMap<(Country, ToolId), Arc<Capability>>,
}

impl CapabilityRegistry {
    /// Parse a registry document and check that every country has every tool
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let file: RegistryFile = toml::from_str(source)?;

        let mut capabilities = HashMap::with_capacity(file.capability.len());
        for capability in file.capability {
            let key = (capability.country, capability.tool);
            if capabilities.insert(key, Arc::new(capability)).is_some() {
                return Err(OrchestrationError::Registry(format!(
                    "duplicate capability for {} {}",
                    key.0, key.1
                )));
            }
        }

        let missing: Vec<String> = Country::ALL
            .iter()
            .flat_map(|country| ToolId::ALL.iter().map(move |tool| (*country, *tool)))
            .filter(|key| !capabilities.contains_key(key))
            .map(|(country, tool)| format!("{}/{}", country, tool))
            .collect();

        if !missing.is_empty() {
            return Err(OrchestrationError::Registry(format!(
                "registry is missing capabilities: {}",
                missing.join(", ")
            )));
        }

        Ok(Self { capabilities })
    }

    /// Registry shipped with the crate
    pub fn bundled() -> Result<Self> {
        Self::from_toml_str(BUNDLED_REGISTRY)
    }

    /// Load from `path` when given, otherwise the bundled registry
    pub fn load(path: Option<&str>) -> Result<Self> {
        let registry = match path {
            Some(path) => {
                let source = std::fs::read_to_string(path)?;
                Self::from_toml_str(&source)?
            }
            None => Self::bundled()?,
        };

        info!(
            capabilities = registry.len(),
            source = path.unwrap_or("bundled"),
            "Capability registry loaded"
        );
        Ok(registry)
    }

    pub fn get(&self, country: Country, tool: ToolId) -> Option<Arc<Capability>> {
        self.capabilities.get(&(country, tool)).cloned()
    }

    /// Resolve a tool identifier as issued by the classifier
    pub fn resolve(&self, country: Country, tool_id: &str) -> Result<Arc<Capability>> {
        let tool: ToolId = tool_id.parse()?;
        self.get(country, tool)
            .ok_or_else(|| OrchestrationError::UnknownTool(format!("{}/{}", country, tool_id)))
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}
