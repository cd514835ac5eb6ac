//! Contract ABI loading and interface checks

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::market::MarketMethod;
use crate::types::EventKind;
use crate::{ProsumerError, Result};

/// ABI of the reference energy market deployment
pub const ENERGY_MARKET_ABI: &str = include_str!("../../abi/EnergyMarket.json");

/// Single ABI parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiParam {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub indexed: bool,
}

/// Function, event or constructor declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub inputs: Vec<AbiParam>,
    #[serde(default)]
    pub outputs: Vec<AbiParam>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AbiDocument {
    Bare(Vec<AbiEntry>),
    Artifact { abi: Vec<AbiEntry> },
}

/// Parsed contract ABI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractAbi {
    entries: Vec<AbiEntry>,
}

impl ContractAbi {
    /// Parse a bare ABI array or a build artifact carrying an `abi` field
    pub fn from_json(content: &str) -> Result<Self> {
        let document: AbiDocument = serde_json::from_str(content)
            .map_err(|e| ProsumerError::Abi(format!("unreadable ABI document: {e}")))?;
        let entries = match document {
            AbiDocument::Bare(entries) => entries,
            AbiDocument::Artifact { abi } => abi,
        };
        Ok(Self { entries })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProsumerError::Abi(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    /// The bundled energy market ABI
    pub fn energy_market() -> Result<Self> {
        Self::from_json(ENERGY_MARKET_ABI)
    }

    pub fn entries(&self) -> &[AbiEntry] {
        &self.entries
    }

    pub fn function(&self, name: &str) -> Option<&AbiEntry> {
        self.find("function", name)
    }

    pub fn event(&self, name: &str) -> Option<&AbiEntry> {
        self.find("event", name)
    }

    /// Verify every method and event the agent uses is declared
    pub fn ensure_market_interface(&self) -> Result<()> {
        let mut missing = Vec::new();

        for method in MarketMethod::ALL {
            match self.function(method.name()) {
                Some(entry) if entry.inputs.len() == method.arity() => {}
                Some(entry) => missing.push(format!(
                    "function {} takes {} inputs, expected {}",
                    method.name(),
                    entry.inputs.len(),
                    method.arity()
                )),
                None => missing.push(format!("function {}", method.name())),
            }
        }

        for kind in [EventKind::Generated, EventKind::Consumed] {
            match self.event(kind.event_name()) {
                Some(entry) => {
                    for field in ["auctionId", "createdBy"] {
                        if !entry.inputs.iter().any(|p| p.name == field) {
                            missing.push(format!("event {} field {}", kind.event_name(), field));
                        }
                    }
                }
                None => missing.push(format!("event {}", kind.event_name())),
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProsumerError::Abi(format!(
                "contract ABI does not match the energy market: missing {}",
                missing.join(", ")
            )))
        }
    }

    fn find(&self, kind: &str, name: &str) -> Option<&AbiEntry> {
        self.entries
            .iter()
            .find(|entry| entry.kind == kind && entry.name.as_deref() == Some(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_abi_matches_market() {
        let abi = ContractAbi::energy_market().unwrap();
        abi.ensure_market_interface().unwrap();
        assert!(abi.event("EnergyGenerated").is_some());
        assert_eq!(abi.function("generateEnergy").unwrap().inputs.len(), 2);
    }

    #[test]
    fn test_artifact_and_bare_forms() {
        let bare = r#"[{"type":"function","name":"registerUser","inputs":[],"outputs":[]}]"#;
        let artifact = format!(r#"{{"contractName":"EnergyMarket","abi":{bare}}}"#);

        let a = ContractAbi::from_json(bare).unwrap();
        let b = ContractAbi::from_json(&artifact).unwrap();
        assert_eq!(a, b);
        assert!(a.function("registerUser").is_some());
    }

    #[test]
    fn test_missing_method_is_reported() {
        let bare = r#"[{"type":"function","name":"registerUser","inputs":[]}]"#;
        let err = ContractAbi::from_json(bare)
            .unwrap()
            .ensure_market_interface()
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("function endAuction"));
        assert!(message.contains("event EnergyConsumed"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_garbage_document() {
        assert!(ContractAbi::from_json("{\"not\":\"an abi\"}").is_err());
        assert!(ContractAbi::from_file("/definitely/not/here.json").is_err());
    }
}
