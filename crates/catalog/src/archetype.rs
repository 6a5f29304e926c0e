use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use stockroom_core::{ArchetypeId, DomainError, DomainResult, Entity, Money};

/// Catalog entry describing a sellable product model. Not inventory itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArchetype {
    pub id: ArchetypeId,
    pub name: String,
    pub base_price: Money,
    pub storages: Vec<String>,
    pub colors: Vec<String>,
    pub condition: String,
    pub subcategory: String,
    /// Per-storage price overrides; storages without an entry sell at `base_price`.
    #[serde(default)]
    pub storage_prices: BTreeMap<String, Money>,
}

impl ModelArchetype {
    /// Price a row with the given storage sells at.
    pub fn effective_price(&self, storage: Option<&str>) -> Money {
        storage
            .and_then(|s| self.storage_prices.get(s))
            .copied()
            .unwrap_or(self.base_price)
    }

    pub fn has_storage_override(&self, storage: &str) -> bool {
        self.storage_prices.contains_key(storage)
    }
}

impl Entity for ModelArchetype {
    type Id = ArchetypeId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Archetype as submitted by the catalog editor.
///
/// Entries created in the editor have no id yet; edits of existing entries
/// should carry the id they were loaded with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchetypeInput {
    #[serde(default)]
    pub id: Option<ArchetypeId>,
    pub name: String,
    pub base_price: Money,
    #[serde(default)]
    pub storages: Vec<String>,
    #[serde(default)]
    pub colors: Vec<String>,
    pub condition: String,
    pub subcategory: String,
    #[serde(default)]
    pub storage_prices: BTreeMap<String, Money>,
}

impl ArchetypeInput {
    pub fn into_archetype(self, id: ArchetypeId) -> ModelArchetype {
        ModelArchetype {
            id,
            name: self.name,
            base_price: self.base_price,
            storages: self.storages,
            colors: self.colors,
            condition: self.condition,
            subcategory: self.subcategory,
            storage_prices: self.storage_prices,
        }
    }

    pub(crate) fn structural_key(&self) -> (&str, &str) {
        (self.subcategory.as_str(), self.condition.as_str())
    }
}

impl From<ModelArchetype> for ArchetypeInput {
    fn from(value: ModelArchetype) -> Self {
        Self {
            id: Some(value.id),
            name: value.name,
            base_price: value.base_price,
            storages: value.storages,
            colors: value.colors,
            condition: value.condition,
            subcategory: value.subcategory,
            storage_prices: value.storage_prices,
        }
    }
}

/// The full, ordered model catalog at a given version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub version: u64,
    pub archetypes: Vec<ModelArchetype>,
}

impl Catalog {
    pub fn new(version: u64, archetypes: Vec<ModelArchetype>) -> Self {
        Self { version, archetypes }
    }

    pub fn get(&self, id: ArchetypeId) -> Option<&ModelArchetype> {
        self.archetypes.iter().find(|a| a.id == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&ModelArchetype> {
        self.archetypes.iter().find(|a| a.name == name)
    }

    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }
}

/// Reject a submitted catalog that cannot be reconciled unambiguously.
pub(crate) fn validate_inputs(inputs: &[ArchetypeInput]) -> DomainResult<()> {
    let mut names = HashSet::new();
    let mut ids = HashSet::new();

    for input in inputs {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("archetype name cannot be empty"));
        }
        if !names.insert(name) {
            return Err(DomainError::validation(format!(
                "duplicate archetype name: {name}"
            )));
        }
        if let Some(id) = input.id {
            if !ids.insert(id) {
                return Err(DomainError::validation(format!("duplicate archetype id: {id}")));
            }
        }

        ensure_unique(name, "storage", &input.storages)?;
        ensure_unique(name, "color", &input.colors)?;

        if let Some(storage) = input
            .storage_prices
            .keys()
            .find(|s| !input.storages.contains(*s))
        {
            return Err(DomainError::validation(format!(
                "{name}: price override for unknown storage {storage}"
            )));
        }
    }
    Ok(())
}

fn ensure_unique(name: &str, field: &str, values: &[String]) -> DomainResult<()> {
    let mut seen = HashSet::new();
    for value in values {
        if value.trim().is_empty() {
            return Err(DomainError::validation(format!("{name}: empty {field} value")));
        }
        if !seen.insert(value.as_str()) {
            return Err(DomainError::validation(format!(
                "{name}: duplicate {field} {value}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str) -> ArchetypeInput {
        ArchetypeInput {
            id: None,
            name: name.to_string(),
            base_price: Money::new(40_000),
            storages: vec!["128GB".to_string(), "256GB".to_string()],
            colors: vec!["Black".to_string()],
            condition: "new".to_string(),
            subcategory: "phones".to_string(),
            storage_prices: BTreeMap::new(),
        }
    }

    #[test]
    fn effective_price_prefers_storage_override() {
        let mut archetype = input("X").into_archetype(ArchetypeId::new());
        archetype
            .storage_prices
            .insert("256GB".to_string(), Money::new(45_000));

        assert_eq!(archetype.effective_price(Some("256GB")), Money::new(45_000));
        assert_eq!(archetype.effective_price(Some("128GB")), Money::new(40_000));
        assert_eq!(archetype.effective_price(None), Money::new(40_000));
    }

    #[test]
    fn validation_rejects_duplicate_names() {
        let err = validate_inputs(&[input("X"), input("X")]).unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("duplicate archetype name")));
    }

    #[test]
    fn validation_rejects_override_for_unknown_storage() {
        let mut bad = input("X");
        bad.storage_prices.insert("1TB".to_string(), Money::new(1));
        assert!(validate_inputs(&[bad]).is_err());
    }

    #[test]
    fn validation_rejects_duplicate_colors() {
        let mut bad = input("X");
        bad.colors = vec!["Black".to_string(), "Black".to_string()];
        assert!(validate_inputs(&[bad]).is_err());
    }

    #[test]
    fn input_deserializes_without_optional_fields() {
        let json = r#"{"name":"X","base_price":100,"condition":"new","subcategory":"phones"}"#;
        let parsed: ArchetypeInput = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.id, None);
        assert!(parsed.storages.is_empty());
        assert!(parsed.storage_prices.is_empty());
    }
}
