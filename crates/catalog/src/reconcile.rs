//! Catalog reconciliation: join the submitted catalog against the current one
//! and derive the inventory edits the change implies.
//!
//! Entries are joined by [`ArchetypeId`]. Editors that resubmit entries
//! without ids are joined by exact name first; a leftover id-less entry only
//! inherits the id of a removed entry when it is the single candidate for the
//! single removed entry with the same subcategory and condition. Every other
//! case is reported as ambiguous and treated as a brand new archetype.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use stockroom_core::{ArchetypeId, DomainResult};

use crate::archetype::{ArchetypeInput, Catalog, ModelArchetype, validate_inputs};
use crate::patch::{ArchetypeRef, ProductPatch, PropagationPlan};

/// A removed/added pairing that could not be resolved to a single rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguousRename {
    pub subcategory: String,
    pub condition: String,
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

/// Outcome of reconciling a submitted catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// The catalog to persist, version bumped, every entry with a stable id.
    pub catalog: Catalog,
    pub plan: PropagationPlan,
    pub ambiguous: Vec<AmbiguousRename>,
    /// Archetypes present before and absent now. Their rows are left as-is.
    pub removed: Vec<ArchetypeId>,
}

/// Reconcile `incoming` against `previous`.
pub fn reconcile(previous: &Catalog, incoming: Vec<ArchetypeInput>) -> DomainResult<Reconciliation> {
    validate_inputs(&incoming)?;

    let mut resolved: Vec<Option<ArchetypeId>> = incoming.iter().map(|i| i.id).collect();
    let claimed: HashSet<ArchetypeId> = resolved.iter().flatten().copied().collect();

    // Resubmitted entries without ids: exact name match against unclaimed entries.
    let mut unclaimed: Vec<&ModelArchetype> = previous
        .archetypes
        .iter()
        .filter(|a| !claimed.contains(&a.id))
        .collect();
    for (slot, input) in resolved.iter_mut().zip(&incoming) {
        if slot.is_some() {
            continue;
        }
        if let Some(pos) = unclaimed.iter().position(|a| a.name == input.name) {
            *slot = Some(unclaimed.remove(pos).id);
        }
    }

    let ambiguous = infer_renames(&unclaimed, &incoming, &mut resolved);

    let joined: HashSet<ArchetypeId> = resolved.iter().flatten().copied().collect();
    let removed = previous
        .archetypes
        .iter()
        .filter(|a| !joined.contains(&a.id))
        .map(|a| a.id)
        .collect();

    let archetypes: Vec<ModelArchetype> = incoming
        .into_iter()
        .zip(resolved)
        .map(|(input, id)| input.into_archetype(id.unwrap_or_default()))
        .collect();

    let version = previous.version + 1;
    let mut plan = PropagationPlan {
        catalog_version: version,
        patches: Vec::new(),
    };
    let mut renames = Vec::new();
    let mut list_edits = Vec::new();
    let mut prices = Vec::new();

    for current in &archetypes {
        let Some(before) = previous.get(current.id) else {
            continue;
        };
        let target = ArchetypeRef::new(before.id, before.name.clone());

        if before.name != current.name {
            renames.push(ProductPatch::RenameModel {
                target: target.clone(),
                name: current.name.clone(),
            });
        }

        let storage = diff_options(&before.storages, &current.storages);
        for (from, to) in &storage.renamed {
            list_edits.push(ProductPatch::RenameStorage {
                target: target.clone(),
                from: from.clone(),
                to: to.clone(),
            });
        }
        for value in &storage.removed {
            list_edits.push(ProductPatch::ClearStorage {
                target: target.clone(),
                value: value.clone(),
            });
        }

        let color = diff_options(&before.colors, &current.colors);
        for (from, to) in color.renamed {
            list_edits.push(ProductPatch::RenameColor {
                target: target.clone(),
                from,
                to,
            });
        }
        for value in color.removed {
            list_edits.push(ProductPatch::ClearColor {
                target: target.clone(),
                value,
            });
        }

        prices.extend(price_patches(&target, before, current, &storage.renamed));
    }

    plan.patches.extend(renames);
    plan.patches.extend(list_edits);
    plan.patches.extend(prices);

    Ok(Reconciliation {
        catalog: Catalog::new(version, archetypes),
        plan,
        ambiguous,
        removed,
    })
}

/// Pair leftover removed entries with leftover id-less entries that share
/// subcategory and condition, one-to-one only.
fn infer_renames(
    unclaimed: &[&ModelArchetype],
    incoming: &[ArchetypeInput],
    resolved: &mut [Option<ArchetypeId>],
) -> Vec<AmbiguousRename> {
    let mut removed_by_key: BTreeMap<(&str, &str), Vec<&ModelArchetype>> = BTreeMap::new();
    for &archetype in unclaimed {
        removed_by_key
            .entry((archetype.subcategory.as_str(), archetype.condition.as_str()))
            .or_default()
            .push(archetype);
    }

    let mut added_by_key: HashMap<(&str, &str), Vec<usize>> = HashMap::new();
    for (idx, input) in incoming.iter().enumerate() {
        if resolved[idx].is_none() {
            added_by_key.entry(input.structural_key()).or_default().push(idx);
        }
    }

    let mut ambiguous = Vec::new();
    for (key, removed) in removed_by_key {
        let Some(added) = added_by_key.get(&key) else {
            continue;
        };
        if let ([only_removed], [only_added]) = (removed.as_slice(), added.as_slice()) {
            resolved[*only_added] = Some(only_removed.id);
            continue;
        }
        ambiguous.push(AmbiguousRename {
            subcategory: key.0.to_string(),
            condition: key.1.to_string(),
            removed: removed.iter().map(|a| a.name.clone()).collect(),
            added: added.iter().map(|&i| incoming[i].name.clone()).collect(),
        });
    }
    ambiguous
}

#[derive(Debug, Default, PartialEq, Eq)]
struct OptionEdits {
    renamed: Vec<(String, String)>,
    removed: Vec<String>,
}

/// Same-length lists are read positionally: a slot whose old value vanished
/// and whose new value is brand new is a rename. A reorder is never a rename.
/// Old values with no positional counterpart are removed outright.
fn diff_options(before: &[String], after: &[String]) -> OptionEdits {
    let mut edits = OptionEdits::default();

    if before.len() == after.len() {
        for (old, new) in before.iter().zip(after) {
            if old != new && !after.contains(old) && !before.contains(new) {
                edits.renamed.push((old.clone(), new.clone()));
            }
        }
    }

    for old in before {
        let renamed = edits.renamed.iter().any(|(from, _)| from == old);
        if !renamed && !after.contains(old) {
            edits.removed.push(old.clone());
        }
    }
    edits
}

fn price_patches(
    target: &ArchetypeRef,
    before: &ModelArchetype,
    current: &ModelArchetype,
    storage_renames: &[(String, String)],
) -> Vec<ProductPatch> {
    let previous_name = |storage: &str| -> String {
        storage_renames
            .iter()
            .find(|(_, to)| to == storage)
            .map(|(from, _)| from.clone())
            .unwrap_or_else(|| storage.to_string())
    };
    let renamed_to = |storage: &str| -> String {
        storage_renames
            .iter()
            .find(|(from, _)| from == storage)
            .map(|(_, to)| to.clone())
            .unwrap_or_else(|| storage.to_string())
    };

    let mut patches = Vec::new();

    if before.base_price != current.base_price {
        patches.push(ProductPatch::SetBasePrice {
            target: target.clone(),
            price: current.base_price,
            except_storages: current.storage_prices.keys().cloned().collect(),
        });
    }

    // Storages whose price is decided by an override now or was before.
    let mut priced: Vec<String> = current.storage_prices.keys().cloned().collect();
    for old in before.storage_prices.keys() {
        let now = renamed_to(old);
        if current.storages.contains(&now) && !priced.contains(&now) {
            priced.push(now);
        }
    }

    for storage in priced {
        let old_price = before.effective_price(Some(previous_name(&storage).as_str()));
        let new_price = current.effective_price(Some(storage.as_str()));
        if old_price != new_price {
            patches.push(ProductPatch::SetStoragePrice {
                target: target.clone(),
                storage,
                price: new_price,
            });
        }
    }
    patches
}
