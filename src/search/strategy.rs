//! The searchable-HMAC strategy.
//!
//! For every active HMAC key and every classified field the strategy builds
//! holders, fans lookup holders through tokenizers, folds unique-group
//! members into one compound holder per key, hashes everything in one bulk
//! call, and merges the results into the entity's persisted hash lists.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::envelope::service::EncryptionService;
use crate::errors::{FieldVaultError, Result};
use crate::keys::CryptoKey;
use crate::registry::descriptor::{Accessor, HashListBinding, HmacFieldSpec, HmacPurpose};
use crate::search::holder::{HmacEntry, HmacHolder};
use crate::search::tokenizer::HmacTokenizer;

/// Compound values join on the unit separator so ("ab","c") and ("a","bc")
/// cannot collide.
const GROUP_SEPARATOR: char = '\u{1F}';

/// Strategy selection carried by an entity descriptor.
#[derive(Clone, Debug, Default)]
pub enum HmacStrategyKind {
    /// Lookup/unique hashing with tokenizer fan-out and compound groups.
    #[default]
    Searchable,
}

/// How freshly computed entries combine with the persisted lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMergeMode {
    /// Keep existing entries under keys absent from the computed set. The
    /// write-path default: a lagging instance that has not yet seen a new
    /// key must not wipe out the hashes written under it.
    Retain,
    /// The computed set is authoritative; everything else is dropped. Rekey
    /// passes use this so entries under a retiring key actually leave the
    /// record.
    Replace,
}

struct LookupField<T> {
    name: String,
    get: Accessor<T>,
    tokenizers: Vec<Arc<dyn HmacTokenizer>>,
}

struct UniqueField<T> {
    name: String,
    get: Accessor<T>,
    optional: bool,
}

struct GroupSlot<T> {
    get: Accessor<T>,
    optional: bool,
}

struct UniqueGroup<T> {
    name: String,
    /// In declared 1..N order.
    members: Vec<GroupSlot<T>>,
}

/// Computes lookup and uniqueness hashes for one entity type.
pub struct SearchableHmacStrategy<T> {
    entity: String,
    lookup_fields: Vec<LookupField<T>>,
    unique_fields: Vec<UniqueField<T>>,
    groups: Vec<UniqueGroup<T>>,
    lookup_binding: Option<HashListBinding<T>>,
    unique_binding: Option<HashListBinding<T>>,
}

impl<T> SearchableHmacStrategy<T> {
    /// Build and validate the strategy from the registry's classification.
    ///
    /// Rejects: no fields at all, a bound hash list without fields of the
    /// matching purpose (and vice versa), and group orders that do not form
    /// exactly 1..N.
    pub(crate) fn from_specs(
        entity: &str,
        specs: Vec<HmacFieldSpec<T>>,
        lookup_binding: Option<HashListBinding<T>>,
        unique_binding: Option<HashListBinding<T>>,
    ) -> Result<Self> {
        let mut lookup_fields = Vec::new();
        let mut unique_fields = Vec::new();
        let mut grouped: Vec<(String, u32, GroupSlot<T>)> = Vec::new();

        for spec in specs {
            if spec.purposes.is_empty() && spec.group.is_none() {
                return Err(FieldVaultError::classification(
                    entity,
                    format!("HMAC field '{}' declares no purpose or group", spec.name),
                ));
            }
            for purpose in &spec.purposes {
                match purpose {
                    HmacPurpose::Lookup { tokenizers } => lookup_fields.push(LookupField {
                        name: spec.name.clone(),
                        get: Arc::clone(&spec.get),
                        tokenizers: tokenizers.iter().map(|k| k.build()).collect(),
                    }),
                    HmacPurpose::Unique { optional } => unique_fields.push(UniqueField {
                        name: spec.name.clone(),
                        get: Arc::clone(&spec.get),
                        optional: *optional,
                    }),
                }
            }
            if let Some(member) = &spec.group {
                grouped.push((
                    member.group.clone(),
                    member.order,
                    GroupSlot {
                        get: Arc::clone(&spec.get),
                        optional: member.optional,
                    },
                ));
            }
        }

        let groups = Self::build_groups(entity, grouped)?;

        if lookup_fields.is_empty() && unique_fields.is_empty() && groups.is_empty() {
            return Err(FieldVaultError::classification(
                entity,
                "HMAC strategy bound but no lookup, unique, or group fields declared",
            ));
        }
        if lookup_fields.is_empty() != lookup_binding.is_none() {
            return Err(FieldVaultError::classification(
                entity,
                "lookup-hash list must be bound exactly when a field has the LOOKUP purpose",
            ));
        }
        let has_unique = !unique_fields.is_empty() || !groups.is_empty();
        if has_unique != unique_binding.is_some() {
            return Err(FieldVaultError::classification(
                entity,
                "unique-hash list must be bound exactly when a field or group enforces uniqueness",
            ));
        }

        Ok(Self {
            entity: entity.to_string(),
            lookup_fields,
            unique_fields,
            groups,
            lookup_binding,
            unique_binding,
        })
    }

    fn build_groups(
        entity: &str,
        mut grouped: Vec<(String, u32, GroupSlot<T>)>,
    ) -> Result<Vec<UniqueGroup<T>>> {
        grouped.sort_by(|a, b| (a.0.as_str(), a.1).cmp(&(b.0.as_str(), b.1)));

        let mut groups: Vec<UniqueGroup<T>> = Vec::new();
        for (group_name, order, slot) in grouped {
            let group = match groups.last_mut() {
                Some(g) if g.name == group_name => g,
                _ => {
                    groups.push(UniqueGroup {
                        name: group_name.clone(),
                        members: Vec::new(),
                    });
                    groups.last_mut().expect("just pushed")
                }
            };
            // Sorted input means orders must arrive as exactly 1, 2, 3, ...
            let expected = group.members.len() as u32 + 1;
            if order != expected {
                return Err(FieldVaultError::classification(
                    entity,
                    format!(
                        "unique group '{group_name}' orders must form exactly 1..N; \
                         found {order} where {expected} was expected"
                    ),
                ));
            }
            group.members.push(slot);
        }
        Ok(groups)
    }

    /// Compute hashes for `entity` under every key in `keys` and merge them
    /// into the entity's lookup/unique lists with [`HashMergeMode::Retain`]:
    /// existing entries whose key id is absent from the freshly computed set
    /// are kept, which is what keeps multiple HMAC keys live during
    /// rotation, and if nothing new was computed the lists are left
    /// untouched.
    pub fn apply(
        &self,
        entity: &mut T,
        keys: &[Arc<CryptoKey>],
        service: &dyn EncryptionService,
    ) -> Result<()> {
        self.apply_with(entity, keys, service, HashMergeMode::Retain)
    }

    /// `apply` with an explicit merge mode.
    pub fn apply_with(
        &self,
        entity: &mut T,
        keys: &[Arc<CryptoKey>],
        service: &dyn EncryptionService,
        mode: HashMergeMode,
    ) -> Result<()> {
        if keys.is_empty() {
            return Err(FieldVaultError::NoActiveHmacKeys(self.entity.clone()));
        }

        let lookup_holders = self.lookup_holders(entity, keys);
        let unique_holders = self.unique_holders(entity, keys);

        let boundary = lookup_holders.len();
        let mut all = lookup_holders;
        all.extend(unique_holders);
        if !all.is_empty() {
            service.hmac(&mut all)?;
        }
        let unique_part = all.split_off(boundary);

        Self::merge(entity, &self.lookup_binding, all, mode);
        Self::merge(entity, &self.unique_binding, unique_part, mode);
        Ok(())
    }

    /// Whether any persisted hash entry was computed under `key_id`.
    pub(crate) fn references_key(&self, entity: &T, key_id: &str) -> bool {
        let listed = |binding: &Option<HashListBinding<T>>| {
            binding
                .as_ref()
                .is_some_and(|b| (b.get)(entity).iter().any(|e| e.key_id == key_id))
        };
        listed(&self.lookup_binding) || listed(&self.unique_binding)
    }

    fn lookup_holders(&self, entity: &T, keys: &[Arc<CryptoKey>]) -> Vec<HmacHolder> {
        let mut holders = Vec::new();
        let mut seen = HashSet::new();
        for key in keys {
            for field in &self.lookup_fields {
                let Some(value) = (field.get)(entity) else {
                    continue;
                };
                Self::push_deduped(
                    &mut holders,
                    &mut seen,
                    HmacHolder::new(Arc::clone(key), &field.name, Some(value.clone())),
                );
                for tokenizer in &field.tokenizers {
                    let Some(tokenized) = tokenizer.tokenize(&value) else {
                        continue;
                    };
                    let alias = format!("{}_{}", field.name, tokenizer.alias_suffix());
                    Self::push_deduped(
                        &mut holders,
                        &mut seen,
                        HmacHolder::with_tokenized(
                            Arc::clone(key),
                            alias,
                            value.clone(),
                            tokenized,
                        ),
                    );
                }
            }
        }
        holders
    }

    fn unique_holders(&self, entity: &T, keys: &[Arc<CryptoKey>]) -> Vec<HmacHolder> {
        let mut holders = Vec::new();
        let mut seen = HashSet::new();
        for key in keys {
            for field in &self.unique_fields {
                match (field.get)(entity) {
                    Some(value) => Self::push_deduped(
                        &mut holders,
                        &mut seen,
                        HmacHolder::new(Arc::clone(key), &field.name, Some(value)),
                    ),
                    None => {
                        if !field.optional {
                            debug!(
                                entity = %self.entity,
                                field = %field.name,
                                "required unique field is null; no hash produced"
                            );
                        }
                    }
                }
            }
            'group: for group in &self.groups {
                let mut parts = Vec::with_capacity(group.members.len());
                for member in &group.members {
                    match (member.get)(entity) {
                        Some(value) => parts.push(value),
                        None => {
                            // A null member, optional or not, skips the
                            // whole compound hash.
                            debug!(
                                entity = %self.entity,
                                group = %group.name,
                                "null member skips the compound hash"
                            );
                            continue 'group;
                        }
                    }
                }
                let mut compound = String::new();
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        compound.push(GROUP_SEPARATOR);
                    }
                    compound.push_str(part);
                }
                Self::push_deduped(
                    &mut holders,
                    &mut seen,
                    HmacHolder::new(Arc::clone(key), &group.name, Some(compound)),
                );
            }
        }
        holders
    }

    fn push_deduped(
        holders: &mut Vec<HmacHolder>,
        seen: &mut HashSet<(String, String, String)>,
        holder: HmacHolder,
    ) {
        let Some(input) = holder.hash_input() else {
            return;
        };
        let fingerprint = (holder.key.id.clone(), holder.alias.clone(), input.to_string());
        if seen.insert(fingerprint) {
            holders.push(holder);
        }
    }

    fn merge(
        entity: &mut T,
        binding: &Option<HashListBinding<T>>,
        holders: Vec<HmacHolder>,
        mode: HashMergeMode,
    ) {
        let Some(binding) = binding else {
            return;
        };
        let entries: Vec<HmacEntry> = holders.into_iter().filter_map(HmacHolder::into_entry).collect();
        match mode {
            HashMergeMode::Replace => (binding.set)(entity, entries),
            HashMergeMode::Retain => {
                if entries.is_empty() {
                    return;
                }
                let new_key_ids: HashSet<String> =
                    entries.iter().map(|e| e.key_id.clone()).collect();
                let mut merged: Vec<HmacEntry> = (binding.get)(entity)
                    .into_iter()
                    .filter(|e| !new_key_ids.contains(&e.key_id))
                    .collect();
                merged.extend(entries);
                (binding.set)(entity, merged);
            }
        }
    }
}
