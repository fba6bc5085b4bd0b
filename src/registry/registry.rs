//! Eager classification and validation of entity types.
//!
//! Every rule is enforced at `register` time so runtime protect/restore
//! calls never see an inconsistent type. Registration failures are
//! non-retryable configuration errors surfaced at startup.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{error, warn};

use crate::errors::{FieldVaultError, Result};
use crate::protect::EntityProtector;
use crate::registry::descriptor::{
    short_type_name, Accessor, CascadeWalk, EntityDescriptor, FieldRole, HmacFieldSpec, Mutator,
};
use crate::rekey::KeyOverlay;
use crate::search::strategy::{HmacStrategyKind, SearchableHmacStrategy};

pub(crate) struct EncryptField<T> {
    pub(crate) name: String,
    pub(crate) get: Accessor<T>,
    pub(crate) set: Mutator<T>,
}

pub(crate) struct CascadeField<T> {
    pub(crate) name: String,
    pub(crate) target: TypeId,
    pub(crate) target_name: String,
    pub(crate) walk: CascadeWalk<T>,
}

pub(crate) struct FieldBinding<T> {
    pub(crate) name: String,
    pub(crate) get: Accessor<T>,
    pub(crate) set: Mutator<T>,
}

/// Fully validated classification of one entity type.
pub(crate) struct RegisteredEntity<T> {
    pub(crate) name: String,
    pub(crate) encrypt_fields: Vec<EncryptField<T>>,
    pub(crate) cascade_fields: Vec<CascadeField<T>>,
    pub(crate) blob: Option<FieldBinding<T>>,
    pub(crate) key_id: Option<FieldBinding<T>>,
    pub(crate) strategy: Option<SearchableHmacStrategy<T>>,
    pub(crate) hmac_field_names: Vec<String>,
}

/// Type-erased protect entry point for cascade recursion.
pub(crate) type ErasedProtect = Arc<
    dyn Fn(&mut dyn Any, &EntityProtector, &str, Option<&KeyOverlay>) -> Result<()> + Send + Sync,
>;

/// Type-erased restore entry point for cascade recursion.
pub(crate) type ErasedRestore =
    Arc<dyn Fn(&mut dyn Any, &EntityProtector) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct ErasedEntry {
    pub(crate) protect: ErasedProtect,
    pub(crate) restore: ErasedRestore,
}

#[derive(Default)]
struct RegistryInner {
    typed: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    erased: HashMap<TypeId, ErasedEntry>,
    names: HashMap<TypeId, String>,
    /// Cascade edges: referrer type -> target types.
    cascade_edges: HashMap<TypeId, Vec<TypeId>>,
    /// Whether the type carries anything worth cascading into.
    protected: HashMap<TypeId, bool>,
}

/// A descriptor part every constructor for the field's role supplies; its
/// absence is a misclassification, not a crash.
fn required<V>(entity: &str, field: &str, part: &str, value: Option<V>) -> Result<V> {
    value.ok_or_else(|| {
        FieldVaultError::classification(entity, format!("field '{field}' is missing its {part}"))
    })
}

/// Classifies and validates entity types for field-level protection.
#[derive(Default)]
pub struct EntityFieldRegistry {
    inner: RwLock<RegistryInner>,
}

impl EntityFieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type. All classification rules are checked here;
    /// a violation fails the whole registration and leaves the registry
    /// unchanged.
    pub fn register<T: 'static>(&self, descriptor: EntityDescriptor<T>) -> Result<()> {
        let type_id = TypeId::of::<T>();
        let name = descriptor.name.clone();

        let mut inner = self.inner.write();
        if inner.typed.contains_key(&type_id) {
            return Err(FieldVaultError::AlreadyRegistered(name));
        }

        let entity = Self::validate(&inner, descriptor)?;
        Self::check_cascade_cycles(&inner, type_id, &name, &entity.cascade_fields)?;

        let protected = !entity.encrypt_fields.is_empty()
            || entity.strategy.is_some()
            || !entity.cascade_fields.is_empty();

        let erased = ErasedEntry {
            protect: Arc::new(move |any, protector, tenant, overlay| {
                match any.downcast_mut::<T>() {
                    Some(child) => protector.protect_with(tenant, child, overlay),
                    None => Err(FieldVaultError::classification(
                        short_type_name::<T>(),
                        "cascade walker produced a value of the wrong type",
                    )),
                }
            }),
            restore: Arc::new(move |any, protector| match any.downcast_mut::<T>() {
                Some(child) => protector.restore(child),
                None => Err(FieldVaultError::classification(
                    short_type_name::<T>(),
                    "cascade walker produced a value of the wrong type",
                )),
            }),
        };

        inner
            .cascade_edges
            .insert(type_id, entity.cascade_fields.iter().map(|c| c.target).collect());
        inner.protected.insert(type_id, protected);
        inner.names.insert(type_id, name);
        inner.erased.insert(type_id, erased);
        inner.typed.insert(type_id, Arc::new(Arc::new(entity)));
        Ok(())
    }

    fn validate<T: 'static>(
        inner: &RegistryInner,
        descriptor: EntityDescriptor<T>,
    ) -> Result<RegisteredEntity<T>> {
        let name = descriptor.name;

        let mut seen_names: HashMap<String, FieldRole> = HashMap::new();
        for field in &descriptor.fields {
            if seen_names.insert(field.name.clone(), field.role).is_some() {
                return Err(FieldVaultError::classification(
                    &name,
                    format!("field '{}' is declared more than once", field.name),
                ));
            }
        }

        let mut encrypt_fields = Vec::new();
        let mut cascade_fields = Vec::new();
        let mut hmac_specs: Vec<HmacFieldSpec<T>> = Vec::new();
        let mut blob = None;
        let mut key_id = None;

        for field in descriptor.fields {
            match field.role {
                FieldRole::Encrypt => {
                    if !field.transient {
                        match &field.waiver {
                            None => {
                                return Err(FieldVaultError::classification(
                                    &name,
                                    format!(
                                        "encrypted field '{}' is independently persisted \
                                         without a migration waiver",
                                        field.name
                                    ),
                                ));
                            }
                            Some(waiver) if waiver.complete_by < Utc::now() => {
                                error!(
                                    entity = %name,
                                    field = %field.name,
                                    complete_by = %waiver.complete_by,
                                    justification = %waiver.justification,
                                    "migration waiver is past its completion date"
                                );
                            }
                            Some(waiver) => {
                                warn!(
                                    entity = %name,
                                    field = %field.name,
                                    complete_by = %waiver.complete_by,
                                    "encrypted field persists plaintext under a migration waiver"
                                );
                            }
                        }
                    }
                    let get = required(&name, &field.name, "accessor", field.get)?;
                    let set = required(&name, &field.name, "mutator", field.set)?;
                    encrypt_fields.push(EncryptField {
                        name: field.name,
                        get,
                        set,
                    });
                }
                FieldRole::Hmac => {
                    let get = required(&name, &field.name, "accessor", field.get)?;
                    hmac_specs.push(HmacFieldSpec {
                        name: field.name,
                        get,
                        purposes: field.purposes,
                        group: field.group,
                    });
                }
                FieldRole::Cascade => {
                    let (target, target_name) =
                        required(&name, &field.name, "cascade target", field.cascade_target)?;
                    let walk = required(&name, &field.name, "cascade walker", field.walk)?;
                    cascade_fields.push(CascadeField {
                        name: field.name,
                        target,
                        target_name,
                        walk,
                    });
                }
                FieldRole::Blob => {
                    if blob.is_some() {
                        return Err(FieldVaultError::classification(
                            &name,
                            "more than one ciphertext-blob field declared",
                        ));
                    }
                    let get = required(&name, &field.name, "accessor", field.get)?;
                    let set = required(&name, &field.name, "mutator", field.set)?;
                    blob = Some(FieldBinding {
                        name: field.name,
                        get,
                        set,
                    });
                }
                FieldRole::KeyId => {
                    if key_id.is_some() {
                        return Err(FieldVaultError::classification(
                            &name,
                            "more than one active-key-id field declared",
                        ));
                    }
                    let get = required(&name, &field.name, "accessor", field.get)?;
                    let set = required(&name, &field.name, "mutator", field.set)?;
                    key_id = Some(FieldBinding {
                        name: field.name,
                        get,
                        set,
                    });
                }
            }
        }

        if !encrypt_fields.is_empty() && blob.is_none() {
            return Err(FieldVaultError::classification(
                &name,
                "encrypted fields require exactly one ciphertext-blob field",
            ));
        }
        if encrypt_fields.is_empty() && blob.is_some() {
            return Err(FieldVaultError::classification(
                &name,
                "a ciphertext-blob field without encrypted fields is a misclassification",
            ));
        }

        if !hmac_specs.is_empty() && descriptor.hmac_strategy.is_none() {
            return Err(FieldVaultError::classification(
                &name,
                "fields request HMAC but no HMAC strategy is selected",
            ));
        }
        if hmac_specs.is_empty() {
            if descriptor.hmac_strategy.is_some() {
                return Err(FieldVaultError::classification(
                    &name,
                    "an HMAC strategy is selected but no field requests HMAC",
                ));
            }
            if descriptor.lookup_hashes.is_some() || descriptor.unique_hashes.is_some() {
                return Err(FieldVaultError::classification(
                    &name,
                    "hash lists are bound but no field requests HMAC",
                ));
            }
        }

        let hmac_field_names = hmac_specs.iter().map(|s| s.name.clone()).collect();
        let strategy = match descriptor.hmac_strategy {
            Some(HmacStrategyKind::Searchable) => Some(SearchableHmacStrategy::from_specs(
                &name,
                hmac_specs,
                descriptor.lookup_hashes,
                descriptor.unique_hashes,
            )?),
            None => None,
        };

        for cascade in &cascade_fields {
            if cascade.target == TypeId::of::<T>() {
                return Err(FieldVaultError::CascadeCycle(format!(
                    "'{name}' cascades into itself via field '{}'",
                    cascade.name
                )));
            }
            if !inner.typed.contains_key(&cascade.target) {
                return Err(FieldVaultError::NotRegistered(cascade.target_name.clone()));
            }
            if !inner.protected.get(&cascade.target).copied().unwrap_or(false) {
                return Err(FieldVaultError::classification(
                    &name,
                    format!(
                        "cascade field '{}' targets '{}', which has no encrypt, HMAC, \
                         or cascade fields",
                        cascade.name, cascade.target_name
                    ),
                ));
            }
        }

        Ok(RegisteredEntity {
            name,
            encrypt_fields,
            cascade_fields,
            blob,
            key_id,
            strategy,
            hmac_field_names,
        })
    }

    /// Depth-first walk over the accumulated cascade graph including the
    /// edges the new type would add; any path back to the new type is a
    /// cycle.
    fn check_cascade_cycles<T>(
        inner: &RegistryInner,
        type_id: TypeId,
        name: &str,
        cascades: &[CascadeField<T>],
    ) -> Result<()> {
        let mut visited: std::collections::HashSet<TypeId> = std::collections::HashSet::new();
        let mut stack: Vec<TypeId> = cascades.iter().map(|c| c.target).collect();
        while let Some(current) = stack.pop() {
            if current == type_id {
                return Err(FieldVaultError::CascadeCycle(format!(
                    "cascade graph through '{name}' returns to '{name}'"
                )));
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(targets) = inner.cascade_edges.get(&current) {
                stack.extend(targets.iter().copied());
            }
        }
        Ok(())
    }

    pub(crate) fn entry<T: 'static>(&self) -> Result<Arc<RegisteredEntity<T>>> {
        let inner = self.inner.read();
        inner
            .typed
            .get(&TypeId::of::<T>())
            .and_then(|any| any.downcast_ref::<Arc<RegisteredEntity<T>>>())
            .cloned()
            .ok_or_else(|| FieldVaultError::NotRegistered(short_type_name::<T>().to_string()))
    }

    pub(crate) fn erased(&self, type_id: TypeId) -> Option<ErasedEntry> {
        self.inner.read().erased.get(&type_id).cloned()
    }

    pub fn is_registered<T: 'static>(&self) -> bool {
        self.inner.read().typed.contains_key(&TypeId::of::<T>())
    }

    /// Names of the fields whose plaintext travels inside the blob.
    pub fn fields_to_encrypt<T: 'static>(&self) -> Result<Vec<String>> {
        Ok(self
            .entry::<T>()?
            .encrypt_fields
            .iter()
            .map(|f| f.name.clone())
            .collect())
    }

    /// Union of every confidential field name: encrypted plus HMAC'd.
    pub fn confidential_fields<T: 'static>(&self) -> Result<Vec<String>> {
        let entry = self.entry::<T>()?;
        let mut names: Vec<String> = entry.encrypt_fields.iter().map(|f| f.name.clone()).collect();
        names.extend(entry.hmac_field_names.iter().cloned());
        Ok(names)
    }

    pub fn cascade_fields<T: 'static>(&self) -> Result<Vec<String>> {
        Ok(self
            .entry::<T>()?
            .cascade_fields
            .iter()
            .map(|f| f.name.clone())
            .collect())
    }

    pub fn blob_field<T: 'static>(&self) -> Result<Option<String>> {
        Ok(self.entry::<T>()?.blob.as_ref().map(|b| b.name.clone()))
    }

    pub fn key_id_field<T: 'static>(&self) -> Result<Option<String>> {
        Ok(self.entry::<T>()?.key_id.as_ref().map(|b| b.name.clone()))
    }

    /// Whether the type's classification binds an HMAC strategy.
    pub fn has_hmac_strategy<T: 'static>(&self) -> Result<bool> {
        Ok(self.entry::<T>()?.strategy.is_some())
    }
}
