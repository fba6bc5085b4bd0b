//! Classification rules enforced at registration time.

mod common;

use chrono::{Duration, Utc};

use common::{person_descriptor, Person};
use fieldvault::errors::FieldVaultError;
use fieldvault::registry::{EntityDescriptor, EntityFieldRegistry, FieldDescriptor};
use fieldvault::search::{HmacEntry, HmacStrategyKind};

#[derive(Default)]
struct Doc {
    secret: Option<String>,
    note: Option<String>,
    blob: Option<String>,
    key: Option<String>,
    hashes: Vec<HmacEntry>,
}

fn encrypted_secret() -> FieldDescriptor<Doc> {
    FieldDescriptor::encrypted("secret", |d: &Doc| d.secret.clone(), |d, v| d.secret = v)
}

fn blob_field() -> FieldDescriptor<Doc> {
    FieldDescriptor::blob("blob", |d: &Doc| d.blob.clone(), |d, v| d.blob = v)
}

fn key_id_field() -> FieldDescriptor<Doc> {
    FieldDescriptor::key_id("key", |d: &Doc| d.key.clone(), |d, v| d.key = v)
}

fn assert_classification(result: fieldvault::errors::Result<()>) {
    assert!(
        matches!(result, Err(FieldVaultError::Classification { .. })),
        "expected a classification error, got {result:?}"
    );
}

#[test]
fn valid_descriptor_registers_once() {
    let registry = EntityFieldRegistry::new();
    registry.register(person_descriptor()).unwrap();
    assert!(registry.is_registered::<Person>());
    assert!(matches!(
        registry.register(person_descriptor()),
        Err(FieldVaultError::AlreadyRegistered(_))
    ));
}

#[test]
fn encrypted_field_without_blob_is_rejected() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc")
        .field(encrypted_secret())
        .field(key_id_field());
    assert_classification(registry.register(descriptor));
}

#[test]
fn blob_without_encrypted_fields_is_rejected() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc").field(blob_field());
    assert_classification(registry.register(descriptor));
}

#[test]
fn two_blob_fields_are_rejected() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc")
        .field(encrypted_secret())
        .field(blob_field())
        .field(FieldDescriptor::blob(
            "blob2",
            |d: &Doc| d.note.clone(),
            |d, v| d.note = v,
        ));
    assert_classification(registry.register(descriptor));
}

#[test]
fn two_key_id_fields_are_rejected() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc")
        .field(encrypted_secret())
        .field(blob_field())
        .field(key_id_field())
        .field(FieldDescriptor::key_id(
            "key2",
            |d: &Doc| d.note.clone(),
            |d, v| d.note = v,
        ));
    assert_classification(registry.register(descriptor));
}

#[test]
fn duplicate_field_names_are_rejected() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc")
        .field(encrypted_secret())
        .field(FieldDescriptor::encrypted(
            "secret",
            |d: &Doc| d.note.clone(),
            |d, v| d.note = v,
        ))
        .field(blob_field());
    assert_classification(registry.register(descriptor));
}

#[test]
fn persisted_encrypted_field_requires_a_waiver() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc")
        .field(encrypted_secret().persisted())
        .field(blob_field());
    assert_classification(registry.register(descriptor));
}

#[test]
fn waivered_persisted_field_registers() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc")
        .field(
            encrypted_secret()
                .persisted()
                .migration_waiver("column drop tracked in OPS-1443", Utc::now() + Duration::days(30)),
        )
        .field(blob_field());
    registry.register(descriptor).unwrap();
}

#[test]
fn expired_waiver_still_registers() {
    // Past the completion date the waiver is loudly logged, not fatal.
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc")
        .field(
            encrypted_secret()
                .persisted()
                .migration_waiver("overdue migration", Utc::now() - Duration::days(1)),
        )
        .field(blob_field());
    registry.register(descriptor).unwrap();
}

#[test]
fn hmac_fields_require_a_strategy() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc")
        .field(FieldDescriptor::hmac("note", |d: &Doc| d.note.clone()).lookup(vec![]))
        .lookup_hashes(|d: &Doc| d.hashes.clone(), |d, h| d.hashes = h);
    assert_classification(registry.register(descriptor));
}

#[test]
fn strategy_without_hmac_fields_is_rejected() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc")
        .field(encrypted_secret())
        .field(blob_field())
        .hmac_strategy(HmacStrategyKind::Searchable);
    assert_classification(registry.register(descriptor));
}

#[test]
fn bound_hash_list_without_hmac_fields_is_rejected() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc")
        .field(encrypted_secret())
        .field(blob_field())
        .lookup_hashes(|d: &Doc| d.hashes.clone(), |d, h| d.hashes = h);
    assert_classification(registry.register(descriptor));
}

#[test]
fn hmac_field_without_purpose_or_group_is_rejected() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc")
        .field(FieldDescriptor::hmac("note", |d: &Doc| d.note.clone()))
        .hmac_strategy(HmacStrategyKind::Searchable);
    assert_classification(registry.register(descriptor));
}

#[test]
fn lookup_purpose_requires_the_lookup_binding() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc")
        .field(FieldDescriptor::hmac("note", |d: &Doc| d.note.clone()).lookup(vec![]))
        .hmac_strategy(HmacStrategyKind::Searchable);
    assert_classification(registry.register(descriptor));
}

#[test]
fn unique_binding_without_unique_fields_is_rejected() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc")
        .field(FieldDescriptor::hmac("note", |d: &Doc| d.note.clone()).lookup(vec![]))
        .lookup_hashes(|d: &Doc| d.hashes.clone(), |d, h| d.hashes = h)
        .unique_hashes(|d: &Doc| d.hashes.clone(), |d, h| d.hashes = h)
        .hmac_strategy(HmacStrategyKind::Searchable);
    assert_classification(registry.register(descriptor));
}

#[test]
fn group_orders_with_a_gap_are_rejected() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc")
        .field(FieldDescriptor::hmac("secret", |d: &Doc| d.secret.clone()).in_group("pair", 1))
        .field(FieldDescriptor::hmac("note", |d: &Doc| d.note.clone()).in_group("pair", 3))
        .unique_hashes(|d: &Doc| d.hashes.clone(), |d, h| d.hashes = h)
        .hmac_strategy(HmacStrategyKind::Searchable);
    assert_classification(registry.register(descriptor));
}

#[test]
fn duplicate_group_orders_are_rejected() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Doc")
        .field(FieldDescriptor::hmac("secret", |d: &Doc| d.secret.clone()).in_group("pair", 1))
        .field(FieldDescriptor::hmac("note", |d: &Doc| d.note.clone()).in_group("pair", 1))
        .unique_hashes(|d: &Doc| d.hashes.clone(), |d, h| d.hashes = h)
        .hmac_strategy(HmacStrategyKind::Searchable);
    assert_classification(registry.register(descriptor));
}

#[test]
fn failed_registration_leaves_the_registry_unchanged() {
    let registry = EntityFieldRegistry::new();
    let bad = EntityDescriptor::<Doc>::new("Doc").field(encrypted_secret());
    assert!(registry.register(bad).is_err());
    assert!(!registry.is_registered::<Doc>());

    let good = EntityDescriptor::new("Doc")
        .field(encrypted_secret())
        .field(blob_field());
    registry.register(good).unwrap();
    assert!(registry.is_registered::<Doc>());
}

// ── Cascade rules ────────────────────────────────────────────────────

#[derive(Default)]
struct Leaf {
    value: Option<String>,
    blob: Option<String>,
}

#[derive(Default)]
struct Branch {
    leaf: Option<Leaf>,
}

#[derive(Default)]
struct Bare {
    key: Option<String>,
}

fn leaf_descriptor() -> EntityDescriptor<Leaf> {
    EntityDescriptor::new("Leaf")
        .field(FieldDescriptor::encrypted(
            "value",
            |l: &Leaf| l.value.clone(),
            |l, v| l.value = v,
        ))
        .field(FieldDescriptor::blob(
            "blob",
            |l: &Leaf| l.blob.clone(),
            |l, v| l.blob = v,
        ))
}

fn branch_descriptor() -> EntityDescriptor<Branch> {
    EntityDescriptor::new("Branch").field(FieldDescriptor::cascade::<Leaf>(
        "leaf",
        |b: &mut Branch, visit| match b.leaf.as_mut() {
            Some(leaf) => visit(leaf),
            None => Ok(()),
        },
    ))
}

#[test]
fn cascade_target_must_be_registered_first() {
    let registry = EntityFieldRegistry::new();
    assert!(matches!(
        registry.register(branch_descriptor()),
        Err(FieldVaultError::NotRegistered(_))
    ));

    registry.register(leaf_descriptor()).unwrap();
    registry.register(branch_descriptor()).unwrap();
}

#[test]
fn self_cascade_is_a_cycle() {
    let registry = EntityFieldRegistry::new();
    let descriptor = EntityDescriptor::new("Branch").field(FieldDescriptor::cascade::<Branch>(
        "leaf",
        |_: &mut Branch, _| Ok(()),
    ));
    assert!(matches!(
        registry.register(descriptor),
        Err(FieldVaultError::CascadeCycle(_))
    ));
}

#[test]
fn cascade_into_an_unprotected_type_is_rejected() {
    let registry = EntityFieldRegistry::new();
    registry
        .register(
            EntityDescriptor::new("Bare").field(FieldDescriptor::key_id(
                "key",
                |b: &Bare| b.key.clone(),
                |b, v| b.key = v,
            )),
        )
        .unwrap();

    let descriptor = EntityDescriptor::new("Branch").field(FieldDescriptor::cascade::<Bare>(
        "leaf",
        |_: &mut Branch, _| Ok(()),
    ));
    assert_classification(registry.register(descriptor));
}

// ── Classification accessors ─────────────────────────────────────────

#[test]
fn accessors_reflect_the_classification() {
    let registry = EntityFieldRegistry::new();
    registry.register(person_descriptor()).unwrap();

    assert_eq!(registry.fields_to_encrypt::<Person>().unwrap(), vec!["ssn"]);

    let mut confidential = registry.confidential_fields::<Person>().unwrap();
    confidential.sort();
    assert_eq!(
        confidential,
        vec!["email", "first_name", "last_name", "phone", "ssn"]
    );

    assert_eq!(
        registry.blob_field::<Person>().unwrap().as_deref(),
        Some("protected")
    );
    assert_eq!(
        registry.key_id_field::<Person>().unwrap().as_deref(),
        Some("crypto_key_id")
    );
    assert!(registry.has_hmac_strategy::<Person>().unwrap());
    assert!(registry.cascade_fields::<Person>().unwrap().is_empty());
}

#[test]
fn unregistered_type_queries_fail() {
    let registry = EntityFieldRegistry::new();
    assert!(matches!(
        registry.fields_to_encrypt::<Doc>(),
        Err(FieldVaultError::NotRegistered(_))
    ));
}
