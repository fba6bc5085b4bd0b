//! Shared fixtures: test entities, descriptor builders, key builders, and
//! in-memory rekey collaborators.
#![allow(dead_code)]

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration, Utc};
use parking_lot::Mutex;

use fieldvault::envelope::{EnvelopeEncryptionService, LocalEncryptionService};
use fieldvault::errors::Result;
use fieldvault::keys::{
    CryptoKey, CryptoKeyProvider, InMemoryCryptoKeyProvider, KeyConfiguration, KeyUsage, RekeyMode,
};
use fieldvault::protect::EntityProtector;
use fieldvault::registry::{EntityDescriptor, EntityFieldRegistry, FieldDescriptor};
use fieldvault::rekey::{RekeyCryptoKeyManager, RekeyOutcome, RekeyService};
use fieldvault::search::{HmacEntry, HmacStrategyKind, TokenizerKind};

/// The workhorse test entity: one encrypted field, lookup HMACs with and
/// without tokenizers, and a compound unique group.
#[derive(Debug, Clone, Default)]
pub struct Person {
    pub id: String,
    pub ssn: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub protected: Option<String>,
    pub crypto_key_id: Option<String>,
    pub lookup_hashes: Vec<HmacEntry>,
    pub unique_hashes: Vec<HmacEntry>,
}

impl Person {
    pub fn sample(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ssn: Some("078-05-1120".to_string()),
            email: Some(format!("{id}@example.com")),
            phone: Some("+1 (555) 010-3456".to_string()),
            first_name: Some("Ada".to_string()),
            last_name: Some("Lovelace".to_string()),
            ..Self::default()
        }
    }
}

pub fn person_descriptor() -> EntityDescriptor<Person> {
    EntityDescriptor::new("Person")
        .field(FieldDescriptor::encrypted(
            "ssn",
            |p: &Person| p.ssn.clone(),
            |p, v| p.ssn = v,
        ))
        .field(FieldDescriptor::hmac("email", |p: &Person| p.email.clone()).lookup(vec![]))
        .field(
            FieldDescriptor::hmac("phone", |p: &Person| p.phone.clone())
                .lookup(vec![TokenizerKind::DigitsOnly, TokenizerKind::LastFour]),
        )
        .field(
            FieldDescriptor::hmac("first_name", |p: &Person| p.first_name.clone())
                .in_group("full_name", 1),
        )
        .field(
            FieldDescriptor::hmac("last_name", |p: &Person| p.last_name.clone())
                .in_group("full_name", 2),
        )
        .field(FieldDescriptor::blob(
            "protected",
            |p: &Person| p.protected.clone(),
            |p, v| p.protected = v,
        ))
        .field(FieldDescriptor::key_id(
            "crypto_key_id",
            |p: &Person| p.crypto_key_id.clone(),
            |p, v| p.crypto_key_id = v,
        ))
        .lookup_hashes(
            |p: &Person| p.lookup_hashes.clone(),
            |p, entries| p.lookup_hashes = entries,
        )
        .unique_hashes(
            |p: &Person| p.unique_hashes.clone(),
            |p, entries| p.unique_hashes = entries,
        )
        .hmac_strategy(HmacStrategyKind::Searchable)
}

/// Deterministic 32-byte key material derived from the key id.
pub fn material_for(id: &str) -> String {
    let seed = id.bytes().fold(7u8, u8::wrapping_add);
    BASE64.encode([seed; 32])
}

pub fn key(
    id: &str,
    tenant: &str,
    usage: KeyUsage,
    age_secs: i64,
    rekey_mode: Option<RekeyMode>,
) -> CryptoKey {
    CryptoKey {
        id: id.to_string(),
        key_type: "AES".to_string(),
        usage,
        configuration: KeyConfiguration {
            key_material: Some(material_for(id)),
            ..KeyConfiguration::default()
        },
        key_start_time: None,
        tenant_id: tenant.to_string(),
        rekey_mode,
        created_date: Some(Utc::now() - Duration::seconds(age_secs)),
    }
}

pub fn encryption_key(id: &str, tenant: &str, age_secs: i64) -> CryptoKey {
    key(id, tenant, KeyUsage::Encryption, age_secs, None)
}

pub fn hmac_key(id: &str, tenant: &str, age_secs: i64) -> CryptoKey {
    key(id, tenant, KeyUsage::Hmac, age_secs, None)
}

/// Registry + provider + plain envelope service wired into one protector.
pub struct TestRuntime {
    pub registry: Arc<EntityFieldRegistry>,
    pub provider: Arc<InMemoryCryptoKeyProvider>,
    pub protector: Arc<EntityProtector>,
}

/// Route log output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn runtime_with(register: impl FnOnce(&EntityFieldRegistry)) -> TestRuntime {
    init_tracing();
    let registry = Arc::new(EntityFieldRegistry::new());
    register(&registry);
    let provider = Arc::new(InMemoryCryptoKeyProvider::new());
    let base = Arc::new(LocalEncryptionService::new(
        Arc::clone(&provider) as Arc<dyn CryptoKeyProvider>
    ));
    let envelope = Arc::new(EnvelopeEncryptionService::new(base));
    let protector = Arc::new(EntityProtector::new(
        Arc::clone(&registry),
        Arc::clone(&provider) as Arc<dyn CryptoKeyProvider>,
        envelope,
    ));
    TestRuntime {
        registry,
        provider,
        protector,
    }
}

pub fn person_runtime() -> TestRuntime {
    runtime_with(|registry| {
        registry
            .register(person_descriptor())
            .expect("person registration failed")
    })
}

/// Map-backed persistence for rekey tests. Finders inspect the persisted
/// protection state the same way a real store would query its columns.
pub struct InMemoryPersonStore {
    records: Mutex<Vec<Person>>,
    pub notifications: Mutex<Vec<(String, RekeyOutcome)>>,
    pub purges: Mutex<Vec<(String, Vec<String>)>>,
    pub fail_saves: Mutex<bool>,
}

impl InMemoryPersonStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            purges: Mutex::new(Vec::new()),
            fail_saves: Mutex::new(false),
        }
    }

    pub fn insert(&self, person: Person) {
        self.records.lock().push(person);
    }

    pub fn all(&self) -> Vec<Person> {
        self.records.lock().clone()
    }

    /// Records belong to the tenant encoded in their id (`{tenant}-p{i}`),
    /// mirroring the tenant column a real store would filter on.
    fn in_tenant(person: &Person, key: &CryptoKey) -> bool {
        person.id.starts_with(&format!("{}-", key.tenant_id))
    }

    fn uses_key(person: &Person, key: &CryptoKey) -> bool {
        match key.usage {
            KeyUsage::Encryption => person.crypto_key_id.as_deref() == Some(key.id.as_str()),
            KeyUsage::Hmac => person
                .lookup_hashes
                .iter()
                .chain(person.unique_hashes.iter())
                .any(|e| e.key_id == key.id),
        }
    }
}

impl RekeyService<Person> for InMemoryPersonStore {
    fn entity_type(&self) -> &str {
        "Person"
    }

    fn find_records_not_using_crypto_key(
        &self,
        key: &CryptoKey,
        limit: usize,
    ) -> Result<Vec<Person>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|p| Self::in_tenant(p, key) && !Self::uses_key(p, key))
            .take(limit)
            .cloned()
            .collect())
    }

    fn find_records_using_crypto_key(&self, key: &CryptoKey, limit: usize) -> Result<Vec<Person>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|p| Self::in_tenant(p, key) && Self::uses_key(p, key))
            .take(limit)
            .cloned()
            .collect())
    }

    fn save(&self, records: Vec<Person>) -> Result<()> {
        if *self.fail_saves.lock() {
            return Err(fieldvault::errors::FieldVaultError::PersistenceError(
                "simulated save failure".to_string(),
            ));
        }
        let mut store = self.records.lock();
        for record in records {
            match store.iter_mut().find(|p| p.id == record.id) {
                Some(existing) => *existing = record,
                None => store.push(record),
            }
        }
        Ok(())
    }

    fn notify(&self, tenant_id: &str, outcome: &RekeyOutcome) -> Result<()> {
        self.notifications
            .lock()
            .push((tenant_id.to_string(), *outcome));
        Ok(())
    }

    fn purge_redundant_hmacs(&self, tenant_id: &str, surviving_key_ids: &[String]) -> Result<()> {
        self.purges
            .lock()
            .push((tenant_id.to_string(), surviving_key_ids.to_vec()));
        for person in self.records.lock().iter_mut() {
            person
                .lookup_hashes
                .retain(|e| surviving_key_ids.contains(&e.key_id));
            person
                .unique_hashes
                .retain(|e| surviving_key_ids.contains(&e.key_id));
        }
        Ok(())
    }
}

/// Deletes keys straight out of the in-memory provider.
pub struct InMemoryKeyManager {
    provider: Arc<InMemoryCryptoKeyProvider>,
    pub deleted: Mutex<Vec<String>>,
}

impl InMemoryKeyManager {
    pub fn new(provider: Arc<InMemoryCryptoKeyProvider>) -> Self {
        Self {
            provider,
            deleted: Mutex::new(Vec::new()),
        }
    }
}

impl RekeyCryptoKeyManager for InMemoryKeyManager {
    fn delete_key(&self, key_id: &str) -> Result<()> {
        self.provider.remove(key_id);
        self.deleted.lock().push(key_id.to_string());
        Ok(())
    }
}
