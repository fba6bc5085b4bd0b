//! Collaborator contracts for rotation, and the typed-to-erased bridge the
//! scheduler drives entity batches through.

use std::sync::Arc;

use tracing::warn;

use crate::errors::Result;
use crate::keys::CryptoKey;
use crate::protect::EntityProtector;
use crate::rekey::overlay::KeyOverlay;
use crate::rekey::tracker::{ProgressTracker, RekeyOutcome};

/// Persistence boundary for one rekeyable entity type.
///
/// Implementations own the storage queries; this crate only defines what it
/// asks for. Both finders are expected to return at most `limit` records and
/// an empty vector once nothing qualifies.
pub trait RekeyService<T>: Send + Sync {
    /// Stable name of the entity type, for logs and notifications.
    fn entity_type(&self) -> &str;

    /// Records of `key`'s tenant whose protection does not yet use `key`.
    /// Candidate source for KEY_ON passes.
    fn find_records_not_using_crypto_key(&self, key: &CryptoKey, limit: usize) -> Result<Vec<T>>;

    /// Records still protected under `key`. Candidate source for KEY_OFF
    /// passes and the zero-reference check before deletion.
    fn find_records_using_crypto_key(&self, key: &CryptoKey, limit: usize) -> Result<Vec<T>>;

    /// Persist one re-protected batch. Atomicity is the implementation's
    /// concern; a failure here counts as one rekey failure.
    fn save(&self, records: Vec<T>) -> Result<()>;

    /// Final counts for the tenant once its run completes or aborts.
    fn notify(&self, tenant_id: &str, outcome: &RekeyOutcome) -> Result<()>;

    /// Drop persisted hash entries computed under keys outside `surviving`.
    fn purge_redundant_hmacs(&self, tenant_id: &str, surviving_key_ids: &[String]) -> Result<()>;
}

/// Key lifecycle authority; the scheduler only ever asks it to delete.
pub trait RekeyCryptoKeyManager: Send + Sync {
    fn delete_key(&self, key_id: &str) -> Result<()>;
}

/// Which records a pass targets.
pub(crate) enum BatchQuery<'a> {
    /// Records not yet on the key (KEY_ON promotion).
    NotUsing(&'a CryptoKey),
    /// Records still on the key (KEY_OFF retirement).
    Using(&'a CryptoKey),
}

impl BatchQuery<'_> {
    pub(crate) fn key(&self) -> &CryptoKey {
        match self {
            BatchQuery::NotUsing(key) | BatchQuery::Using(key) => key,
        }
    }
}

pub(crate) struct BatchOutcome {
    pub(crate) fetched: usize,
    pub(crate) saved: usize,
}

/// One entity type as the scheduler sees it, with the record type erased.
pub(crate) trait RekeyTargetOps: Send + Sync {
    fn entity_type(&self) -> &str;

    /// Fetch one batch, decrypt-then-reprotect each record under the
    /// overlay, save the survivors, and record progress. A record that
    /// cannot reach the target key set counts as a failure and is not
    /// saved. `fetched == 0` means the pass is complete for this target.
    fn process_batch(
        &self,
        tenant_id: &str,
        query: &BatchQuery<'_>,
        overlay: &KeyOverlay,
        batch_size: usize,
        tracker: &ProgressTracker,
    ) -> Result<BatchOutcome>;

    fn has_records_using(&self, key: &CryptoKey) -> Result<bool>;

    fn notify(&self, tenant_id: &str, outcome: &RekeyOutcome) -> Result<()>;

    fn purge_redundant_hmacs(&self, tenant_id: &str, surviving_key_ids: &[String]) -> Result<()>;
}

/// Binds a typed `RekeyService` to the protector.
pub(crate) struct TypedRekeyTarget<T: 'static> {
    service: Arc<dyn RekeyService<T>>,
    protector: Arc<EntityProtector>,
}

impl<T: 'static> TypedRekeyTarget<T> {
    pub(crate) fn new(service: Arc<dyn RekeyService<T>>, protector: Arc<EntityProtector>) -> Self {
        Self { service, protector }
    }
}

impl<T: 'static> RekeyTargetOps for TypedRekeyTarget<T> {
    fn entity_type(&self) -> &str {
        self.service.entity_type()
    }

    fn process_batch(
        &self,
        tenant_id: &str,
        query: &BatchQuery<'_>,
        overlay: &KeyOverlay,
        batch_size: usize,
        tracker: &ProgressTracker,
    ) -> Result<BatchOutcome> {
        let key = query.key();
        let records = match query {
            BatchQuery::NotUsing(key) => self
                .service
                .find_records_not_using_crypto_key(key, batch_size)?,
            BatchQuery::Using(key) => self.service.find_records_using_crypto_key(key, batch_size)?,
        };
        let fetched = records.len();
        if fetched == 0 {
            return Ok(BatchOutcome { fetched: 0, saved: 0 });
        }

        let mut survivors = Vec::with_capacity(fetched);
        let mut failed = 0u64;
        for mut record in records {
            let reprotect = self
                .protector
                .restore(&mut record)
                .and_then(|()| self.protector.protect_with(tenant_id, &mut record, Some(overlay)));
            match reprotect {
                // A record that still does not match the target key set
                // would requalify for the same query next batch; saving it
                // unchanged keeps the pass from ever draining.
                Ok(()) => {
                    let rekeyed = match query {
                        BatchQuery::NotUsing(key) => self.protector.uses_key(&record, key)?,
                        BatchQuery::Using(key) => !self.protector.uses_key(&record, key)?,
                    };
                    if rekeyed {
                        survivors.push(record);
                    } else {
                        failed += 1;
                        warn!(
                            entity = self.entity_type(),
                            tenant = tenant_id,
                            key = %key.id,
                            "record cannot take the target key set; skipping"
                        );
                    }
                }
                Err(e) => {
                    failed += 1;
                    warn!(
                        entity = self.entity_type(),
                        tenant = tenant_id,
                        key = %key.id,
                        "record reprotect failed: {e}"
                    );
                }
            }
        }

        let mut saved = 0;
        if !survivors.is_empty() {
            let count = survivors.len();
            match self.service.save(survivors) {
                Ok(()) => saved = count,
                Err(e) => {
                    // One failure for the whole batch, not one per record.
                    failed += 1;
                    warn!(
                        entity = self.entity_type(),
                        tenant = tenant_id,
                        "batch save failed: {e}"
                    );
                }
            }
        }

        tracker.record_batch(tenant_id, &key.id, saved as u64, failed);
        Ok(BatchOutcome { fetched, saved })
    }

    fn has_records_using(&self, key: &CryptoKey) -> Result<bool> {
        Ok(!self.service.find_records_using_crypto_key(key, 1)?.is_empty())
    }

    fn notify(&self, tenant_id: &str, outcome: &RekeyOutcome) -> Result<()> {
        self.service.notify(tenant_id, outcome)
    }

    fn purge_redundant_hmacs(&self, tenant_id: &str, surviving_key_ids: &[String]) -> Result<()> {
        self.service.purge_redundant_hmacs(tenant_id, surviving_key_ids)
    }
}
