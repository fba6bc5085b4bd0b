//! The rotation state machine.
//!
//! One scheduled pass walks every tenant's keys, decides the rekey
//! direction per key usage, and drives batch rekeys through the registered
//! targets under a forced-key overlay. Failures are counted per tenant and
//! abort only that tenant's run; key deletion afterwards is best-effort and
//! retried on the next pass.
//!
//! The cache-coherence window is the safety core: no rotation acts on a key
//! younger than `now − window`, because a concurrent application instance
//! could still be writing under the key set it cached before the change.

use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RekeySettings;
use crate::errors::{FieldVaultError, Result};
use crate::keys::{CryptoKey, CryptoKeyProvider, KeyUsage};
use crate::protect::EntityProtector;
use crate::rekey::overlay::KeyOverlay;
use crate::rekey::service::{
    BatchQuery, RekeyCryptoKeyManager, RekeyService, RekeyTargetOps, TypedRekeyTarget,
};
use crate::rekey::tracker::ProgressTracker;
use crate::sync::ShutdownLatch;

/// Orchestrates key rotation across tenants and entity types.
pub struct RekeyScheduler {
    provider: Arc<dyn CryptoKeyProvider>,
    key_manager: Arc<dyn RekeyCryptoKeyManager>,
    targets: Vec<Arc<dyn RekeyTargetOps>>,
    settings: RekeySettings,
    latch: Arc<ShutdownLatch>,
}

/// Stops the background loop; dropping it stops the loop too.
pub struct RekeySchedulerHandle {
    latch: Arc<ShutdownLatch>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RekeySchedulerHandle {
    /// Interrupt the schedule wait and any inter-batch sleep, then join.
    /// Idempotent.
    pub fn stop(&self) {
        self.latch.trip();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RekeySchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl RekeyScheduler {
    pub fn new(
        provider: Arc<dyn CryptoKeyProvider>,
        key_manager: Arc<dyn RekeyCryptoKeyManager>,
        settings: RekeySettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            provider,
            key_manager,
            targets: Vec::new(),
            settings,
            latch: Arc::new(ShutdownLatch::new()),
        })
    }

    /// Add one rekeyable entity type. Register every target before
    /// `start()`.
    pub fn register_target<T: 'static>(
        &mut self,
        service: Arc<dyn RekeyService<T>>,
        protector: Arc<EntityProtector>,
    ) {
        self.targets
            .push(Arc::new(TypedRekeyTarget::new(service, protector)));
    }

    /// Spawn the background loop: initial delay, then one `run_once` per
    /// check interval until the handle stops it.
    pub fn start(self: Arc<Self>) -> RekeySchedulerHandle {
        let latch = Arc::clone(&self.latch);
        let thread = std::thread::spawn(move || {
            if !self.latch.wait_for(self.settings.initial_delay()) {
                return;
            }
            loop {
                self.run_once();
                if !self.latch.wait_for(self.settings.check_interval()) {
                    break;
                }
            }
        });
        RekeySchedulerHandle {
            latch,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// One full pass over every tenant. Public so operators and tests can
    /// drive a deterministic run.
    pub fn run_once(&self) {
        let keys = match self.provider.get_all_crypto_keys() {
            Ok(keys) => keys,
            Err(e) => {
                error!("rekey pass skipped: key provider unavailable: {e}");
                return;
            }
        };

        let mut by_tenant: std::collections::BTreeMap<String, Vec<CryptoKey>> =
            std::collections::BTreeMap::new();
        for key in keys {
            by_tenant.entry(key.tenant_id.clone()).or_default().push(key);
        }

        for (tenant_id, tenant_keys) in by_tenant {
            if self.latch.is_tripped() {
                break;
            }
            self.run_tenant(&tenant_id, tenant_keys);
        }
    }

    fn run_tenant(&self, tenant_id: &str, keys: Vec<CryptoKey>) {
        if let Some(bad) = keys.iter().find(|k| k.created_date.is_none()) {
            error!(
                tenant = tenant_id,
                key = %bad.id,
                "key has no creation date; skipping tenant for this run"
            );
            return;
        }

        let cutoff = Utc::now() - self.settings.coherence_window();
        let tracker = ProgressTracker::new(self.settings.max_failures);
        let mut deletions: Vec<CryptoKey> = Vec::new();
        let mut surviving_hmac: Option<Vec<String>> = None;

        let run = self
            .run_encryption_half(tenant_id, &keys, cutoff, &tracker, &mut deletions)
            .and_then(|()| {
                self.run_hmac_half(
                    tenant_id,
                    &keys,
                    cutoff,
                    &tracker,
                    &mut deletions,
                    &mut surviving_hmac,
                )
            });

        let aborted = match run {
            Ok(()) => false,
            Err(FieldVaultError::RekeyAborted {
                failures, threshold, ..
            }) => {
                warn!(
                    tenant = tenant_id,
                    failures, threshold, "rekey run aborted for this tenant"
                );
                true
            }
            Err(e) => {
                error!(tenant = tenant_id, "rekey run failed: {e}");
                true
            }
        };

        let outcome = tracker.tenant_outcome(tenant_id);
        if outcome.batches > 0 {
            info!(
                tenant = tenant_id,
                processed = outcome.processed,
                failed = outcome.failed,
                batches = outcome.batches,
                "rekey run finished"
            );
            for target in &self.targets {
                if let Err(e) = target.notify(tenant_id, &outcome) {
                    warn!(
                        tenant = tenant_id,
                        entity = target.entity_type(),
                        "rekey notification failed: {e}"
                    );
                }
            }
        }

        if aborted {
            return;
        }

        if let Some(surviving) = surviving_hmac {
            for target in &self.targets {
                if let Err(e) = target.purge_redundant_hmacs(tenant_id, &surviving) {
                    warn!(
                        tenant = tenant_id,
                        entity = target.entity_type(),
                        "redundant-HMAC purge failed: {e}"
                    );
                }
            }
        }

        for key in deletions {
            self.try_delete(tenant_id, &key);
        }
    }

    fn run_encryption_half(
        &self,
        tenant_id: &str,
        keys: &[CryptoKey],
        cutoff: DateTime<Utc>,
        tracker: &ProgressTracker,
        deletions: &mut Vec<CryptoKey>,
    ) -> Result<()> {
        let encryption: Vec<&CryptoKey> = keys
            .iter()
            .filter(|k| k.usage == KeyUsage::Encryption)
            .collect();
        let Some(current) = encryption.iter().max_by_key(|k| k.created_date).copied() else {
            return Ok(());
        };

        if current.is_key_off() {
            warn!(
                tenant = tenant_id,
                key = %current.id,
                "current encryption key is KEY_OFF; skipping encryption rotation"
            );
            return Ok(());
        }

        if current.is_key_on() {
            if !current.created_at_or_before(cutoff) {
                debug!(
                    tenant = tenant_id,
                    key = %current.id,
                    "KEY_ON encryption key still inside the coherence window"
                );
                return Ok(());
            }
            let overlay = KeyOverlay::for_encryption(Arc::new(current.clone()));
            self.run_pass(tenant_id, &BatchQuery::NotUsing(current), &overlay, tracker)?;
            deletions.extend(
                encryption
                    .iter()
                    .filter(|k| k.id != current.id)
                    .map(|k| (*k).clone()),
            );
            return Ok(());
        }

        for &key in &encryption {
            if key.id == current.id || !key.is_key_off() {
                continue;
            }
            if !key.created_at_or_before(cutoff) {
                debug!(
                    tenant = tenant_id,
                    key = %key.id,
                    "KEY_OFF encryption key still inside the coherence window"
                );
                continue;
            }
            let overlay = KeyOverlay::for_encryption(Arc::new(current.clone()));
            self.run_pass(tenant_id, &BatchQuery::Using(key), &overlay, tracker)?;
            deletions.push(key.clone());
        }
        Ok(())
    }

    fn run_hmac_half(
        &self,
        tenant_id: &str,
        keys: &[CryptoKey],
        cutoff: DateTime<Utc>,
        tracker: &ProgressTracker,
        deletions: &mut Vec<CryptoKey>,
        surviving_hmac: &mut Option<Vec<String>>,
    ) -> Result<()> {
        let hmac: Vec<&CryptoKey> = keys.iter().filter(|k| k.usage == KeyUsage::Hmac).collect();
        if hmac.is_empty() {
            return Ok(());
        }

        // Any fresh HMAC key gates the whole tenant: some instance may not
        // have picked it up yet, and rotating now would strand its hashes.
        if hmac.iter().any(|k| !k.created_at_or_before(cutoff)) {
            debug!(
                tenant = tenant_id,
                "an HMAC key is inside the coherence window; skipping HMAC rotation"
            );
            return Ok(());
        }

        let key_on: Vec<&CryptoKey> = hmac.iter().filter(|k| k.is_key_on()).copied().collect();
        if key_on.len() > 1 {
            warn!(
                tenant = tenant_id,
                "multiple KEY_ON HMAC keys; skipping HMAC rotation"
            );
            return Ok(());
        }

        if let Some(&target) = key_on.first() {
            let overlay = KeyOverlay::for_hmac(vec![Arc::new(target.clone())]);
            self.run_pass(tenant_id, &BatchQuery::NotUsing(target), &overlay, tracker)?;
            deletions.extend(
                hmac.iter()
                    .filter(|k| k.id != target.id)
                    .map(|k| (*k).clone()),
            );
            *surviving_hmac = Some(vec![target.id.clone()]);
            return Ok(());
        }

        let retiring: Vec<&CryptoKey> = hmac.iter().filter(|k| k.is_key_off()).copied().collect();
        if retiring.is_empty() {
            return Ok(());
        }
        let active: Vec<&CryptoKey> = hmac.iter().filter(|k| !k.is_key_off()).copied().collect();
        if active.is_empty() {
            warn!(
                tenant = tenant_id,
                "every HMAC key is KEY_OFF; nothing to rekey onto"
            );
            return Ok(());
        }

        let overlay =
            KeyOverlay::for_hmac(active.iter().map(|k| Arc::new((*k).clone())).collect());
        for &key in &retiring {
            self.run_pass(tenant_id, &BatchQuery::Using(key), &overlay, tracker)?;
            deletions.push(key.clone());
        }
        *surviving_hmac = Some(active.iter().map(|k| k.id.clone()).collect());
        Ok(())
    }

    /// Batch loop for one (key, direction) over every registered target.
    fn run_pass(
        &self,
        tenant_id: &str,
        query: &BatchQuery<'_>,
        overlay: &KeyOverlay,
        tracker: &ProgressTracker,
    ) -> Result<()> {
        let key = query.key();
        info!(tenant = tenant_id, key = %key.id, usage = ?key.usage, "rekey pass starting");

        for target in &self.targets {
            loop {
                if tracker.threshold_exceeded(tenant_id) {
                    return Err(FieldVaultError::RekeyAborted {
                        tenant: tenant_id.to_string(),
                        failures: tracker.tenant_failures(tenant_id),
                        threshold: self.settings.max_failures,
                    });
                }

                let outcome = target.process_batch(
                    tenant_id,
                    query,
                    overlay,
                    self.settings.batch_size,
                    tracker,
                )?;
                if outcome.fetched == 0 {
                    break;
                }
                if outcome.saved == 0 {
                    // Refetching the same records forever helps nobody;
                    // the next scheduled run gets another try.
                    warn!(
                        tenant = tenant_id,
                        entity = target.entity_type(),
                        "batch made no progress; ending pass for this run"
                    );
                    break;
                }

                // Interruption ends the pass early; it is not a failure.
                if !self.latch.wait_for(self.settings.batch_interval()) {
                    info!(tenant = tenant_id, "rekey pass interrupted");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Delete `key` if no registered target still references it. Failures
    /// are logged and retried on the next pass.
    fn try_delete(&self, tenant_id: &str, key: &CryptoKey) {
        for target in &self.targets {
            match target.has_records_using(key) {
                Ok(false) => {}
                Ok(true) => {
                    debug!(
                        tenant = tenant_id,
                        key = %key.id,
                        entity = target.entity_type(),
                        "key still referenced; deferring deletion"
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        tenant = tenant_id,
                        key = %key.id,
                        "reference check failed; deferring deletion: {e}"
                    );
                    return;
                }
            }
        }
        match self.key_manager.delete_key(&key.id) {
            Ok(()) => info!(tenant = tenant_id, key = %key.id, "deleted retired key"),
            Err(e) => warn!(tenant = tenant_id, key = %key.id, "key deletion failed: {e}"),
        }
    }
}
