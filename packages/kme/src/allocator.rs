//! Claim/release protocol over the status index
//!
//! The allocator is an epoch-granularity semaphore built on the store's
//! single-document compare-and-swap. A claim rewrites the chosen epochs as
//! `Reserved` in one CAS write; a release writes the final byte counts back
//! as `Free` (or drops exhausted epochs) after checking the claim still holds
//! every reservation it made.

use crate::config::AllocatorSettings;
use crate::error::{KmeError, Result};
use crate::paths::StorePaths;
use crate::status_index::{ClaimToken, Reservation, SlotState, StatusIndex};
use crate::types::EpochId;
use chrono::Utc;
use log::{debug, error, warn};
use qkme_store::{compare_and_swap_update, CasStep, SecretStore, ABSENT_VERSION};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

/// Epochs chosen by a claim, with the free bytes each held when claimed
pub type ClaimPlan = BTreeMap<EpochId, u64>;

enum Selection<'a> {
    Size(u64),
    Epochs(&'a BTreeSet<EpochId>),
}

struct AllocatorInner {
    store: Arc<dyn SecretStore>,
    paths: StorePaths,
    settings: AllocatorSettings,
}

/// Claims and releases epochs of a channel
#[derive(Clone)]
pub struct Allocator {
    inner: Arc<AllocatorInner>,
}

impl Allocator {
    /// Allocator over `store`
    pub fn new(store: Arc<dyn SecretStore>, paths: StorePaths, settings: AllocatorSettings) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                store,
                paths,
                settings,
            }),
        }
    }

    /// Current status index of `channel`
    pub async fn index(&self, channel: &str) -> Result<StatusIndex> {
        let doc = self.inner.store.get(&self.inner.paths.status(channel)).await?;
        StatusIndex::from_document(doc.as_ref())
    }

    /// Reserve free epochs, in ascending order, until they hold at least
    /// `requested` bytes.
    ///
    /// Fails with [`KmeError::InsufficientMaterial`] when free and reserved
    /// bytes together cannot cover the request. When only reservations held
    /// by others stand in the way, retries with a fixed sleep and finally
    /// fails with [`KmeError::ReservedButUnavailable`].
    pub async fn claim(&self, channel: &str, requested: u64) -> Result<Claim> {
        if requested == 0 {
            return Err(KmeError::invalid("cannot claim zero bytes"));
        }
        self.claim_with(channel, Selection::Size(requested)).await
    }

    /// Reserve exactly `epochs`, as dictated by committed ledger provenance.
    ///
    /// An epoch missing from the index is an internal error. Epochs reserved
    /// by others are waited for with a fixed sleep, bounded in attempts.
    pub async fn claim_epochs(&self, channel: &str, epochs: &BTreeSet<EpochId>) -> Result<Claim> {
        if epochs.is_empty() {
            return Err(KmeError::invalid("cannot claim an empty epoch set"));
        }
        self.claim_with(channel, Selection::Epochs(epochs)).await
    }

    async fn claim_with(&self, channel: &str, selection: Selection<'_>) -> Result<Claim> {
        let settings = &self.inner.settings;
        let attempts = settings.max_reserve_attempts.max(1);

        for attempt in 1..=attempts {
            if let Some((token, plan)) = self.try_claim(channel, &selection).await? {
                debug!(
                    "Claimed {} epoch(s) on {channel} (fence {})",
                    plan.len(),
                    token.fence
                );
                return Ok(Claim::new(self.clone(), channel, token, plan));
            }

            debug!("Epochs on {channel} reserved by others (attempt {attempt}/{attempts})");
            if attempt < attempts {
                tokio::time::sleep(settings.reserve_sleep()).await;
            }
        }

        warn!("Giving up on {channel} after {attempts} contended attempts");
        Err(KmeError::ReservedButUnavailable { attempts })
    }

    async fn try_claim(
        &self,
        channel: &str,
        selection: &Selection<'_>,
    ) -> Result<Option<(ClaimToken, ClaimPlan)>> {
        let path = self.inner.paths.status(channel);
        let ttl_ms = i64::try_from(self.inner.settings.lease_ttl().as_millis()).unwrap_or(i64::MAX);

        let (outcome, _) = compare_and_swap_update::<_, _, KmeError, _>(
            self.inner.store.as_ref(),
            &path,
            self.inner.settings.cas_max_attempts,
            |doc| {
                let mut index = StatusIndex::from_document(doc)?;
                let version = doc.map_or(ABSENT_VERSION, |doc| doc.version);
                let now_ms = Utc::now().timestamp_millis();

                let plan = match selection {
                    Selection::Size(requested) => select_by_size(&index, *requested, now_ms)?,
                    Selection::Epochs(epochs) => select_epochs(&index, epochs, channel, now_ms)?,
                };
                let Some(plan) = plan else {
                    return Ok(CasStep::Keep(None));
                };

                let token = ClaimToken {
                    token: Uuid::new_v4(),
                    fence: version + 1,
                };
                for (epoch, bytes) in &plan {
                    index.set(
                        epoch.clone(),
                        SlotState::Reserved(Reservation {
                            token: token.token,
                            fence: token.fence,
                            bytes: *bytes,
                            expires_at_ms: now_ms.saturating_add(ttl_ms),
                        }),
                    );
                }
                Ok(CasStep::Write(index.to_fields()?, Some((token, plan))))
            },
        )
        .await?;

        Ok(outcome)
    }

    /// Replace every reservation held by `token` with its final count,
    /// dropping epochs whose count is zero
    async fn release_counts(
        &self,
        channel: &str,
        token: ClaimToken,
        counts: &BTreeMap<EpochId, u64>,
    ) -> Result<()> {
        if counts.is_empty() {
            return Ok(());
        }
        let path = self.inner.paths.status(channel);

        compare_and_swap_update::<_, _, KmeError, _>(
            self.inner.store.as_ref(),
            &path,
            self.inner.settings.cas_max_attempts,
            |doc| {
                let mut index = StatusIndex::from_document(doc)?;
                for (epoch, count) in counts {
                    match index.get(epoch) {
                        Some(SlotState::Reserved(reservation)) if token.holds(reservation) => {}
                        Some(SlotState::Reserved(_)) => {
                            return Err(KmeError::internal(format!(
                                "reservation on epoch {epoch} ({channel}) was taken over by another claim"
                            )))
                        }
                        Some(SlotState::Free(_)) | None => {
                            return Err(KmeError::internal(format!(
                                "epoch {epoch} ({channel}) is not reserved by the releasing claim"
                            )))
                        }
                    }
                    if *count == 0 {
                        index.remove(epoch);
                    } else {
                        index.set(epoch.clone(), SlotState::Free(*count));
                    }
                }
                Ok(CasStep::Write(index.to_fields()?, ()))
            },
        )
        .await?;

        debug!("Released {} epoch(s) on {channel} (fence {})", counts.len(), token.fence);
        Ok(())
    }
}

fn available_bytes(state: &SlotState, epoch: &EpochId, now_ms: i64) -> Option<u64> {
    match state {
        SlotState::Free(bytes) => Some(*bytes),
        SlotState::Reserved(reservation) if reservation.is_expired(now_ms) => {
            warn!(
                "Reservation on epoch {epoch} (fence {}) expired; taking it over",
                reservation.fence
            );
            Some(reservation.bytes)
        }
        SlotState::Reserved(_) => None,
    }
}

fn select_by_size(index: &StatusIndex, requested: u64, now_ms: i64) -> Result<Option<ClaimPlan>> {
    let mut plan = ClaimPlan::new();
    let mut total: u64 = 0;
    let mut pending: u64 = 0;

    for (epoch, state) in index.iter() {
        if total >= requested {
            break;
        }
        match available_bytes(state, epoch, now_ms) {
            Some(0) => {}
            Some(bytes) => {
                plan.insert(epoch.clone(), bytes);
                total = total.saturating_add(bytes);
            }
            None => {
                if let SlotState::Reserved(reservation) = state {
                    pending = pending.saturating_add(reservation.bytes);
                }
            }
        }
    }

    if total >= requested {
        Ok(Some(plan))
    } else if total.saturating_add(pending) >= requested {
        Ok(None)
    } else {
        Err(KmeError::InsufficientMaterial {
            available: total,
            requested,
        })
    }
}

fn select_epochs(
    index: &StatusIndex,
    epochs: &BTreeSet<EpochId>,
    channel: &str,
    now_ms: i64,
) -> Result<Option<ClaimPlan>> {
    let mut plan = ClaimPlan::new();
    for epoch in epochs {
        let state = index.get(epoch).ok_or_else(|| {
            KmeError::internal(format!(
                "epoch {epoch} referenced by the ledger is missing from the {channel} status index"
            ))
        })?;
        match available_bytes(state, epoch, now_ms) {
            Some(bytes) => {
                plan.insert(epoch.clone(), bytes);
            }
            None => return Ok(None),
        }
    }
    Ok(Some(plan))
}

/// A held reservation over a set of epochs.
///
/// Release it explicitly with [`Claim::release`]. A claim dropped without
/// release (an error path or a cancelled request) is released on the runtime
/// in the background with the last recorded counts.
pub struct Claim {
    allocator: Allocator,
    channel: String,
    token: ClaimToken,
    plan: ClaimPlan,
    counts: BTreeMap<EpochId, u64>,
    released: bool,
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim")
            .field("channel", &self.channel)
            .field("token", &self.token)
            .field("plan", &self.plan)
            .field("counts", &self.counts)
            .finish()
    }
}

impl Claim {
    fn new(allocator: Allocator, channel: &str, token: ClaimToken, plan: ClaimPlan) -> Self {
        Self {
            allocator,
            channel: channel.to_string(),
            token,
            counts: plan.clone(),
            plan,
            released: false,
        }
    }

    /// Token identifying this claim in the status index
    pub fn token(&self) -> ClaimToken {
        self.token
    }

    /// Channel the claim was made on
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Claimed epochs with the bytes each held when claimed
    pub fn plan(&self) -> &ClaimPlan {
        &self.plan
    }

    /// Total bytes held by the claimed epochs
    pub fn held_bytes(&self) -> u64 {
        self.plan.values().sum()
    }

    /// Record the byte count an epoch will be released with. Call it after
    /// the epoch's new state is durable.
    pub fn set_count(&mut self, epoch: &EpochId, count: u64) -> Result<()> {
        let held = self.plan.get(epoch).copied().ok_or_else(|| {
            KmeError::internal(format!("epoch {epoch} is not part of this claim"))
        })?;
        if count > held {
            return Err(KmeError::internal(format!(
                "epoch {epoch} cannot be released with {count} bytes, it held {held}"
            )));
        }
        self.counts.insert(epoch.clone(), count);
        Ok(())
    }

    /// Lower the held count of each epoch to the bytes actually stored.
    ///
    /// A reservation taken over from an expired lease carries the byte count
    /// its previous holder claimed, which is stale if that holder persisted a
    /// shrunk epoch before it stopped. Returns true when any count changed.
    pub fn reconcile(&mut self, stored: &BTreeMap<EpochId, u64>) -> Result<bool> {
        let mut changed = false;
        for (epoch, held) in self.plan.iter_mut() {
            let actual = stored.get(epoch).copied().ok_or_else(|| {
                KmeError::internal(format!("epoch {epoch} of this claim was not read"))
            })?;
            if actual > *held {
                return Err(KmeError::internal(format!(
                    "epoch {epoch} stores {actual} bytes but the index only knows of {held}"
                )));
            }
            if actual < *held {
                warn!("Epoch {epoch} on {} holds {actual} bytes, index said {held}", self.channel);
                *held = actual;
                self.counts.insert(epoch.clone(), actual);
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Counts the claim would be released with now
    pub fn counts(&self) -> &BTreeMap<EpochId, u64> {
        &self.counts
    }

    /// Release with the recorded counts
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let counts = std::mem::take(&mut self.counts);
        self.allocator
            .release_counts(&self.channel, self.token, &counts)
            .await
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let allocator = self.allocator.clone();
        let channel = std::mem::take(&mut self.channel);
        let counts = std::mem::take(&mut self.counts);
        let token = self.token;
        warn!("Claim on {channel} (fence {}) dropped unreleased; releasing", token.fence);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = allocator.release_counts(&channel, token, &counts).await {
                        error!("Background release on {channel} failed: {e}");
                    }
                });
            }
            Err(_) => error!(
                "No runtime to release claim on {channel}; the lease expires on its own"
            ),
        }
    }
}
