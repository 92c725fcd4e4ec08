//! Per-channel status index
//!
//! One versioned document per channel direction maps every live epoch to its
//! state. `Free` entries sum to the bytes nobody has claimed; a `Reserved`
//! entry is invisible to other claims until its holder releases it or its
//! lease runs out.
//!
//! Stored form: a `Free` slot is a JSON number, a `Reserved` slot a JSON
//! object `{token, fence, bytes, expires_at_ms}`.

use crate::error::{KmeError, Result};
use crate::types::EpochId;
use qkme_store::{Fields, Versioned};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A live reservation over one epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Opaque holder token
    pub token: Uuid,
    /// Status index version the claim was written at
    pub fence: u64,
    /// Free bytes the epoch held when it was claimed
    pub bytes: u64,
    /// Lease expiry, Unix milliseconds
    pub expires_at_ms: i64,
}

impl Reservation {
    /// True once the lease has run out at `now_ms`
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// State of one epoch in the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    /// Unclaimed bytes
    Free(u64),
    /// Held by a claim
    Reserved(Reservation),
}

/// Identifies a claim when releasing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimToken {
    /// Opaque holder token
    pub token: Uuid,
    /// Status index version the claim was written at
    pub fence: u64,
}

impl ClaimToken {
    /// True when `reservation` belongs to this claim
    pub fn holds(&self, reservation: &Reservation) -> bool {
        reservation.token == self.token && reservation.fence == self.fence
    }
}

/// Decoded status index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusIndex {
    slots: BTreeMap<EpochId, SlotState>,
}

impl StatusIndex {
    /// Decode a stored document; an absent document is an empty index
    pub fn from_document(doc: Option<&Versioned>) -> Result<Self> {
        match doc {
            Some(doc) => Self::from_fields(&doc.fields),
            None => Ok(Self::default()),
        }
    }

    /// Decode stored fields
    pub fn from_fields(fields: &Fields) -> Result<Self> {
        let mut slots = BTreeMap::new();
        for (epoch, value) in fields {
            let state = match value {
                Value::Number(n) => SlotState::Free(n.as_u64().ok_or_else(|| {
                    KmeError::internal(format!("status index: bad free count for epoch {epoch}"))
                })?),
                Value::Object(_) => SlotState::Reserved(
                    serde_json::from_value(value.clone()).map_err(|e| {
                        KmeError::internal(format!(
                            "status index: bad reservation for epoch {epoch}: {e}"
                        ))
                    })?,
                ),
                _ => {
                    return Err(KmeError::internal(format!(
                        "status index: unexpected entry for epoch {epoch}"
                    )))
                }
            };
            slots.insert(EpochId::new(epoch.as_str()), state);
        }
        Ok(Self { slots })
    }

    /// Encode for storage
    pub fn to_fields(&self) -> Result<Fields> {
        let mut fields = Fields::new();
        for (epoch, state) in &self.slots {
            let value = match state {
                SlotState::Free(bytes) => Value::from(*bytes),
                SlotState::Reserved(reservation) => serde_json::to_value(reservation)?,
            };
            fields.insert(epoch.to_string(), value);
        }
        Ok(fields)
    }

    /// State of one epoch
    pub fn get(&self, epoch: &EpochId) -> Option<&SlotState> {
        self.slots.get(epoch)
    }

    /// Set the state of one epoch
    pub fn set(&mut self, epoch: EpochId, state: SlotState) {
        self.slots.insert(epoch, state);
    }

    /// Drop an epoch from the index
    pub fn remove(&mut self, epoch: &EpochId) -> Option<SlotState> {
        self.slots.remove(epoch)
    }

    /// Entries in ascending epoch order
    pub fn iter(&self) -> impl Iterator<Item = (&EpochId, &SlotState)> {
        self.slots.iter()
    }

    /// Number of indexed epochs
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no epoch is indexed
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Sum of free bytes
    pub fn free_bytes(&self) -> u64 {
        self.slots
            .values()
            .map(|state| match state {
                SlotState::Free(bytes) => *bytes,
                SlotState::Reserved(_) => 0,
            })
            .sum()
    }

    /// Sum of bytes held by reservations
    pub fn reserved_bytes(&self) -> u64 {
        self.slots
            .values()
            .map(|state| match state {
                SlotState::Free(_) => 0,
                SlotState::Reserved(reservation) => reservation.bytes,
            })
            .sum()
    }

    /// Number of reserved epochs
    pub fn reserved_count(&self) -> usize {
        self.slots
            .values()
            .filter(|state| matches!(state, SlotState::Reserved(_)))
            .count()
    }
}
