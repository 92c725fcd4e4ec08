//! Store path layout
//!
//! ```text
//! <qkde_id>/<channel>/status       status index of a channel direction
//! <qkde_id>/<channel>/<epoch_id>   epoch record
//! <qkde_id>/<ledger_id>/<key_id>   ledger entry
//! ```

use crate::config::StoreSettings;
use crate::types::{EpochId, KeyId};

const STATUS_DOCUMENT: &str = "status";

/// Builds store paths for one key distribution endpoint
#[derive(Debug, Clone)]
pub struct StorePaths {
    qkde_id: String,
    ledger_id: String,
}

impl StorePaths {
    /// Paths rooted at `qkde_id`, with ledger entries under `ledger_id`
    pub fn new(qkde_id: impl Into<String>, ledger_id: impl Into<String>) -> Self {
        Self {
            qkde_id: qkde_id.into(),
            ledger_id: ledger_id.into(),
        }
    }

    /// Paths from store settings
    pub fn from_settings(settings: &StoreSettings) -> Self {
        Self::new(&settings.qkde_id, &settings.ledger_id)
    }

    /// Status index of `channel`
    pub fn status(&self, channel: &str) -> String {
        format!("{}/{}/{}", self.qkde_id, channel, STATUS_DOCUMENT)
    }

    /// Epoch record on `channel`
    pub fn epoch(&self, channel: &str, epoch_id: &EpochId) -> String {
        format!("{}/{}/{}", self.qkde_id, channel, epoch_id)
    }

    /// Ledger entry of `key_id`
    pub fn ledger(&self, key_id: &KeyId) -> String {
        format!("{}/{}/{}", self.qkde_id, self.ledger_id, key_id)
    }

    /// True when `name` is reserved and cannot be used as an epoch id
    pub fn is_reserved_name(name: &str) -> bool {
        name == STATUS_DOCUMENT
    }
}
