//! Transaction control types flowing through `executeQuery` (spec.md
//! section 3, `TransactionHandle`) plus the `AUTO_TX` default.

use crate::pb;

/// Settings for a transaction the server is asked to begin. Only the one
/// isolation level this driver's minimal wire surface exposes is modeled —
/// spec.md's non-goals explicitly exclude transaction isolation beyond what
/// the wire protocol already defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionSettings {
    pub serializable_read_write: bool,
}

impl TransactionSettings {
    pub const fn serializable_read_write() -> Self {
        Self {
            serializable_read_write: true,
        }
    }
}

/// Either an already-open transaction (`Existing`) or a request to begin one
/// as part of `executeQuery` (`New`) — spec.md section 3's
/// `TransactionHandle`.
#[derive(Debug, Clone, PartialEq)]
pub enum TxControl {
    Existing { tx_id: String },
    New {
        settings: TransactionSettings,
        commit: bool,
    },
}

/// `{begin: serializableReadWrite, commit: true}` — the default used by
/// `executeQuery` when the caller supplies no explicit `TxControl`.
/// Re-exposed inside the session namespace per the design notes (spec.md
/// section 9).
pub const AUTO_TX: TxControl = TxControl::New {
    settings: TransactionSettings::serializable_read_write(),
    commit: true,
};

impl TxControl {
    pub fn existing(tx_id: impl Into<String>) -> Self {
        TxControl::Existing {
            tx_id: tx_id.into(),
        }
    }

    pub(crate) fn into_wire(self) -> pb::TransactionControl {
        match self {
            TxControl::Existing { tx_id } => pb::TransactionControl {
                tx_selector: Some(pb::transaction_control::TxSelector::TxId(tx_id)),
                commit_tx: false,
            },
            TxControl::New { settings, commit } => pb::TransactionControl {
                tx_selector: Some(pb::transaction_control::TxSelector::BeginTx(
                    pb::TransactionSettings {
                        serializable_read_write: settings.serializable_read_write,
                    },
                )),
                commit_tx: commit,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_tx_is_serializable_read_write_and_commits() {
        match AUTO_TX {
            TxControl::New { settings, commit } => {
                assert!(settings.serializable_read_write);
                assert!(commit);
            }
            TxControl::Existing { .. } => panic!("AUTO_TX must begin a new transaction"),
        }
    }
}
