//! Groups decoded messages into per-transaction [`ChangeBatch`]es.
//!
//! State machine: `Idle -> Open (BEGIN) -> Idle (COMMIT, batch emitted)`.
//! An open transaction survives across poll cycles so a transaction split
//! over several fetches is still applied as one batch.

use tracing::{debug, trace};

use crate::error::OutOfOrderChange;
use crate::postgres::{Change, ChangeBatch, DecodedMessage, Lsn};

#[derive(Debug)]
struct OpenTransaction {
    xid: Option<u32>,
    begin_lsn: Lsn,
    changes: Vec<Change>,
}

#[derive(Debug, Default)]
pub struct TransactionAssembler {
    open: Option<OpenTransaction>,
}

impl TransactionAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Transaction id of the open transaction, if any.
    pub fn open_xid(&self) -> Option<u32> {
        self.open.as_ref().and_then(|t| t.xid)
    }

    /// Drops any partially assembled transaction.
    pub fn reset(&mut self) {
        if let Some(open) = self.open.take() {
            debug!(
                xid = ?open.xid,
                begin_lsn = %open.begin_lsn,
                changes = open.changes.len(),
                "Discarding partially assembled transaction"
            );
        }
    }

    /// Feeds one decoded message, returning the finished batch when it closes
    /// a transaction.
    pub fn push(
        &mut self,
        lsn: Lsn,
        message: DecodedMessage,
    ) -> Result<Option<ChangeBatch>, OutOfOrderChange> {
        match message {
            DecodedMessage::Begin { xid } => {
                if let Some(open) = &self.open {
                    if open.xid.is_none() || open.xid != xid {
                        return Err(OutOfOrderChange {
                            lsn,
                            reason: format!(
                                "BEGIN {:?} while transaction {:?} is still open",
                                xid, open.xid
                            ),
                        });
                    }
                    // The source re-sent a transaction we were holding open;
                    // start it over rather than duplicating its changes.
                    debug!(xid = ?xid, "Transaction redelivered, restarting assembly");
                }
                self.open = Some(OpenTransaction {
                    xid,
                    begin_lsn: lsn,
                    changes: Vec::new(),
                });
                Ok(None)
            }
            DecodedMessage::Change(change) => match &mut self.open {
                Some(open) => {
                    open.changes.push(change);
                    Ok(None)
                }
                None => Err(OutOfOrderChange {
                    lsn,
                    reason: format!("{} outside of a transaction", change),
                }),
            },
            DecodedMessage::Commit { xid, lsn: commit_lsn } => {
                let open = self.open.take().ok_or_else(|| OutOfOrderChange {
                    lsn,
                    reason: format!("COMMIT {:?} without BEGIN", xid),
                })?;
                if let (Some(open_xid), Some(commit_xid)) = (open.xid, xid) {
                    if open_xid != commit_xid {
                        let reason = format!(
                            "COMMIT {} does not match open transaction {}",
                            commit_xid, open_xid
                        );
                        self.open = Some(open);
                        return Err(OutOfOrderChange { lsn, reason });
                    }
                }
                trace!(
                    xid = ?open.xid,
                    commit_lsn = %commit_lsn,
                    changes = open.changes.len(),
                    "Transaction assembled"
                );
                Ok(Some(ChangeBatch {
                    xid: open.xid.or(xid),
                    commit_lsn,
                    changes: open.changes,
                }))
            }
            DecodedMessage::Message {
                transactional,
                prefix,
                ..
            } => {
                trace!(transactional, prefix = %prefix, "Ignoring logical decoding message");
                Ok(None)
            }
        }
    }

    /// Feeds a whole fetch worth of messages in order.
    pub fn assemble(
        &mut self,
        messages: impl IntoIterator<Item = (Lsn, DecodedMessage)>,
    ) -> Result<Vec<ChangeBatch>, OutOfOrderChange> {
        let mut batches = Vec::new();
        for (lsn, message) in messages {
            if let Some(batch) = self.push(lsn, message)? {
                batches.push(batch);
            }
        }
        Ok(batches)
    }
}
