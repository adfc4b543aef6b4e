/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
*/

//! A helper for the usual way of driving an IDL from a main loop: run the IDL, recompute
//! and write the database with at most one transaction in flight, and skip recomputing
//! until the replica changes after a transaction had to be retried.

use tracing::debug;

use crate::idl::Idl;
use crate::txn::{Txn, TxnHandle, TxnStatus};

/// What happened to the transaction in flight.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommitProgress {
    /// There is no transaction in flight, or it succeeded or had nothing to do.
    Succeeded,
    /// The transaction failed.  If it should be retried, the loop waits for the replica to
    /// change first.
    Failed,
    /// Still waiting for the server.
    InProgress,
}

pub struct IdlLoop {
    pub idl: Idl,
    committing: Option<TxnHandle>,
    precommit_seqno: u64,
    /// Change seqno at which the last transaction got "try again".  No new transaction is
    /// started until the replica moves past it.
    skip_seqno: Option<u64>,
    /// A configuration counter that the client bumps for each transaction.  `cur_cfg`
    /// catches up with `next_cfg` once a transaction succeeds.
    pub next_cfg: i64,
    pub cur_cfg: i64,
}

impl IdlLoop {
    pub fn new(idl: Idl) -> IdlLoop {
        IdlLoop {
            idl,
            committing: None,
            precommit_seqno: 0,
            skip_seqno: None,
            next_cfg: 0,
            cur_cfg: 0,
        }
    }

    /// Runs the IDL, then starts a transaction unless one is already in flight or the
    /// replica is unchanged since a transaction had to be retried.
    pub fn run(&mut self) -> Option<Txn<'_>> {
        self.idl.run();
        if self.committing.is_some() || Some(self.idl.get_seqno()) == self.skip_seqno {
            return None;
        }
        self.precommit_seqno = self.idl.get_seqno();
        Some(self.idl.txn_create())
    }

    /// Tracks `committed`, the handle of the transaction that [`IdlLoop::run`] started, if
    /// the client committed it, and reports on whichever transaction is in flight.
    pub fn commit_and_wait(&mut self, committed: Option<TxnHandle>) -> CommitProgress {
        if let Some(handle) = committed {
            self.committing = Some(handle);
        }
        let handle = match self.committing {
            Some(handle) => handle,
            None => return CommitProgress::Succeeded,
        };

        let status = self.idl.txn_status(handle).unwrap_or(TxnStatus::Error);
        let progress = match status {
            TxnStatus::Incomplete | TxnStatus::Uncommitted => return CommitProgress::InProgress,
            TxnStatus::TryAgain => {
                self.skip_seqno = Some(self.precommit_seqno);
                CommitProgress::Failed
            },
            TxnStatus::Success | TxnStatus::Unchanged => {
                self.cur_cfg = self.next_cfg;
                CommitProgress::Succeeded
            },
            TxnStatus::Aborted | TxnStatus::NotLocked | TxnStatus::Error => CommitProgress::Failed,
        };
        debug!("transaction finished: {}", self.idl.txn_get_error(handle));
        self.idl.txn_destroy(handle);
        self.committing = None;
        progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::Datum;
    use crate::testing::{example_class, TestServer};
    use anyhow::Result;
    use serde_json::json;

    #[test]
    fn one_transaction_at_a_time() -> Result<()> {
        let server = TestServer::new(&example_class());
        server.transact(json!([{"op": "insert", "table": "Parent", "row": {"name": "p", "n": 1}}]));
        let mut idl_loop = IdlLoop::new(server.idl(true));
        idl_loop.next_cfg = 1;

        let uuid = {
            let txn = idl_loop.run().unwrap();
            let uuid = txn.rows("Parent")[0].uuid();
            txn.abort();
            uuid
        };
        assert_eq!(idl_loop.commit_and_wait(None), CommitProgress::Succeeded);

        server.set_deferred(true);
        let handle = {
            let mut txn = idl_loop.run().unwrap();
            txn.write("Parent", &uuid, "n", Datum::scalar(2i64))?;
            txn.commit()
        };
        assert_eq!(idl_loop.commit_and_wait(Some(handle)), CommitProgress::InProgress);
        assert!(idl_loop.run().is_none());

        server.set_deferred(false);
        server.process_deferred();
        assert!(idl_loop.run().is_none());
        assert_eq!(idl_loop.commit_and_wait(None), CommitProgress::Succeeded);
        assert_eq!(idl_loop.cur_cfg, 1);
        assert_eq!(idl_loop.idl.rows("Parent")[0].integer("n"), 2);
        Ok(())
    }

    #[test]
    fn try_again_waits_for_change() -> Result<()> {
        let server = TestServer::new(&example_class());
        server.transact(json!([{"op": "insert", "table": "Parent", "row": {"name": "p", "n": 1}}]));
        let mut idl_loop = IdlLoop::new(server.idl(true));
        idl_loop.idl.run();
        let uuid = idl_loop.idl.rows("Parent")[0].uuid();

        server.fail_next_transact(0, "timed out");
        let handle = {
            let mut txn = idl_loop.run().unwrap();
            txn.write("Parent", &uuid, "n", Datum::scalar(2i64))?;
            txn.commit()
        };
        idl_loop.idl.run();
        assert_eq!(idl_loop.commit_and_wait(Some(handle)), CommitProgress::Failed);

        // Nothing changed, so there is no point in trying again yet.
        assert!(idl_loop.run().is_none());
        server.transact(json!([{"op": "update", "table": "Parent", "where": [], "row": {"name": "q"}}]));
        assert!(idl_loop.run().is_some());
        Ok(())
    }
}
