//! Reconciliation cursor for the backward history scan.
//!
//! The cursor is the accumulator threaded through the scan: it remembers how
//! far back the scan still has to look and how much on-chain state is still
//! unexplained by the transactions found so far. `step` is a pure function
//! over one chunk's outgoing logs, so all reconciliation arithmetic is unit
//! testable without any I/O; the driver in `history.rs` stays a thin loop.

use crate::ledger::{Address, RawLog};
use std::collections::HashSet;

/// Mutable scan accumulator for one (address, token variant) run.
///
/// Heights only move down, remaining quantities only move toward zero. Once
/// an account provably had zero balance, zero nonce and zero outstanding
/// allowance at some height, no earlier activity can matter to current
/// state, so the scan stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    /// Lower bound of the scan; chunks never start below this.
    pub earliest_height_to_check: u64,
    /// Upper bound of the next chunk; moves down as chunks complete.
    pub current_height: u64,
    /// Token balance not yet explained by matched outgoing transfers.
    pub remaining_balance: u128,
    /// Outgoing transactions not yet located.
    pub remaining_nonce: u64,
    /// Outstanding allowance per counterparty contract.
    pub remaining_allowances: Vec<(Address, u128)>,
}

impl SyncCursor {
    pub fn new(
        earliest_height_to_check: u64,
        current_height: u64,
        remaining_balance: u128,
        remaining_nonce: u64,
        remaining_allowances: Vec<(Address, u128)>,
    ) -> Self {
        Self {
            earliest_height_to_check,
            current_height,
            remaining_balance,
            remaining_nonce,
            remaining_allowances,
        }
    }

    /// All reconciliation targets reached zero.
    pub fn exhausted(&self) -> bool {
        self.remaining_balance == 0
            && self.remaining_nonce == 0
            && self.remaining_allowances.iter().all(|(_, left)| *left == 0)
    }

    /// The scan loop terminates when the floor is reached or nothing is
    /// left to reconcile.
    pub fn finished(&self) -> bool {
        self.current_height <= self.earliest_height_to_check || self.exhausted()
    }

    /// Boundaries `[start, end]` of the next backward chunk.
    pub fn next_chunk(&self, step_blocks: u64) -> (u64, u64) {
        let start = self
            .current_height
            .saturating_sub(step_blocks)
            .max(self.earliest_height_to_check);
        (start, self.current_height)
    }

    /// Fold one scanned chunk into the cursor.
    ///
    /// `outgoing` must be the nonzero-value transfers sent by the scanned
    /// address within the chunk. Each distinct transaction hash accounts for
    /// one nonce; each transferred value reduces the unexplained balance,
    /// and the allowance of the counterparty it was spent through: the
    /// escrow contract when that is the recipient, the direct-spend
    /// counterparty otherwise.
    pub fn step(mut self, chunk_start: u64, outgoing: &[RawLog], escrow: &Address) -> Self {
        let distinct_hashes: HashSet<&str> = outgoing
            .iter()
            .map(|log| log.transaction_hash.as_str())
            .collect();
        self.remaining_nonce = self
            .remaining_nonce
            .saturating_sub(distinct_hashes.len() as u64);

        for log in outgoing {
            self.remaining_balance = self.remaining_balance.saturating_sub(log.args.value);

            let via_escrow = log.args.to.eq_ignore_ascii_case(escrow);
            if let Some((_, left)) = self
                .remaining_allowances
                .iter_mut()
                .find(|(spender, _)| spender.eq_ignore_ascii_case(escrow) == via_escrow)
            {
                *left = left.saturating_sub(log.args.value);
            }
        }

        self.current_height = chunk_start.max(self.earliest_height_to_check);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TransferArgs;

    const ESCROW: &str = "0x00000000000000000000000000000000000e5c10";
    const POOL: &str = "0x0000000000000000000000000000000000900001";

    fn outgoing(hash: &str, to: &str, value: u128) -> RawLog {
        RawLog {
            address: "0x00000000000000000000000000000000000070c0".to_string(),
            transaction_hash: hash.to_string(),
            log_index: 0,
            args: TransferArgs {
                from: "0x0000000000000000000000000000000000000a11".to_string(),
                to: to.to_string(),
                value,
            },
            block_hash: "0xb10c".to_string(),
            block_number: 100,
        }
    }

    fn cursor() -> SyncCursor {
        SyncCursor::new(
            1_000,
            10_000,
            500,
            3,
            vec![(ESCROW.to_string(), 200), (POOL.to_string(), 50)],
        )
    }

    #[test]
    fn already_exhausted_cursor_is_finished_before_any_chunk() {
        let cursor = SyncCursor::new(0, 10_000, 0, 0, vec![(ESCROW.to_string(), 0)]);
        assert!(cursor.exhausted());
        assert!(cursor.finished());
    }

    #[test]
    fn chunk_boundaries_clamp_to_floor() {
        let cursor = cursor();
        assert_eq!(cursor.next_chunk(4_000), (6_000, 10_000));
        assert_eq!(cursor.next_chunk(20_000), (1_000, 10_000));
    }

    #[test]
    fn step_counts_distinct_hashes_once() {
        // Two outgoing logs of the same transaction consume one nonce.
        let logs = vec![
            outgoing("0xt1", "0x0000000000000000000000000000000000000b0b", 100),
            outgoing("0xt1", "0x0000000000000000000000000000000000000fee", 10),
        ];
        let next = cursor().step(6_000, &logs, &ESCROW.to_string());
        assert_eq!(next.remaining_nonce, 2);
        assert_eq!(next.remaining_balance, 390);
        assert_eq!(next.current_height, 6_000);
    }

    #[test]
    fn step_attributes_allowance_by_recipient() {
        let logs = vec![
            outgoing("0xt1", ESCROW, 120),
            outgoing("0xt2", "0x0000000000000000000000000000000000000b0b", 30),
        ];
        let next = cursor().step(6_000, &logs, &ESCROW.to_string());
        let escrow_left = next
            .remaining_allowances
            .iter()
            .find(|(spender, _)| spender == ESCROW)
            .unwrap()
            .1;
        let pool_left = next
            .remaining_allowances
            .iter()
            .find(|(spender, _)| spender == POOL)
            .unwrap()
            .1;
        assert_eq!(escrow_left, 80);
        assert_eq!(pool_left, 20);
    }

    #[test]
    fn quantities_saturate_at_zero() {
        let logs = vec![outgoing("0xt1", ESCROW, 10_000)];
        let next = cursor().step(1_000, &logs, &ESCROW.to_string());
        assert_eq!(next.remaining_balance, 0);
        assert!(next.finished());
    }

    #[test]
    fn heights_never_increase() {
        let next = cursor().step(500, &[], &ESCROW.to_string());
        // Clamped to the floor rather than below it.
        assert_eq!(next.current_height, 1_000);
        assert!(next.finished());
    }
}
