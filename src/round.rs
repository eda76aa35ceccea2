//! Finalized rounds.
//!
//! A round names a contiguous DAG segment `(start, end)` whose collapse
//! produced the `merkle` state checksum. The round ID is a digest over
//! `(index, start, end, merkle)` so any divergence in any component yields a
//! different identity.

use serde::{Deserialize, Serialize};

use crate::identity::{MerkleDigest, RoundId, TransactionId};
use crate::transaction::Transaction;

/// Fixed size of the round header wire encoding.
pub const ROUND_WIRE_LEN: usize = 32 + 8 + 32 + 32 + 16 + 4;

/// A finalized contiguous segment of the DAG.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub index: u64,
    pub start: Transaction,
    pub end: Transaction,
    pub merkle: MerkleDigest,
    pub transactions_count: u32,
}

impl Round {
    pub fn new(
        index: u64,
        start: Transaction,
        end: Transaction,
        merkle: MerkleDigest,
        transactions_count: u32,
    ) -> Round {
        let id = Self::compute_id(index, &start.id, &end.id, &merkle);
        Round {
            id,
            index,
            start,
            end,
            merkle,
            transactions_count,
        }
    }

    pub fn compute_id(
        index: u64,
        start: &TransactionId,
        end: &TransactionId,
        merkle: &MerkleDigest,
    ) -> RoundId {
        RoundId(crate::hash_concat(&[
            &index.to_be_bytes(),
            start.as_ref(),
            end.as_ref(),
            merkle.as_bytes(),
        ]))
    }

    /// Fixed-width header encoding with big-endian integers.
    pub fn header_wire(&self) -> [u8; ROUND_WIRE_LEN] {
        let mut out = [0u8; ROUND_WIRE_LEN];
        let mut at = 0;
        out[at..at + 32].copy_from_slice(self.id.as_ref());
        at += 32;
        out[at..at + 8].copy_from_slice(&self.index.to_be_bytes());
        at += 8;
        out[at..at + 32].copy_from_slice(self.start.id.as_ref());
        at += 32;
        out[at..at + 32].copy_from_slice(self.end.id.as_ref());
        at += 32;
        out[at..at + 16].copy_from_slice(self.merkle.as_bytes());
        at += 16;
        out[at..at + 4].copy_from_slice(&self.transactions_count.to_be_bytes());
        out
    }

    /// Decode the fixed-width header encoding.
    pub fn header_from_wire(raw: &[u8]) -> Option<RoundHeader> {
        if raw.len() != ROUND_WIRE_LEN {
            return None;
        }
        let mut at = 0;
        let take_32 = |at: &mut usize| {
            let arr: [u8; 32] = raw[*at..*at + 32].try_into().unwrap();
            *at += 32;
            arr
        };

        let id = RoundId(take_32(&mut at));
        let index = u64::from_be_bytes(raw[at..at + 8].try_into().unwrap());
        at += 8;
        let start = TransactionId(take_32(&mut at));
        let end = TransactionId(take_32(&mut at));
        let merkle = MerkleDigest(raw[at..at + 16].try_into().unwrap());
        at += 16;
        let transactions_count = u32::from_be_bytes(raw[at..at + 4].try_into().unwrap());

        let header = RoundHeader {
            id,
            index,
            start,
            end,
            merkle,
            transactions_count,
        };
        if header.id != Round::compute_id(index, &header.start, &header.end, &merkle) {
            return None;
        }
        Some(header)
    }
}

/// The wire view of a round: IDs only, no transaction bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundHeader {
    pub id: RoundId,
    pub index: u64,
    pub start: TransactionId,
    pub end: TransactionId,
    pub merkle: MerkleDigest,
    pub transactions_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AccountId;
    use crate::transaction::{encode_payload, Tag, TransferPayload};

    fn tx(seed: u8, depth: u64) -> Transaction {
        Transaction::new_unsigned(
            AccountId([seed; 32]),
            AccountId([seed; 32]),
            if depth == 0 {
                vec![]
            } else {
                vec![TransactionId([seed; 32])]
            },
            depth,
            Tag::Transfer,
            encode_payload(&TransferPayload {
                recipient: AccountId([0; 32]),
                amount: 1,
                invoke: None,
            }),
        )
        .unwrap()
    }

    #[test]
    fn id_binds_all_components() {
        let start = tx(1, 0);
        let end = tx(2, 3);
        let merkle = MerkleDigest([5; 16]);

        let round = Round::new(7, start.clone(), end.clone(), merkle, 42);
        let other = Round::new(8, start.clone(), end.clone(), merkle, 42);
        assert_ne!(round.id, other.id);

        let other_merkle = Round::new(7, start, end, MerkleDigest([6; 16]), 42);
        assert_ne!(round.id, other_merkle.id);
    }

    #[test]
    fn header_wire_round_trip() {
        let round = Round::new(3, tx(1, 0), tx(2, 5), MerkleDigest([9; 16]), 17);
        let wire = round.header_wire();
        let header = Round::header_from_wire(&wire).unwrap();

        assert_eq!(header.id, round.id);
        assert_eq!(header.index, 3);
        assert_eq!(header.start, round.start.id);
        assert_eq!(header.end, round.end.id);
        assert_eq!(header.merkle, round.merkle);
        assert_eq!(header.transactions_count, 17);
    }

    #[test]
    fn header_wire_rejects_corruption() {
        let round = Round::new(3, tx(1, 0), tx(2, 5), MerkleDigest([9; 16]), 17);
        let mut wire = round.header_wire().to_vec();

        assert!(Round::header_from_wire(&wire[..10]).is_none());

        wire[40] ^= 0xff; // corrupts the index
        assert!(Round::header_from_wire(&wire).is_none());
    }
}
