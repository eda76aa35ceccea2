//! Transactions: identity, typed payloads, fees, and the wire codec.
//!
//! A transaction is immutable after construction. Its ID is the BLAKE3
//! digest of the canonical encoding, and the creator signs that same
//! encoding. Parent IDs are sorted ascending and deduplicated at
//! construction; collapse determinism depends on every honest node holding
//! the same parent order.

use serde::{Deserialize, Serialize};

use crate::identity::{AccountId, Keypair, Signature, TransactionId, verify_signature};

/// Errors from transaction construction and decoding.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("payload does not decode for tag {tag:?}: {reason}")]
    InvalidPayload { tag: Tag, reason: String },
    #[error("transaction has too many parents ({0})")]
    TooManyParents(usize),
    #[error("payload exceeds maximum size ({0} bytes)")]
    PayloadTooLarge(usize),
    #[error("malformed wire encoding: {0}")]
    Wire(String),
}

/// Transaction kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tag {
    Transfer = 0,
    Stake = 1,
    Contract = 2,
    Batch = 3,
}

impl Tag {
    pub fn from_u8(raw: u8) -> Option<Tag> {
        match raw {
            0 => Some(Tag::Transfer),
            1 => Some(Tag::Stake),
            2 => Some(Tag::Contract),
            3 => Some(Tag::Batch),
            _ => None,
        }
    }
}

/// An optional contract invocation riding on a transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractInvoke {
    pub entrypoint: String,
    pub params: Vec<u8>,
    pub gas_budget: u64,
}

/// Payload of a `Tag::Transfer` transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPayload {
    pub recipient: AccountId,
    pub amount: u64,
    pub invoke: Option<ContractInvoke>,
}

/// Payload of a `Tag::Stake` transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StakePayload {
    PlaceStake(u64),
    WithdrawStake(u64),
    WithdrawReward(u64),
}

/// Payload of a `Tag::Contract` transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractPayload {
    Spawn { code: Vec<u8>, gas_deposit: u64 },
    DepositGas { contract_id: AccountId, amount: u64 },
}

/// One item of a `Tag::Batch` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub tag: u8,
    pub payload: Vec<u8>,
}

/// A transaction in the ancestry DAG.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub creator: AccountId,
    pub sender: AccountId,
    pub parent_ids: Vec<TransactionId>,
    pub depth: u64,
    pub tag: Tag,
    pub payload: Vec<u8>,
    pub signature: Signature,
}

impl Transaction {
    /// Build and sign a transaction. Parents are sorted and deduplicated;
    /// `depth` must be `1 + max(parent depth)` (checked at graph ingress,
    /// where parent depths are known).
    pub fn new(
        creator: &Keypair,
        sender: AccountId,
        parent_ids: Vec<TransactionId>,
        depth: u64,
        tag: Tag,
        payload: Vec<u8>,
    ) -> Result<Transaction, TransactionError> {
        let mut tx = Self::new_unsigned(creator.account_id(), sender, parent_ids, depth, tag, payload)?;
        tx.signature = creator.sign(&tx.signing_message());
        Ok(tx)
    }

    /// Build an unsigned transaction (genesis, tests). Its signature is
    /// empty and it only passes ingress where signature checks are skipped.
    pub fn new_unsigned(
        creator: AccountId,
        sender: AccountId,
        mut parent_ids: Vec<TransactionId>,
        depth: u64,
        tag: Tag,
        payload: Vec<u8>,
    ) -> Result<Transaction, TransactionError> {
        parent_ids.sort();
        parent_ids.dedup();

        if parent_ids.len() > crate::constants::MAX_PARENTS {
            return Err(TransactionError::TooManyParents(parent_ids.len()));
        }
        if payload.len() > crate::constants::MAX_PAYLOAD_SIZE {
            return Err(TransactionError::PayloadTooLarge(payload.len()));
        }

        let mut tx = Transaction {
            id: TransactionId::default(),
            creator,
            sender,
            parent_ids,
            depth,
            tag,
            payload,
            signature: Signature::empty(),
        };
        tx.id = TransactionId(crate::hash_domain(b"cascade.tx.id", &tx.signing_message()));
        Ok(tx)
    }

    /// Canonical encoding covered by both the ID and the signature.
    pub fn signing_message(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            32 + 32 + 4 + self.parent_ids.len() * 32 + 8 + 1 + 4 + self.payload.len(),
        );
        out.extend_from_slice(self.creator.as_ref());
        out.extend_from_slice(self.sender.as_ref());
        out.extend_from_slice(&(self.parent_ids.len() as u32).to_be_bytes());
        for parent in &self.parent_ids {
            out.extend_from_slice(parent.as_ref());
        }
        out.extend_from_slice(&self.depth.to_be_bytes());
        out.push(self.tag as u8);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Verify the creator's signature and the ID binding.
    pub fn verify(&self) -> bool {
        let message = self.signing_message();
        if self.id != TransactionId(crate::hash_domain(b"cascade.tx.id", &message)) {
            return false;
        }
        verify_signature(&self.creator, &message, &self.signature)
    }

    /// Deterministic fee: a base amount plus one unit per
    /// `TX_FEE_BYTE_DIVISOR` bytes of payload.
    pub fn fee(&self) -> u64 {
        crate::constants::TX_FEE_BASE
            + self.payload.len() as u64 / crate::constants::TX_FEE_BYTE_DIVISOR
    }

    /// Statistical weight: 1 for ordinary transactions, the item count for
    /// batches (never zero).
    pub fn logical_units(&self) -> u64 {
        match self.tag {
            Tag::Batch => self
                .batch_payload()
                .map(|items| items.len() as u64)
                .unwrap_or(1)
                .max(1),
            _ => 1,
        }
    }

    pub fn transfer_payload(&self) -> Result<TransferPayload, TransactionError> {
        decode_payload(Tag::Transfer, self.tag, &self.payload)
    }

    pub fn stake_payload(&self) -> Result<StakePayload, TransactionError> {
        decode_payload(Tag::Stake, self.tag, &self.payload)
    }

    pub fn contract_payload(&self) -> Result<ContractPayload, TransactionError> {
        decode_payload(Tag::Contract, self.tag, &self.payload)
    }

    pub fn batch_payload(&self) -> Result<Vec<BatchItem>, TransactionError> {
        decode_payload(Tag::Batch, self.tag, &self.payload)
    }

    /// Check that the typed payload decodes for this transaction's tag.
    pub fn validate_payload(&self) -> Result<(), TransactionError> {
        match self.tag {
            Tag::Transfer => self.transfer_payload().map(|_| ()),
            Tag::Stake => self.stake_payload().map(|_| ()),
            Tag::Contract => self.contract_payload().map(|_| ()),
            Tag::Batch => {
                let items = self.batch_payload()?;
                for item in &items {
                    let tag = Tag::from_u8(item.tag).ok_or_else(|| {
                        TransactionError::InvalidPayload {
                            tag: Tag::Batch,
                            reason: format!("unknown batch item tag {}", item.tag),
                        }
                    })?;
                    if tag == Tag::Batch {
                        return Err(TransactionError::InvalidPayload {
                            tag: Tag::Batch,
                            reason: "nested batches are not allowed".into(),
                        });
                    }
                    match tag {
                        Tag::Transfer => {
                            decode_raw::<TransferPayload>(tag, &item.payload)?;
                        }
                        Tag::Stake => {
                            decode_raw::<StakePayload>(tag, &item.payload)?;
                        }
                        Tag::Contract => {
                            decode_raw::<ContractPayload>(tag, &item.payload)?;
                        }
                        Tag::Batch => unreachable!(),
                    }
                }
                Ok(())
            }
        }
    }

    /// Wire encoding: length-prefixed binary with big-endian integers.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.id.as_ref());
        out.extend_from_slice(&self.signing_message());
        out.extend_from_slice(&(self.signature.0.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.signature.0);
        out
    }

    /// Decode the wire encoding. The embedded ID is checked against the
    /// recomputed digest.
    pub fn from_wire(raw: &[u8]) -> Result<Transaction, TransactionError> {
        let mut cursor = Cursor { raw, pos: 0 };

        let id = TransactionId(cursor.take_32()?);
        let creator = AccountId(cursor.take_32()?);
        let sender = AccountId(cursor.take_32()?);

        let parent_count = cursor.take_u32()? as usize;
        if parent_count > crate::constants::MAX_PARENTS {
            return Err(TransactionError::Wire(format!(
                "parent count {} exceeds maximum",
                parent_count
            )));
        }
        let mut parent_ids = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            parent_ids.push(TransactionId(cursor.take_32()?));
        }

        let depth = cursor.take_u64()?;
        let tag_raw = cursor.take_u8()?;
        let tag = Tag::from_u8(tag_raw)
            .ok_or_else(|| TransactionError::Wire(format!("unknown tag {}", tag_raw)))?;

        let payload_len = cursor.take_u32()? as usize;
        if payload_len > crate::constants::MAX_PAYLOAD_SIZE {
            return Err(TransactionError::PayloadTooLarge(payload_len));
        }
        let payload = cursor.take_bytes(payload_len)?.to_vec();

        let sig_len = cursor.take_u32()? as usize;
        let signature = Signature(cursor.take_bytes(sig_len)?.to_vec());

        let tx = Transaction {
            id,
            creator,
            sender,
            parent_ids,
            depth,
            tag,
            payload,
            signature,
        };

        let expected = TransactionId(crate::hash_domain(b"cascade.tx.id", &tx.signing_message()));
        if tx.id != expected {
            return Err(TransactionError::Wire("transaction ID mismatch".into()));
        }
        Ok(tx)
    }
}

fn decode_payload<T: for<'de> Deserialize<'de>>(
    expected: Tag,
    actual: Tag,
    raw: &[u8],
) -> Result<T, TransactionError> {
    if expected != actual {
        return Err(TransactionError::InvalidPayload {
            tag: actual,
            reason: format!("expected tag {:?}", expected),
        });
    }
    decode_raw(expected, raw)
}

fn decode_raw<T: for<'de> Deserialize<'de>>(tag: Tag, raw: &[u8]) -> Result<T, TransactionError> {
    bincode::deserialize(raw).map_err(|e| TransactionError::InvalidPayload {
        tag,
        reason: e.to_string(),
    })
}

/// Encode a typed payload for transaction construction.
pub fn encode_payload<T: Serialize>(payload: &T) -> Vec<u8> {
    bincode::serialize(payload).expect("payload serialization cannot fail")
}

struct Cursor<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take_bytes(&mut self, n: usize) -> Result<&'a [u8], TransactionError> {
        if self.pos + n > self.raw.len() {
            return Err(TransactionError::Wire("truncated input".into()));
        }
        let slice = &self.raw[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_32(&mut self) -> Result<[u8; 32], TransactionError> {
        Ok(self.take_bytes(32)?.try_into().expect("length checked"))
    }

    fn take_u8(&mut self) -> Result<u8, TransactionError> {
        Ok(self.take_bytes(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, TransactionError> {
        Ok(u32::from_be_bytes(
            self.take_bytes(4)?.try_into().expect("length checked"),
        ))
    }

    fn take_u64(&mut self) -> Result<u64, TransactionError> {
        Ok(u64::from_be_bytes(
            self.take_bytes(8)?.try_into().expect("length checked"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer_tx(keypair: &Keypair, parents: Vec<TransactionId>, depth: u64) -> Transaction {
        let payload = encode_payload(&TransferPayload {
            recipient: AccountId([9; 32]),
            amount: 10,
            invoke: None,
        });
        Transaction::new(
            keypair,
            keypair.account_id(),
            parents,
            depth,
            Tag::Transfer,
            payload,
        )
        .unwrap()
    }

    #[test]
    fn parents_are_sorted_and_deduplicated() {
        let keypair = Keypair::generate();
        let p1 = TransactionId([3; 32]);
        let p2 = TransactionId([1; 32]);
        let tx = transfer_tx(&keypair, vec![p1, p2, p1], 1);
        assert_eq!(tx.parent_ids, vec![p2, p1]);
    }

    #[test]
    fn id_is_deterministic_over_parent_order() {
        let keypair = Keypair::generate();
        let p1 = TransactionId([3; 32]);
        let p2 = TransactionId([1; 32]);
        let a = transfer_tx(&keypair, vec![p1, p2], 1);
        let b = transfer_tx(&keypair, vec![p2, p1], 1);
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn signature_verifies_and_binds_content() {
        let keypair = Keypair::generate();
        let tx = transfer_tx(&keypair, vec![], 0);
        assert!(tx.verify());

        let mut tampered = tx.clone();
        tampered.depth = 99;
        assert!(!tampered.verify());
    }

    #[test]
    fn fee_follows_payload_size() {
        let keypair = Keypair::generate();
        let tx = Transaction::new(
            &keypair,
            keypair.account_id(),
            vec![],
            0,
            Tag::Transfer,
            Vec::new(),
        )
        .unwrap();
        assert_eq!(tx.fee(), crate::constants::TX_FEE_BASE);

        let big = Transaction::new(
            &keypair,
            keypair.account_id(),
            vec![],
            0,
            Tag::Transfer,
            vec![0u8; 128],
        )
        .unwrap();
        assert_eq!(big.fee(), crate::constants::TX_FEE_BASE + 2);
    }

    #[test]
    fn batch_logical_units() {
        let keypair = Keypair::generate();
        let items = vec![
            BatchItem {
                tag: Tag::Stake as u8,
                payload: encode_payload(&StakePayload::PlaceStake(5)),
            },
            BatchItem {
                tag: Tag::Stake as u8,
                payload: encode_payload(&StakePayload::PlaceStake(6)),
            },
            BatchItem {
                tag: Tag::Stake as u8,
                payload: encode_payload(&StakePayload::PlaceStake(7)),
            },
        ];
        let tx = Transaction::new(
            &keypair,
            keypair.account_id(),
            vec![],
            0,
            Tag::Batch,
            encode_payload(&items),
        )
        .unwrap();
        assert_eq!(tx.logical_units(), 3);
        assert!(tx.validate_payload().is_ok());
    }

    #[test]
    fn nested_batch_is_invalid() {
        let keypair = Keypair::generate();
        let items = vec![BatchItem {
            tag: Tag::Batch as u8,
            payload: vec![],
        }];
        let tx = Transaction::new(
            &keypair,
            keypair.account_id(),
            vec![],
            0,
            Tag::Batch,
            encode_payload(&items),
        )
        .unwrap();
        assert!(matches!(
            tx.validate_payload(),
            Err(TransactionError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn malformed_payload_rejected() {
        let keypair = Keypair::generate();
        let tx = Transaction::new(
            &keypair,
            keypair.account_id(),
            vec![],
            0,
            Tag::Transfer,
            b"garbage".to_vec(),
        )
        .unwrap();
        assert!(tx.validate_payload().is_err());
    }

    #[test]
    fn wire_round_trip() {
        let keypair = Keypair::generate();
        let tx = transfer_tx(&keypair, vec![TransactionId([5; 32])], 3);
        let decoded = Transaction::from_wire(&tx.to_wire()).unwrap();
        assert_eq!(tx, decoded);
        assert!(decoded.verify());
    }

    #[test]
    fn wire_rejects_truncation_and_id_mismatch() {
        let keypair = Keypair::generate();
        let tx = transfer_tx(&keypair, vec![], 0);
        let wire = tx.to_wire();

        assert!(Transaction::from_wire(&wire[..wire.len() - 3]).is_err());

        let mut corrupted = wire.clone();
        corrupted[0] ^= 0xff; // flips a byte of the embedded ID
        assert!(Transaction::from_wire(&corrupted).is_err());
    }
}
