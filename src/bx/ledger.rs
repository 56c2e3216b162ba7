use std::time::{SystemTime, UNIX_EPOCH};

use bincode::serialize;
use lazy_static::lazy_static;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::bx::wallet::{self, Wallet};

pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
pub const GENESIS_MINER: &str = "BLIX_GENESIS";
pub const INITIAL_BLOCK_REWARD: f64 = 50.0;
pub const HALVING_INTERVAL: u64 = 210_000;
pub const MIN_REWARD_UNIT: f64 = 0.000_000_01;
pub const MIN_TRANSACTION_FEE: f64 = 0.0001;
pub const MAX_TX_PER_BLOCK: usize = 10;

const EMPTY_MERKLE_TAG: &[u8] = b"blix_empty_merkle_root";

pub const MAX_TARGET_BYTES: [u8; 32] = [0xff; 32];
lazy_static! {
    pub static ref MAX_TARGET: BigUint = BigUint::from_bytes_be(&MAX_TARGET_BYTES);
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The acceptance bound for a given difficulty. A block hash, read as a
/// big-endian unsigned integer, must be strictly below this value.
pub fn pow_target(difficulty: u64) -> BigUint {
    MAX_TARGET.clone() / difficulty.max(1)
}

// Hex (de)serialization for 32-byte digests; on the wire every hash is a
// lowercase hex string.
pub mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(&s).map_err(serde::de::Error::custom)?;
        raw.try_into()
            .map_err(|_| serde::de::Error::custom("expected a 32 byte hex digest"))
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid {0} address")]
    InvalidAddress(&'static str),
    #[error("amount must be a positive finite number")]
    InvalidAmount,
    #[error("fee below minimum")]
    InvalidFee,
    #[error("timestamp must be positive")]
    InvalidTimestamp,
    #[error("missing signature or public key")]
    MissingSignature,
    #[error("signature verification failed: {0}")]
    InvalidSignature(String),
    #[error("public key does not match sender address")]
    KeyMismatch,
    #[error("block index {got} does not extend chain height {want}")]
    IndexMismatch { got: u64, want: u64 },
    #[error("previous hash does not match chain tip")]
    LinkMismatch,
    #[error("block hash does not match header")]
    HashMismatch,
    #[error("block hash does not satisfy difficulty target")]
    TargetNotMet,
    #[error("serialization failed: {0}")]
    Serialization(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub sender: String,
    pub recipient: String,
    pub amount: f64,
    pub fee: f64,
    pub nonce: u64,
    pub timestamp: u64,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub sender_public_key: Option<String>,
}

impl Transaction {
    pub fn round_amount(amount: f64) -> f64 {
        (amount * 100_000_000.0).round() / 100_000_000.0
    }

    pub fn new(
        sender: String,
        recipient: String,
        amount: f64,
        fee: f64,
        nonce: u64,
        timestamp: u64,
    ) -> Self {
        Transaction {
            sender,
            recipient,
            amount: Self::round_amount(amount),
            fee: Self::round_amount(fee),
            nonce,
            timestamp,
            signature: None,
            sender_public_key: None,
        }
    }

    pub fn create_signed(
        wallet: &Wallet,
        recipient: String,
        amount: f64,
        fee: f64,
        nonce: u64,
    ) -> Self {
        let mut tx = Self::new(
            wallet.address.clone(),
            recipient,
            amount,
            fee,
            nonce,
            unix_now(),
        );
        tx.signature = Some(wallet.sign_payload(&tx.canonical_payload()));
        tx.sender_public_key = Some(wallet.public_key_hex());
        tx
    }

    /// The signing message and id preimage. The signature and public key are
    /// excluded so the id is stable across re-signing.
    pub fn canonical_payload(&self) -> Vec<u8> {
        format!(
            "{}:{}:{:.8}:{:.8}:{}:{}",
            self.sender, self.recipient, self.amount, self.fee, self.nonce, self.timestamp
        )
        .into_bytes()
    }

    /// Deterministic transaction id; the replay protection key.
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_payload());
        hex::encode(hasher.finalize())
    }

    /// Full admission validation, in order, stopping at the first failure.
    /// The `nonce` field is a u64, so negatives are unrepresentable and are
    /// rejected at deserialization.
    pub fn validate(&self) -> Result<(), ChainError> {
        wallet::validate_address(&self.sender).map_err(|_| ChainError::InvalidAddress("sender"))?;
        wallet::validate_address(&self.recipient)
            .map_err(|_| ChainError::InvalidAddress("recipient"))?;
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(ChainError::InvalidAmount);
        }
        if !self.fee.is_finite() || self.fee < MIN_TRANSACTION_FEE {
            return Err(ChainError::InvalidFee);
        }
        if self.timestamp == 0 {
            return Err(ChainError::InvalidTimestamp);
        }
        let (signature, public_key) = match (&self.signature, &self.sender_public_key) {
            (Some(sig), Some(pk)) => (sig, pk),
            _ => return Err(ChainError::MissingSignature),
        };
        let key_bytes = hex::decode(public_key)
            .map_err(|e| ChainError::InvalidSignature(format!("bad public key hex: {}", e)))?;
        // The sender must own the declared key.
        if wallet::derive_address(&key_bytes) != self.sender {
            return Err(ChainError::KeyMismatch);
        }
        match wallet::verify_signature(&self.canonical_payload(), signature, public_key) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ChainError::InvalidSignature("signature rejected".into())),
            Err(e) => Err(ChainError::InvalidSignature(e.to_string())),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub index: u64,
    pub timestamp: u64,
    #[serde(with = "hex_hash")]
    pub previous_hash: [u8; 32],
    #[serde(with = "hex_hash")]
    pub merkle_root: [u8; 32],
    pub nonce: u64,
    pub difficulty: u64,
    pub miner: String,
    pub transactions: Vec<Transaction>,
    pub reward: f64,
    #[serde(with = "hex_hash")]
    pub hash: [u8; 32],
}

impl Block {
    /// An unsolved block: nonce zero, no miner, zero hash. Handed to the
    /// pool as the round template.
    pub fn template(
        index: u64,
        previous_hash: [u8; 32],
        timestamp: u64,
        transactions: Vec<Transaction>,
        difficulty: u64,
        reward: f64,
    ) -> Result<Self, ChainError> {
        let merkle_root = Blockchain::calculate_merkle_root(&transactions)?;
        Ok(Block {
            index,
            timestamp,
            previous_hash,
            merkle_root,
            nonce: 0,
            difficulty,
            miner: String::new(),
            transactions,
            reward,
            hash: [0u8; 32],
        })
    }

    // Canonical header bytes: every identity-bearing field except the hash
    // itself, at fixed offsets, miner last-but-one because it is the only
    // variable-length field before the nonce.
    fn header_bytes(&self, nonce: u64, miner: &str) -> Vec<u8> {
        let mut data = Vec::with_capacity(96 + miner.len());
        data.extend_from_slice(&self.index.to_le_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.previous_hash);
        data.extend_from_slice(&self.merkle_root);
        data.extend_from_slice(&self.difficulty.to_le_bytes());
        data.extend_from_slice(&self.reward.to_bits().to_le_bytes());
        data.extend_from_slice(miner.as_bytes());
        data.extend_from_slice(&nonce.to_le_bytes());
        data
    }

    /// Double-SHA-256 of the canonical header with the given nonce and miner.
    /// Used identically by the coordinator (verification) and the miner
    /// (search), so both sides hash the exact same bytes.
    pub fn header_hash_with(&self, nonce: u64, miner: &str) -> [u8; 32] {
        let first = Sha256::digest(self.header_bytes(nonce, miner));
        Sha256::digest(first).into()
    }

    pub fn compute_hash(&self) -> [u8; 32] {
        self.header_hash_with(self.nonce, &self.miner)
    }

    /// Finalize a solved template: fill in the winning nonce and miner and
    /// freeze the hash.
    pub fn sealed(mut self, nonce: u64, miner: &str) -> Self {
        self.nonce = nonce;
        self.miner = miner.to_string();
        self.hash = self.compute_hash();
        self
    }

    pub fn verify_pow(&self) -> bool {
        BigUint::from_bytes_be(&self.hash) < pow_target(self.difficulty)
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Block reward at a given height: geometric halving, floored at the
/// smallest representable unit.
pub fn block_reward(index: u64) -> f64 {
    let halvings = index / HALVING_INTERVAL;
    if halvings >= 64 {
        return MIN_REWARD_UNIT;
    }
    (INITIAL_BLOCK_REWARD / (1u64 << halvings) as f64).max(MIN_REWARD_UNIT)
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStatus {
    pub height: u64,
    pub tip_hash: String,
    pub difficulty: u64,
    pub total_supply: f64,
}

#[derive(Debug, Clone)]
pub struct Blockchain {
    pub blocks: Vec<Block>,
    pub total_supply: f64,
}

impl Blockchain {
    pub fn new() -> Self {
        Blockchain {
            blocks: vec![Self::genesis_block()],
            total_supply: 0.0,
        }
    }

    /// Fixed, deterministic genesis. Everyone who builds it gets the same
    /// hash, so every coordinator starts from the same tip.
    pub fn genesis_block() -> Block {
        let block = Block {
            index: 0,
            timestamp: GENESIS_TIMESTAMP,
            previous_hash: [0u8; 32],
            merkle_root: Self::calculate_merkle_root(&[])
                .expect("empty merkle root is infallible"),
            nonce: 0,
            difficulty: 1,
            miner: GENESIS_MINER.to_string(),
            transactions: Vec::new(),
            reward: 0.0,
            hash: [0u8; 32],
        };
        let hash = block.compute_hash();
        Block { hash, ..block }
    }

    pub fn height(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub fn tip(&self) -> &Block {
        self.blocks.last().expect("chain always has genesis")
    }

    pub fn get_block(&self, height: u64) -> Option<&Block> {
        self.blocks.get(height as usize)
    }

    pub fn status(&self) -> ChainStatus {
        let tip = self.tip();
        ChainStatus {
            height: self.height(),
            tip_hash: tip.hash_hex(),
            difficulty: tip.difficulty,
            total_supply: self.total_supply,
        }
    }

    /// Append a sealed block. The commit path has already verified the
    /// solution; these checks guard the chain invariants themselves, and a
    /// failure here aborts the round, never the process.
    pub fn append_block(&mut self, block: Block) -> Result<(), ChainError> {
        if block.index != self.height() {
            return Err(ChainError::IndexMismatch {
                got: block.index,
                want: self.height(),
            });
        }
        if block.previous_hash != self.tip().hash {
            return Err(ChainError::LinkMismatch);
        }
        if block.compute_hash() != block.hash {
            return Err(ChainError::HashMismatch);
        }
        if !block.verify_pow() {
            return Err(ChainError::TargetNotMet);
        }
        self.total_supply += block.reward;
        self.blocks.push(block);
        Ok(())
    }

    /// Walk every link from genesis to tip.
    pub fn validate_chain(&self) -> Result<(), ChainError> {
        for pair in self.blocks.windows(2) {
            let (prev, block) = (&pair[0], &pair[1]);
            if block.index != prev.index + 1 {
                return Err(ChainError::IndexMismatch {
                    got: block.index,
                    want: prev.index + 1,
                });
            }
            if block.previous_hash != prev.hash {
                return Err(ChainError::LinkMismatch);
            }
            if block.compute_hash() != block.hash {
                return Err(ChainError::HashMismatch);
            }
        }
        Ok(())
    }

    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Result<[u8; 32], ChainError> {
        if transactions.is_empty() {
            let mut hasher = Sha256::new();
            hasher.update(EMPTY_MERKLE_TAG);
            return Ok(hasher.finalize().into());
        }

        let mut current_level: Vec<[u8; 32]> = transactions
            .iter()
            .map(|tx| {
                let tx_bytes =
                    serialize(tx).map_err(|e| ChainError::Serialization(e.to_string()))?;
                Ok(Sha256::digest(&tx_bytes).into())
            })
            .collect::<Result<Vec<_>, ChainError>>()?;

        // A single leaf is paired with itself.
        if current_level.len() == 1 {
            let mut hasher = Sha256::new();
            hasher.update(current_level[0]);
            hasher.update(current_level[0]);
            return Ok(hasher.finalize().into());
        }

        while current_level.len() > 1 {
            current_level = current_level
                .chunks(2)
                .map(|pair| {
                    let mut hasher = Sha256::new();
                    hasher.update(pair[0]);
                    if pair.len() == 2 {
                        hasher.update(pair[1]);
                    }
                    hasher.finalize().into()
                })
                .collect();
        }

        Ok(current_level[0])
    }

    /// Balance of an address over the committed chain: received amounts in,
    /// spent amounts and fees out, block reward plus collected fees to the
    /// miner of each block.
    pub fn address_balance(&self, address: &str) -> f64 {
        let mut balance = 0.0;
        for block in &self.blocks {
            if block.miner == address {
                balance += block.reward;
                balance += block.transactions.iter().map(|tx| tx.fee).sum::<f64>();
            }
            for tx in &block.transactions {
                if tx.recipient == address {
                    balance += tx.amount;
                }
                if tx.sender == address {
                    balance -= tx.amount + tx.fee;
                }
            }
        }
        Transaction::round_amount(balance)
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bx::wallet::Wallet;

    fn signed_tx(wallet: &Wallet, recipient: &str, amount: f64, nonce: u64) -> Transaction {
        Transaction::create_signed(wallet, recipient.to_string(), amount, 0.001, nonce)
    }

    #[test]
    fn genesis_is_deterministic() {
        let a = Blockchain::genesis_block();
        let b = Blockchain::genesis_block();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.index, 0);
        assert_eq!(a.previous_hash, [0u8; 32]);
        assert_eq!(a.miner, GENESIS_MINER);
        assert!(a.transactions.is_empty());
        assert_eq!(a.hash, a.compute_hash());
    }

    #[test]
    fn chain_links_and_heights() {
        let mut chain = Blockchain::new();
        for _ in 0..3 {
            let tip = chain.tip();
            let template = Block::template(
                chain.height(),
                tip.hash,
                tip.timestamp + 60,
                Vec::new(),
                1,
                block_reward(chain.height()),
            )
            .unwrap();
            let block = template.sealed(0, "BLIXmineraddress");
            chain.append_block(block).unwrap();
        }
        assert_eq!(chain.height(), 4);
        chain.validate_chain().unwrap();
        for (i, block) in chain.blocks.iter().enumerate() {
            assert_eq!(block.index, i as u64);
            if i > 0 {
                assert_eq!(block.previous_hash, chain.blocks[i - 1].hash);
                assert_eq!(block.previous_hash, chain.blocks[i - 1].compute_hash());
            }
        }
    }

    #[test]
    fn append_rejects_bad_index_and_link() {
        let mut chain = Blockchain::new();
        let tip_hash = chain.tip().hash;

        let wrong_index = Block::template(5, tip_hash, unix_now(), Vec::new(), 1, 50.0)
            .unwrap()
            .sealed(0, "m");
        assert!(matches!(
            chain.append_block(wrong_index),
            Err(ChainError::IndexMismatch { .. })
        ));

        let wrong_link = Block::template(1, [7u8; 32], unix_now(), Vec::new(), 1, 50.0)
            .unwrap()
            .sealed(0, "m");
        assert!(matches!(
            chain.append_block(wrong_link),
            Err(ChainError::LinkMismatch)
        ));
    }

    #[test]
    fn merkle_empty_list_is_fixed_value() {
        let root = Blockchain::calculate_merkle_root(&[]).unwrap();
        let expected: [u8; 32] = Sha256::digest(EMPTY_MERKLE_TAG).into();
        assert_eq!(root, expected);
    }

    #[test]
    fn merkle_single_leaf_is_duplicated() {
        let wallet = Wallet::generate();
        let other = Wallet::generate();
        let tx = signed_tx(&wallet, &other.address, 1.0, 0);

        let leaf: [u8; 32] = Sha256::digest(serialize(&tx).unwrap()).into();
        let mut hasher = Sha256::new();
        hasher.update(leaf);
        hasher.update(leaf);
        let expected: [u8; 32] = hasher.finalize().into();

        assert_eq!(
            Blockchain::calculate_merkle_root(std::slice::from_ref(&tx)).unwrap(),
            expected
        );
    }

    #[test]
    fn merkle_pair_concatenates_leaf_hashes() {
        let wallet = Wallet::generate();
        let other = Wallet::generate();
        let a = signed_tx(&wallet, &other.address, 1.0, 0);
        let b = signed_tx(&wallet, &other.address, 2.0, 1);

        let ha: [u8; 32] = Sha256::digest(serialize(&a).unwrap()).into();
        let hb: [u8; 32] = Sha256::digest(serialize(&b).unwrap()).into();
        let mut hasher = Sha256::new();
        hasher.update(ha);
        hasher.update(hb);
        let expected: [u8; 32] = hasher.finalize().into();

        assert_eq!(
            Blockchain::calculate_merkle_root(&[a, b]).unwrap(),
            expected
        );
    }

    #[test]
    fn reward_halves_on_schedule() {
        assert_eq!(block_reward(0), 50.0);
        assert_eq!(block_reward(HALVING_INTERVAL - 1), 50.0);
        assert_eq!(block_reward(HALVING_INTERVAL), 25.0);
        assert_eq!(block_reward(2 * HALVING_INTERVAL), 12.5);
        assert_eq!(block_reward(64 * HALVING_INTERVAL), MIN_REWARD_UNIT);
    }

    #[test]
    fn transaction_id_is_deterministic() {
        let wallet = Wallet::generate();
        let other = Wallet::generate();
        let a = signed_tx(&wallet, &other.address, 5.0, 3);
        let mut b = a.clone();
        b.signature = None;
        b.sender_public_key = None;
        // The id covers only the canonical fields.
        assert_eq!(a.id(), b.id());

        let mut c = a.clone();
        c.nonce = 4;
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn validation_stops_at_first_failure() {
        let wallet = Wallet::generate();
        let other = Wallet::generate();

        let mut tx = signed_tx(&wallet, &other.address, 5.0, 0);
        tx.sender = "not-an-address".to_string();
        tx.amount = 0.0;
        // Both the sender and the amount are bad; the address check comes
        // first.
        assert!(matches!(
            tx.validate(),
            Err(ChainError::InvalidAddress("sender"))
        ));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let wallet = Wallet::generate();
        let other = Wallet::generate();
        let valid = signed_tx(&wallet, &other.address, 5.0, 0);
        assert!(valid.validate().is_ok());

        let mut zero_amount = valid.clone();
        zero_amount.amount = 0.0;
        assert!(matches!(
            zero_amount.validate(),
            Err(ChainError::InvalidAmount)
        ));

        let mut nan_amount = valid.clone();
        nan_amount.amount = f64::NAN;
        assert!(matches!(
            nan_amount.validate(),
            Err(ChainError::InvalidAmount)
        ));

        let mut low_fee = valid.clone();
        low_fee.fee = MIN_TRANSACTION_FEE / 10.0;
        assert!(matches!(low_fee.validate(), Err(ChainError::InvalidFee)));

        let mut no_time = valid.clone();
        no_time.timestamp = 0;
        assert!(matches!(
            no_time.validate(),
            Err(ChainError::InvalidTimestamp)
        ));

        let mut unsigned = valid.clone();
        unsigned.signature = None;
        assert!(matches!(
            unsigned.validate(),
            Err(ChainError::MissingSignature)
        ));
    }

    #[test]
    fn validation_rejects_foreign_key_and_tampering() {
        let wallet = Wallet::generate();
        let mallory = Wallet::generate();
        let other = Wallet::generate();

        // Signed by mallory but claiming wallet's address as sender.
        let mut forged = signed_tx(&mallory, &other.address, 5.0, 0);
        forged.sender = wallet.address.clone();
        assert!(matches!(forged.validate(), Err(ChainError::KeyMismatch)));

        // Payload changed after signing.
        let mut tampered = signed_tx(&wallet, &other.address, 5.0, 0);
        tampered.amount = 500.0;
        assert!(matches!(
            tampered.validate(),
            Err(ChainError::InvalidSignature(_))
        ));
    }

    #[test]
    fn target_scales_inversely_with_difficulty() {
        assert_eq!(pow_target(0), *MAX_TARGET);
        assert_eq!(pow_target(1), *MAX_TARGET);
        assert_eq!(pow_target(2), MAX_TARGET.clone() / 2u32);
        assert!(pow_target(1000) < pow_target(10));
    }

    #[test]
    fn balance_scan_tracks_all_flows() {
        let miner = Wallet::generate();
        let sender = Wallet::generate();
        let recipient = Wallet::generate();

        let mut chain = Blockchain::new();
        let tx = signed_tx(&sender, &recipient.address, 10.0, 0);
        let fee = tx.fee;
        let template = Block::template(
            1,
            chain.tip().hash,
            GENESIS_TIMESTAMP + 60,
            vec![tx],
            1,
            block_reward(1),
        )
        .unwrap();
        chain
            .append_block(template.sealed(0, &miner.address))
            .unwrap();

        assert_eq!(
            chain.address_balance(&miner.address),
            Transaction::round_amount(50.0 + fee)
        );
        assert_eq!(chain.address_balance(&recipient.address), 10.0);
        assert_eq!(
            chain.address_balance(&sender.address),
            Transaction::round_amount(-(10.0 + fee))
        );
        assert_eq!(chain.total_supply, 50.0);
    }
}
