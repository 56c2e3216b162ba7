use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use log::{error, info, warn};
use num_bigint::BigUint;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

use crate::bx::ledger::{
    block_reward, pow_target, unix_now, Block, Blockchain, ChainError, ChainStatus, Transaction,
    MAX_TX_PER_BLOCK,
};
use crate::bx::mempool::Mempool;
use crate::bx::oracle::DifficultyOracle;
use crate::bx::protocol::{
    read_message, write_message, BlockMined, ChallengeNew, PoolJoined, PoolMessage, PoolUpdated,
    ProtocolError, TransactionAccepted, TransactionNew,
};
use crate::bx::wallet;

pub const MIN_POOL_SIZE: usize = 2;
pub const MEMBER_QUEUE_DEPTH: usize = 64;
pub const SUBMISSION_WINDOW_SECS: u64 = 10;
pub const MAX_SUBMISSIONS_PER_WINDOW: usize = 30;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid transaction: {0}")]
    Validation(String),
    #[error("duplicate transaction {0}")]
    Replay(String),
    #[error("transaction pool is full")]
    PoolFull,
    #[error("rate limit exceeded for {0}")]
    RateLimited(String),
    #[error("no active challenge")]
    StaleRound,
    #[error("{0}")]
    ConsensusMismatch(&'static str),
    #[error("wallet {0} already joined")]
    AlreadyJoined(String),
    #[error("malformed wallet address")]
    MalformedAddress,
    #[error("chain rejected block: {0}")]
    Chain(#[from] ChainError),
}

/// Sliding-window limiter keyed by wallet address. Submissions beyond the
/// cap inside one window are refused as transient.
#[derive(Debug)]
pub struct SubmissionLimiter {
    windows: DashMap<String, Vec<tokio::time::Instant>>,
    window_size: chrono::Duration,
    max_events: usize,
}

impl SubmissionLimiter {
    pub fn new(window_secs: u64, max_events: usize) -> Self {
        Self {
            windows: DashMap::new(),
            window_size: chrono::Duration::seconds(window_secs as i64),
            max_events,
        }
    }

    pub fn check_limit(&self, address: &str) -> bool {
        let now = tokio::time::Instant::now();
        let mut times = self
            .windows
            .entry(address.to_string())
            .or_insert_with(Vec::new);

        let window_secs = self.window_size.num_seconds() as u64;
        let cutoff = now - std::time::Duration::from_secs(window_secs);
        if !times.is_empty() && times[0] < cutoff {
            let first_valid = times
                .iter()
                .position(|&t| t >= cutoff)
                .unwrap_or(times.len());
            times.drain(0..first_valid);
        }

        if times.len() >= self.max_events {
            return false;
        }
        times.push(now);
        true
    }
}

/// The one live round, if any. Destroyed the instant a valid solution
/// commits; replaced only by `start_round`.
#[derive(Clone, Debug)]
pub struct MiningChallenge {
    pub template: Block,
    pub difficulty: u64,
    pub started_at: u64,
}

#[derive(Debug)]
pub struct Member {
    pub sender: mpsc::Sender<PoolMessage>,
    pub joined_at: u64,
}

#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub connected_wallets: Vec<String>,
    pub can_mine: bool,
    pub round_active: bool,
    pub pending_transactions: usize,
    pub chain_height: u64,
    pub total_supply: f64,
}

/// All coordinator state behind one lock. Every mutation goes through a
/// write guard, so exactly one submission at a time is ever evaluated
/// against the live round and the chain grows by exactly one block per
/// commit.
#[derive(Debug)]
pub struct PoolState {
    pub chain: Blockchain,
    pub mempool: Mempool,
    pub oracle: DifficultyOracle,
    pub challenge: Option<MiningChallenge>,
    pub members: HashMap<String, Member>,
    pub limiter: SubmissionLimiter,
    pub min_pool_size: usize,
}

impl PoolState {
    pub fn new(min_pool_size: usize) -> Self {
        Self::with_limits(min_pool_size, SUBMISSION_WINDOW_SECS, MAX_SUBMISSIONS_PER_WINDOW)
    }

    pub fn with_limits(min_pool_size: usize, window_secs: u64, max_per_window: usize) -> Self {
        Self {
            chain: Blockchain::new(),
            mempool: Mempool::new(),
            oracle: DifficultyOracle::new(),
            challenge: None,
            members: HashMap::new(),
            limiter: SubmissionLimiter::new(window_secs, max_per_window),
            min_pool_size,
        }
    }

    pub fn can_mine(&self) -> bool {
        self.members.len() >= self.min_pool_size
    }

    /// Best-effort push to every connected member. A full or closed queue
    /// loses the event for that member only; the writer task notices closure
    /// on its own.
    fn fan_out(&self, message: &PoolMessage) {
        for member in self.members.values() {
            let _ = member.sender.try_send(message.clone());
        }
    }

    fn pool_updated(&self) -> PoolMessage {
        PoolMessage::PoolUpdated(PoolUpdated {
            connected_wallets: self.members.keys().cloned().collect(),
            can_mine: self.can_mine(),
        })
    }

    pub fn join(
        &mut self,
        address: &str,
        sender: mpsc::Sender<PoolMessage>,
    ) -> Result<(), PoolError> {
        wallet::validate_address(address).map_err(|_| PoolError::MalformedAddress)?;
        if self.members.contains_key(address) {
            return Err(PoolError::AlreadyJoined(address.to_string()));
        }

        self.members.insert(
            address.to_string(),
            Member {
                sender: sender.clone(),
                joined_at: unix_now(),
            },
        );
        info!("wallet {} joined, pool size {}", address, self.members.len());

        let _ = sender.try_send(PoolMessage::PoolJoined(PoolJoined {
            wallet_address: address.to_string(),
            pool_size: self.members.len(),
            can_mine: self.can_mine(),
        }));
        self.fan_out(&self.pool_updated());

        // Only the crossing into a sufficient pool starts a round; further
        // joins while one is live change nothing.
        if self.can_mine() && self.challenge.is_none() {
            self.start_round();
        }
        Ok(())
    }

    pub fn leave(&mut self, address: &str) {
        if self.members.remove(address).is_none() {
            return;
        }
        info!("wallet {} left, pool size {}", address, self.members.len());
        if !self.can_mine() && self.challenge.is_some() {
            // Not enough participants to race; the open round is void.
            self.challenge = None;
            info!("pool below minimum size, round voided");
        }
        self.fan_out(&self.pool_updated());
    }

    /// Open a round if none is live and the pool is big enough. Builds the
    /// template off the current tip, fixes the difficulty for the round and
    /// announces the challenge to everyone.
    pub fn start_round(&mut self) -> Option<ChallengeNew> {
        if self.challenge.is_some() || !self.can_mine() {
            return None;
        }
        let now = unix_now();
        let index = self.chain.height();
        let difficulty = self.oracle.next_difficulty(&self.chain, now);
        let transactions = self.mempool.take_for_block(MAX_TX_PER_BLOCK);
        let template = match Block::template(
            index,
            self.chain.tip().hash,
            now,
            transactions,
            difficulty,
            block_reward(index),
        ) {
            Ok(template) => template,
            Err(e) => {
                error!("failed to build block template: {}", e);
                return None;
            }
        };

        let payload = ChallengeNew {
            block_template: template.clone(),
            difficulty,
            target: format!("{:064x}", pow_target(difficulty)),
        };
        self.challenge = Some(MiningChallenge {
            template,
            difficulty,
            started_at: now,
        });
        info!(
            "round opened: height {} difficulty {} with {} transaction(s)",
            index,
            difficulty,
            self.challenge.as_ref().map_or(0, |c| c.template.transactions.len())
        );
        self.fan_out(&PoolMessage::ChallengeNew(payload.clone()));
        Some(payload)
    }

    /// Evaluate one submission against the live round. The challenge is
    /// taken out of the state before the block is committed, so by the time
    /// any later submission is looked at the round no longer exists: at most
    /// one winner.
    pub fn submit_solution(
        &mut self,
        address: &str,
        nonce: u64,
        hash: [u8; 32],
    ) -> Result<BlockMined, PoolError> {
        if !self.limiter.check_limit(address) {
            return Err(PoolError::RateLimited(address.to_string()));
        }
        let challenge = self.challenge.as_ref().ok_or(PoolError::StaleRound)?;

        let computed = challenge.template.header_hash_with(nonce, address);
        if computed != hash {
            return Err(PoolError::ConsensusMismatch("hash mismatch"));
        }
        if BigUint::from_bytes_be(&hash) >= pow_target(challenge.difficulty) {
            return Err(PoolError::ConsensusMismatch("does not meet target"));
        }

        let challenge = self.challenge.take().expect("challenge checked above");
        let block = challenge.template.sealed(nonce, address);
        // A failure past this point is an invariant violation; the round is
        // already gone, the chain untouched.
        self.chain.append_block(block.clone())?;
        self.mempool.mark_processed(&block.transactions);
        info!(
            "block {} committed by {} ({} tx, reward {})",
            block.index,
            address,
            block.transactions.len(),
            block.reward
        );

        let event = BlockMined {
            block,
            miner: address.to_string(),
        };
        self.fan_out(&PoolMessage::BlockMined(event.clone()));
        Ok(event)
    }

    pub fn submit_transaction(&mut self, tx: Transaction) -> Result<String, PoolError> {
        if !self.limiter.check_limit(&tx.sender) {
            return Err(PoolError::RateLimited(tx.sender));
        }
        let id = self.mempool.submit(tx)?;
        self.fan_out(&PoolMessage::TransactionNew(TransactionNew {
            id: id.clone(),
        }));
        Ok(id)
    }

    // Read-only query surface, consumed by the REST layer.

    pub fn pool_status(&self) -> PoolStatus {
        PoolStatus {
            connected_wallets: self.members.keys().cloned().collect(),
            can_mine: self.can_mine(),
            round_active: self.challenge.is_some(),
            pending_transactions: self.mempool.pending_count(),
            chain_height: self.chain.height(),
            total_supply: self.chain.total_supply,
        }
    }

    pub fn chain_status(&self) -> ChainStatus {
        self.chain.status()
    }

    pub fn latest_block(&self) -> &Block {
        self.chain.tip()
    }

    pub fn block_by_height(&self, height: u64) -> Option<&Block> {
        self.chain.get_block(height)
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.mempool.pending_transactions()
    }

    pub fn address_balance(&self, address: &str) -> f64 {
        self.chain.address_balance(address)
    }
}

pub struct PoolServer {
    state: Arc<RwLock<PoolState>>,
}

impl PoolServer {
    pub fn new(min_pool_size: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(PoolState::new(min_pool_size))),
        }
    }

    pub fn from_config(config: &crate::config::PoolConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(PoolState::with_limits(
                config.min_pool_size,
                config.submission_window_secs,
                config.submissions_per_window,
            ))),
        }
    }

    pub fn state(&self) -> Arc<RwLock<PoolState>> {
        self.state.clone()
    }

    pub async fn run(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("pool listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            let state = self.state.clone();
            tokio::spawn(async move {
                handle_connection(state, stream, addr).await;
            });
        }
    }
}

async fn handle_connection(state: Arc<RwLock<PoolState>>, stream: TcpStream, addr: SocketAddr) {
    let (mut reader, mut writer) = stream.into_split();
    let (sender, mut outbound) = mpsc::channel::<PoolMessage>(MEMBER_QUEUE_DEPTH);

    // Each connection drains its own queue; a slow socket only stalls
    // itself.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if write_message(&mut writer, &message).await.is_err() {
                break;
            }
        }
    });

    let mut joined: Option<String> = None;
    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                handle_client_message(&state, &sender, &mut joined, message).await;
            }
            Err(ProtocolError::Malformed(e)) => {
                warn!("malformed message from {}: {}", addr, e);
                let _ = sender.try_send(PoolMessage::error("malformed message"));
            }
            Err(ProtocolError::Oversized(len)) => {
                warn!("oversized message from {} ({} bytes)", addr, len);
                let _ = sender.try_send(PoolMessage::error("message too large"));
                break;
            }
            Err(ProtocolError::Io(_)) => break,
        }
    }

    if let Some(address) = joined {
        state.write().await.leave(&address);
    }
    drop(sender);
    let _ = writer_task.await;
}

async fn handle_client_message(
    state: &Arc<RwLock<PoolState>>,
    sender: &mpsc::Sender<PoolMessage>,
    joined: &mut Option<String>,
    message: PoolMessage,
) {
    match message {
        PoolMessage::PoolJoin(join) => {
            if joined.is_some() {
                let _ = sender.try_send(PoolMessage::error("already joined on this connection"));
                return;
            }
            let mut st = state.write().await;
            match st.join(&join.wallet_address, sender.clone()) {
                Ok(()) => *joined = Some(join.wallet_address),
                Err(e) => {
                    let _ = sender.try_send(PoolMessage::error(e.to_string()));
                }
            }
        }
        PoolMessage::SolutionSubmit(submit) => {
            let mut st = state.write().await;
            match st.submit_solution(&submit.wallet_address, submit.nonce, submit.hash) {
                Ok(_) => {
                    // Straight into the next round while everyone is warm.
                    st.start_round();
                }
                Err(e) => {
                    let _ = sender.try_send(PoolMessage::rejection(e.to_string()));
                }
            }
        }
        PoolMessage::TransactionSubmit(submit) => {
            let mut st = state.write().await;
            match st.submit_transaction(submit.transaction) {
                Ok(id) => {
                    let _ = sender.try_send(PoolMessage::TransactionAccepted(TransactionAccepted {
                        id,
                    }));
                }
                Err(e) => {
                    let _ = sender.try_send(PoolMessage::error(e.to_string()));
                }
            }
        }
        // Coordinator-to-client message types have no meaning inbound.
        _ => {
            let _ = sender.try_send(PoolMessage::error("unexpected message type"));
        }
    }
}
