use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indicatif::ProgressBar;
use log::{info, warn};
use num_bigint::BigUint;
use rayon::prelude::*;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::bx::ledger::{pow_target, Block};
use crate::bx::protocol::{
    read_message, write_message, ChallengeNew, PoolJoin, PoolMessage, ProtocolError,
    SolutionSubmit,
};
use crate::bx::wallet;

/// Nonces scanned between cancellation checks, per worker lane.
pub const HASH_BATCH_SIZE: u64 = 4_096;

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invalid wallet address: {0}")]
    InvalidAddress(String),
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub nonce: u64,
    pub hash: [u8; 32],
    pub attempts: u64,
    pub elapsed: Duration,
}

impl SearchOutcome {
    pub fn hash_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.attempts as f64 / secs
        } else {
            self.attempts as f64
        }
    }
}

/// Scan nonces until one hashes under the target or the flag is raised.
/// Lane `i` takes nonces `i, i+lanes, i+2*lanes, ...`; each lane re-checks
/// `cancel` after every `HASH_BATCH_SIZE` attempts, so a superseded
/// challenge stops the whole search within one batch.
pub fn search_nonce(
    template: &Block,
    miner: &str,
    target: &BigUint,
    lanes: usize,
    cancel: &AtomicBool,
    progress: Option<&ProgressBar>,
) -> Option<SearchOutcome> {
    let lanes = lanes.max(1) as u64;
    let found = AtomicBool::new(false);
    let attempts = AtomicU64::new(0);
    let winner: Mutex<Option<(u64, [u8; 32])>> = Mutex::new(None);
    let started = Instant::now();

    (0..lanes).into_par_iter().for_each(|lane| {
        let mut nonce = lane;
        loop {
            if cancel.load(Ordering::Relaxed) || found.load(Ordering::Relaxed) {
                return;
            }
            for _ in 0..HASH_BATCH_SIZE {
                let hash = template.header_hash_with(nonce, miner);
                if BigUint::from_bytes_be(&hash) < *target {
                    if !found.swap(true, Ordering::SeqCst) {
                        *winner.lock().expect("winner lock poisoned") = Some((nonce, hash));
                    }
                    return;
                }
                nonce = nonce.wrapping_add(lanes);
            }
            let total = attempts.fetch_add(HASH_BATCH_SIZE, Ordering::Relaxed) + HASH_BATCH_SIZE;
            if lane == 0 {
                if let Some(pb) = progress {
                    let secs = started.elapsed().as_secs_f64().max(0.001);
                    pb.set_message(format!("{:.0} H/s", total as f64 / secs));
                }
            }
        }
    });

    let (nonce, hash) = (*winner.lock().expect("winner lock poisoned"))?;
    Some(SearchOutcome {
        nonce,
        hash,
        attempts: attempts.load(Ordering::Relaxed).max(1),
        elapsed: started.elapsed(),
    })
}

/// A participant: joins the pool, runs one cancellable search per challenge
/// and submits whatever it finds.
pub struct MinerClient {
    address: String,
    lanes: usize,
}

impl MinerClient {
    pub fn new(address: String, lanes: usize) -> Result<Self, MinerError> {
        wallet::validate_address(&address).map_err(|_| MinerError::InvalidAddress(address.clone()))?;
        Ok(Self { address, lanes })
    }

    pub async fn run(&self, coordinator: &str) -> Result<(), MinerError> {
        let stream = TcpStream::connect(coordinator).await?;
        let (mut reader, mut writer) = stream.into_split();
        info!("connected to pool at {}", coordinator);

        write_message(
            &mut writer,
            &PoolMessage::PoolJoin(PoolJoin {
                wallet_address: self.address.clone(),
            }),
        )
        .await?;

        // The socket reader runs apart from the dispatch loop so a write
        // never tears a frame mid-read.
        let (inbound_tx, mut inbound) = mpsc::channel::<PoolMessage>(64);
        tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(message) => {
                        if inbound_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let (solution_tx, mut solutions) = mpsc::channel::<(u64, [u8; 32])>(4);
        let mut active_search: Option<Arc<AtomicBool>> = None;

        loop {
            tokio::select! {
                maybe = inbound.recv() => {
                    let Some(message) = maybe else {
                        info!("pool connection closed");
                        break;
                    };
                    self.handle_pool_message(message, &mut active_search, &solution_tx);
                }
                Some((nonce, hash)) = solutions.recv() => {
                    write_message(
                        &mut writer,
                        &PoolMessage::SolutionSubmit(SolutionSubmit {
                            wallet_address: self.address.clone(),
                            nonce,
                            hash,
                        }),
                    )
                    .await?;
                }
            }
        }

        if let Some(cancel) = active_search.take() {
            cancel.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    fn handle_pool_message(
        &self,
        message: PoolMessage,
        active_search: &mut Option<Arc<AtomicBool>>,
        solution_tx: &mpsc::Sender<(u64, [u8; 32])>,
    ) {
        match message {
            PoolMessage::PoolJoined(joined) => {
                info!(
                    "joined pool as {} ({} connected, mining {})",
                    joined.wallet_address,
                    joined.pool_size,
                    if joined.can_mine { "active" } else { "paused" }
                );
            }
            PoolMessage::PoolUpdated(update) => {
                if !update.can_mine {
                    if let Some(cancel) = active_search.take() {
                        cancel.store(true, Ordering::Relaxed);
                        info!("pool below minimum size, search cancelled");
                    }
                }
            }
            PoolMessage::ChallengeNew(challenge) => {
                self.start_search(challenge, active_search, solution_tx.clone());
            }
            PoolMessage::BlockMined(mined) => {
                if mined.miner == self.address {
                    info!("block {} is ours, reward {}", mined.block.index, mined.block.reward);
                } else {
                    info!("block {} won by {}", mined.block.index, mined.miner);
                }
            }
            PoolMessage::SolutionRejected(rejected) => {
                warn!("solution rejected: {}", rejected.reason);
            }
            PoolMessage::Error(err) => {
                warn!("pool error: {}", err.message);
            }
            _ => {}
        }
    }

    // A fresh challenge makes every in-flight search stale: flip its flag
    // first, then launch the new one under its own flag.
    fn start_search(
        &self,
        challenge: ChallengeNew,
        active_search: &mut Option<Arc<AtomicBool>>,
        solution_tx: mpsc::Sender<(u64, [u8; 32])>,
    ) {
        if let Some(previous) = active_search.take() {
            previous.store(true, Ordering::Relaxed);
        }
        let cancel = Arc::new(AtomicBool::new(false));
        *active_search = Some(cancel.clone());

        info!(
            "new challenge: height {} difficulty {}",
            challenge.block_template.index, challenge.difficulty
        );

        let template = challenge.block_template;
        let target = pow_target(challenge.difficulty);
        let miner = self.address.clone();
        let lanes = self.lanes;

        tokio::task::spawn_blocking(move || {
            let spinner = ProgressBar::new_spinner();
            spinner.enable_steady_tick(Duration::from_millis(120));
            spinner.set_message("searching...");
            let outcome = search_nonce(&template, &miner, &target, lanes, &cancel, Some(&spinner));
            spinner.finish_and_clear();

            if let Some(outcome) = outcome {
                info!(
                    "solution found: nonce {} after {} hashes ({:.0} H/s)",
                    outcome.nonce,
                    outcome.attempts,
                    outcome.hash_rate()
                );
                let _ = solution_tx.blocking_send((outcome.nonce, outcome.hash));
            }
        });
    }
}
