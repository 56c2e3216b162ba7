pub mod ledger;
pub mod mempool;
pub mod miner;
pub mod oracle;
pub mod pool;
pub mod protocol;
pub mod wallet;
