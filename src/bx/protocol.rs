use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bx::ledger::{hex_hash, Block, Transaction};

/// Upper bound on a single frame; anything larger is refused before the
/// payload is read.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message of {0} bytes exceeds limit")]
    Oversized(usize),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolJoin {
    pub wallet_address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SolutionSubmit {
    pub wallet_address: String,
    pub nonce: u64,
    #[serde(with = "hex_hash")]
    pub hash: [u8; 32],
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSubmit {
    pub transaction: Transaction,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolJoined {
    pub wallet_address: String,
    pub pool_size: usize,
    pub can_mine: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolUpdated {
    pub connected_wallets: Vec<String>,
    pub can_mine: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeNew {
    pub block_template: Block,
    pub difficulty: u64,
    pub target: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockMined {
    pub block: Block,
    pub miner: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SolutionRejected {
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionAccepted {
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionNew {
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub message: String,
}

/// Every frame on the wire, both directions, discriminated by its `type`
/// field.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PoolMessage {
    #[serde(rename = "pool:join")]
    PoolJoin(PoolJoin),
    #[serde(rename = "solution:submit")]
    SolutionSubmit(SolutionSubmit),
    #[serde(rename = "transaction:submit")]
    TransactionSubmit(TransactionSubmit),
    #[serde(rename = "pool:joined")]
    PoolJoined(PoolJoined),
    #[serde(rename = "pool:updated")]
    PoolUpdated(PoolUpdated),
    #[serde(rename = "challenge:new")]
    ChallengeNew(ChallengeNew),
    #[serde(rename = "block:mined")]
    BlockMined(BlockMined),
    #[serde(rename = "solution:rejected")]
    SolutionRejected(SolutionRejected),
    #[serde(rename = "transaction:accepted")]
    TransactionAccepted(TransactionAccepted),
    #[serde(rename = "transaction:new")]
    TransactionNew(TransactionNew),
    #[serde(rename = "error")]
    Error(ErrorMessage),
}

impl PoolMessage {
    pub fn error(message: impl Into<String>) -> Self {
        PoolMessage::Error(ErrorMessage {
            message: message.into(),
        })
    }

    pub fn rejection(reason: impl Into<String>) -> Self {
        PoolMessage::SolutionRejected(SolutionRejected {
            reason: reason.into(),
        })
    }
}

/// Read one length-prefixed JSON frame. The length is checked against
/// `MAX_MESSAGE_BYTES` before any payload byte is read, so an oversized
/// announcement costs nothing to refuse.
pub async fn read_message<R>(reader: &mut R) -> Result<PoolMessage, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::Oversized(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

pub async fn write_message<W>(writer: &mut W, message: &PoolMessage) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(message)?;
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let sent = PoolMessage::PoolJoin(PoolJoin {
            wallet_address: format!("BLIX{}", "ab".repeat(20)),
        });
        write_message(&mut client, &sent).await.unwrap();
        let received = read_message(&mut server).await.unwrap();
        assert_eq!(sent, received);
    }

    #[tokio::test]
    async fn solution_hash_travels_as_hex() {
        let sent = PoolMessage::SolutionSubmit(SolutionSubmit {
            wallet_address: format!("BLIX{}", "cd".repeat(20)),
            nonce: 42,
            hash: [7u8; 32],
        });
        let json = serde_json::to_value(&sent).unwrap();
        assert_eq!(json["type"], "solution:submit");
        assert_eq!(json["hash"], "07".repeat(32));
        assert_eq!(json["walletAddress"], format!("BLIX{}", "cd".repeat(20)));

        let back: PoolMessage = serde_json::from_value(json).unwrap();
        assert_eq!(sent, back);
    }

    #[tokio::test]
    async fn oversized_frame_is_refused_before_parse() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let announced = (MAX_MESSAGE_BYTES + 1) as u32;
        client
            .write_all(&announced.to_le_bytes())
            .await
            .unwrap();
        let err = read_message(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Oversized(n) if n == announced as usize));
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_malformed_errors() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let garbage = b"{not json";
        client
            .write_all(&(garbage.len() as u32).to_le_bytes())
            .await
            .unwrap();
        client.write_all(garbage).await.unwrap();
        assert!(matches!(
            read_message(&mut server).await.unwrap_err(),
            ProtocolError::Malformed(_)
        ));

        let unknown = br#"{"type":"pool:destroy"}"#;
        client
            .write_all(&(unknown.len() as u32).to_le_bytes())
            .await
            .unwrap();
        client.write_all(unknown).await.unwrap();
        assert!(matches!(
            read_message(&mut server).await.unwrap_err(),
            ProtocolError::Malformed(_)
        ));
    }
}
