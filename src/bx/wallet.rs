use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ADDRESS_PREFIX: &str = "BLIX";
pub const ADDRESS_HEX_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("malformed address")]
    MalformedAddress,
    #[error("bad hex encoding: {0}")]
    BadHex(#[from] hex::FromHexError),
    #[error("bad key material: {0}")]
    BadKey(String),
    #[error("bad signature encoding")]
    BadSignature,
}

/// Pool address for a public key: the BLIX network tag followed by the
/// first 20 bytes of SHA-256 over the raw key, hex encoded.
pub fn derive_address(public_key_bytes: &[u8]) -> String {
    let digest = Sha256::digest(public_key_bytes);
    format!("{}{}", ADDRESS_PREFIX, hex::encode(&digest[..20]))
}

/// Prefix plus exactly 40 lowercase hex characters; nothing else joins the
/// pool.
pub fn validate_address(address: &str) -> Result<(), WalletError> {
    let payload = address
        .strip_prefix(ADDRESS_PREFIX)
        .ok_or(WalletError::MalformedAddress)?;
    if payload.len() != ADDRESS_HEX_LEN {
        return Err(WalletError::MalformedAddress);
    }
    if !payload
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(WalletError::MalformedAddress);
    }
    Ok(())
}

pub fn verify_signature(
    message: &[u8],
    signature_hex: &str,
    public_key_hex: &str,
) -> Result<bool, WalletError> {
    let key_bytes = hex::decode(public_key_hex)?;
    let key_arr: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| WalletError::BadKey("expected 32 byte ed25519 key".into()))?;
    let key = VerifyingKey::from_bytes(&key_arr).map_err(|e| WalletError::BadKey(e.to_string()))?;

    let sig_bytes = hex::decode(signature_hex)?;
    let sig_arr: [u8; 64] = sig_bytes.try_into().map_err(|_| WalletError::BadSignature)?;
    let signature = Signature::from_bytes(&sig_arr);

    Ok(key.verify(message, &signature).is_ok())
}

pub struct Wallet {
    signing_key: SigningKey,
    pub address: String,
}

impl Wallet {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let address = derive_address(signing_key.verifying_key().as_bytes());
        Wallet {
            signing_key,
            address,
        }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn sign_payload(&self, payload: &[u8]) -> String {
        hex::encode(self.signing_key.sign(payload).to_bytes())
    }
}
