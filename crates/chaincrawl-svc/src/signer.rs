//! Creator / attestor recovery from XDPoS header seals.
//!
//! The block creator signs the keccak-256 of the RLP-encoded header with the
//! trailing 65-byte seal cut off `extraData`. The attestor signs the same hash
//! and puts its seal at the end of `validator`.

use alloy_primitives::{Signature, B256};
use alloy_rlp::{Encodable, Header};
use tiny_keccak::{Hasher, Keccak};
use tracing::debug;

use chaincrawl_core::chain::{decode_hex_bytes, parse_hex_u256, parse_hex_u64, ChainBlock};
use chaincrawl_core::model::BlockRow;

/// `r ‖ s ‖ v`
pub const SIGNATURE_LEN: usize = 65;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signers {
    pub creator: Option<String>,
    pub attestor: Option<String>,
}

/// Recover both signers. Missing or invalid seals yield `None`.
pub fn recover_signers(block: &ChainBlock) -> Signers {
    let extra = decode_hex_bytes(&block.extra_data).unwrap_or_default();
    let Some(hash) = seal_hash(block, &extra) else {
        return Signers::default();
    };

    let creator = recover(&hash, &extra[extra.len() - SIGNATURE_LEN..]);
    let attestor = block
        .validator
        .as_deref()
        .and_then(decode_hex_bytes)
        .filter(|v| v.len() >= SIGNATURE_LEN)
        .and_then(|v| recover(&hash, &v[v.len() - SIGNATURE_LEN..]));

    if creator.is_none() {
        debug!(block = block.number_u64(), "creator seal did not recover");
    }
    Signers { creator, attestor }
}

/// Fill `creator` / `attestor` of a row built from `block`.
pub fn apply_signers(row: &mut BlockRow, block: &ChainBlock) {
    let signers = recover_signers(block);
    row.creator = signers.creator;
    row.attestor = signers.attestor;
}

/// The hash both seals sign; `None` when `extra` is too short to hold a seal.
pub fn seal_hash(block: &ChainBlock, extra: &[u8]) -> Option<B256> {
    if extra.len() < SIGNATURE_LEN {
        return None;
    }
    let bytes = |s: &str| decode_hex_bytes(s).unwrap_or_default();
    let quantity = |s: &str| parse_hex_u256(s).unwrap_or_default();

    let mut payload = Vec::with_capacity(640);
    for field in [
        &block.parent_hash,
        &block.sha3_uncles,
        &block.miner,
        &block.state_root,
        &block.transactions_root,
        &block.receipts_root,
        &block.logs_bloom,
    ] {
        Encodable::encode(bytes(field).as_slice(), &mut payload);
    }
    Encodable::encode(&quantity(&block.difficulty), &mut payload);
    Encodable::encode(&quantity(&block.number), &mut payload);
    Encodable::encode(&parse_hex_u64(&block.gas_limit), &mut payload);
    Encodable::encode(&parse_hex_u64(&block.gas_used), &mut payload);
    Encodable::encode(&quantity(&block.timestamp), &mut payload);
    Encodable::encode(&extra[..extra.len() - SIGNATURE_LEN], &mut payload);
    Encodable::encode(bytes(&block.mix_hash).as_slice(), &mut payload);
    Encodable::encode(bytes(&block.nonce).as_slice(), &mut payload);

    let mut encoded = Vec::with_capacity(payload.len() + 4);
    Header { list: true, payload_length: payload.len() }.encode(&mut encoded);
    encoded.extend_from_slice(&payload);

    let mut out = [0u8; 32];
    let mut hasher = Keccak::v256();
    hasher.update(&encoded);
    hasher.finalize(&mut out);
    Some(B256::from(out))
}

fn recover(hash: &B256, seal: &[u8]) -> Option<String> {
    let signature = Signature::from_raw(seal).ok()?;
    let address = signature.recover_address_from_prehash(hash).ok()?;
    Some(format!("{address:#x}"))
}
