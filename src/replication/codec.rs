//! Conversion between storage WAL entries and their wire form.
//!
//! With a cipher configured, the key and value travel inside the `sealed`
//! field (bincode of the pair, AEAD-wrapped); routing fields stay in the
//! clear so servers can partition streams without the key.

use super::crypto::EntryCipher;
use super::proto;
use crate::error::{ReplicationError, Result};
use crate::types::Timestamp;
use crate::wal::{WalEntry, WalOperation};

/// Encodes a WAL entry for the wire.
pub fn encode_entry(entry: &WalEntry, cipher: Option<&EntryCipher>) -> Result<proto::WalEntry> {
    let mut message = proto::WalEntry {
        seq_num: entry.seq_num,
        tenant_id: entry.tenant_id.clone(),
        tablespace: entry.tablespace.clone(),
        operation: match entry.operation {
            WalOperation::Put => proto::Operation::Put as i32,
            WalOperation::Delete => proto::Operation::Delete as i32,
        },
        key: entry.key.clone(),
        value: entry.value.clone(),
        timestamp: entry.timestamp.as_micros(),
        source_peer_id: entry.source_peer_id.clone(),
        sealed: Vec::new(),
    };

    if let Some(cipher) = cipher {
        let plaintext = bincode::serialize(&(&entry.key, &entry.value))
            .map_err(|e| ReplicationError::InvalidEntry(e.to_string()))?;
        message.sealed = cipher.seal(&plaintext)?;
        message.key = Vec::new();
        message.value = Vec::new();
    }

    Ok(message)
}

/// Decodes a wire entry back into its storage form.
pub fn decode_entry(message: proto::WalEntry, cipher: Option<&EntryCipher>) -> Result<WalEntry> {
    let operation = WalOperation::from_u32(message.operation as u32).ok_or_else(|| {
        ReplicationError::InvalidEntry(format!("unknown operation {}", message.operation))
    })?;

    let (key, value) = if !message.sealed.is_empty() {
        let cipher = cipher.ok_or_else(|| {
            ReplicationError::InvalidEntry("sealed entry but no key configured".into())
        })?;
        let plaintext = cipher.open(&message.sealed)?;
        bincode::deserialize::<(Vec<u8>, Vec<u8>)>(&plaintext)
            .map_err(|e| ReplicationError::InvalidEntry(e.to_string()))?
    } else {
        (message.key, message.value)
    };

    Ok(WalEntry {
        seq_num: message.seq_num,
        tenant_id: message.tenant_id,
        tablespace: message.tablespace,
        operation,
        key,
        value,
        timestamp: Timestamp::from_micros(message.timestamp),
        source_peer_id: message.source_peer_id,
    })
}
