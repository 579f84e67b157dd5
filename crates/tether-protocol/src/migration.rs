//! World state handed from an old channel process to its replacement.
//!
//! The payload travels inside a `DataTransferResponse` migration step as a
//! gzip-compressed MessagePack document.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::codec::ProtocolError;
use crate::control::CharacterId;

/// Largest inflated snapshot a replacement accepts (256 MiB).
pub const MAX_INFLATED_SIZE: u64 = 256 * 1024 * 1024;

/// Items lying on the ground of one map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapDrops {
    pub map_id: i32,
    /// Serialized drop pool, opaque to the cluster core.
    #[serde(with = "serde_bytes")]
    pub drops: Vec<u8>,
}

/// A party that has to survive the process swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRecord {
    pub party_id: i32,
    pub leader: CharacterId,
    pub members: Vec<CharacterId>,
}

/// Complete world state snapshot.
///
/// Only maps that currently hold drops are listed. The party section may be
/// absent on the wire, which restores as no parties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPayload {
    pub maps: Vec<MapDrops>,
    #[serde(default)]
    pub parties: Vec<PartyRecord>,
}

impl MigrationPayload {
    /// Serialize and gzip the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or compression fails.
    pub fn compress(&self) -> Result<Vec<u8>, ProtocolError> {
        let raw = rmp_serde::to_vec_named(self)?;
        let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    }

    /// Inflate and deserialize a snapshot produced by [`compress`](Self::compress).
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not valid gzip or not a snapshot.
    pub fn decompress(data: &[u8]) -> Result<Self, ProtocolError> {
        Self::decompress_within(data, MAX_INFLATED_SIZE)
    }

    /// Like [`decompress`](Self::decompress), refusing snapshots that
    /// inflate past `limit` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] if the data inflates past
    /// `limit`, or the error that made it unreadable.
    pub fn decompress_within(data: &[u8], limit: u64) -> Result<Self, ProtocolError> {
        let mut raw = Vec::new();
        GzDecoder::new(data)
            .take(limit.saturating_add(1))
            .read_to_end(&mut raw)?;
        if raw.len() as u64 > limit {
            return Err(ProtocolError::PayloadTooLarge(limit));
        }
        Ok(rmp_serde::from_slice(&raw)?)
    }

    /// Number of maps carrying drops.
    #[must_use]
    pub fn map_count(&self) -> usize {
        self.maps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_world_roundtrip() {
        let payload = MigrationPayload::default();
        let compressed = payload.compress().unwrap();
        let restored = MigrationPayload::decompress(&compressed).unwrap();
        assert_eq!(restored.map_count(), 0);
        assert!(restored.parties.is_empty());
    }

    #[test]
    fn test_world_with_drops_and_parties() {
        let payload = MigrationPayload {
            maps: vec![
                MapDrops {
                    map_id: 100_000_000,
                    drops: vec![1, 2, 3],
                },
                MapDrops {
                    map_id: 104_040_000,
                    drops: vec![0; 512],
                },
            ],
            parties: vec![PartyRecord {
                party_id: 7,
                leader: 11,
                members: vec![11, 12, 13],
            }],
        };

        let restored = MigrationPayload::decompress(&payload.compress().unwrap()).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_missing_party_section_restores_empty() {
        #[derive(Serialize)]
        struct MapsOnly {
            maps: Vec<MapDrops>,
        }

        let raw = rmp_serde::to_vec_named(&MapsOnly {
            maps: vec![MapDrops {
                map_id: 1,
                drops: vec![9],
            }],
        })
        .unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&raw).unwrap();
        let compressed = encoder.finish().unwrap();

        let restored = MigrationPayload::decompress(&compressed).unwrap();
        assert_eq!(restored.map_count(), 1);
        assert!(restored.parties.is_empty());
    }

    #[test]
    fn test_inflation_is_capped() {
        let payload = MigrationPayload {
            maps: vec![MapDrops {
                map_id: 1,
                drops: vec![0; 64 * 1024],
            }],
            parties: Vec::new(),
        };
        let compressed = payload.compress().unwrap();
        assert!(compressed.len() < 4 * 1024);

        match MigrationPayload::decompress_within(&compressed, 16 * 1024) {
            Err(ProtocolError::PayloadTooLarge(16_384)) => {}
            other => panic!("Expected PayloadTooLarge, got {:?}", other),
        }
        assert_eq!(
            MigrationPayload::decompress_within(&compressed, 128 * 1024).unwrap(),
            payload
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(MigrationPayload::decompress(b"definitely not gzip").is_err());
    }
}
