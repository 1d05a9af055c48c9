//! Decoding of chain-native SCALE payloads.
//!
//! Events are decoded into the closed [`ChainEvent`] set through the runtime
//! metadata of the block being read. Storage values and call arguments have
//! fixed layouts and decode through derived codecs.

use crate::{
    connection::MetadataSnapshot,
    primitives::BlockHash,
};

use moka::sync::Cache;
use parity_scale_codec::{
    Compact,
    Decode,
    Encode,
};
use std::collections::BTreeMap;
use subxt::{
    Metadata,
    SubstrateConfig,
    events::{
        Events,
        Phase as EventPhase,
    },
};

pub type AccountId = [u8; 32];

const PARSED_METADATA_CACHE: u64 = 8;
const EXTRINSIC_VERSION: u8 = 4;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid runtime metadata")]
    Metadata(#[source] parity_scale_codec::Error),
    #[error("failed to decode events: {0}")]
    Events(String),
    #[error("failed to decode {what}")]
    Codec {
        what: &'static str,
        #[source]
        source: parity_scale_codec::Error,
    },
    #[error("unsupported extrinsic: {0}")]
    Extrinsic(&'static str),
}

fn decode_as<T: Decode>(what: &'static str, mut input: &[u8]) -> Result<T, DecodeError> {
    T::decode(&mut input).map_err(|source| DecodeError::Codec { what, source })
}

/// Decodes a storage value of a fixed layout.
pub fn decode_storage<T: Decode>(what: &'static str, bytes: &[u8]) -> Result<T, DecodeError> {
    decode_as(what, bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum Phase {
    ApplyExtrinsic(u32),
    Finalization,
    Initialization,
}

/// Events the indexer reacts to. Everything else collapses into `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ChainEvent {
    FileSuccess { cid: Vec<u8> },
    RenewFileSuccess { cid: Vec<u8> },
    /// Emitted by `market.update_replicas`. The cids live in the call arguments.
    UpdateReplicasSuccess { extrinsic: u32 },
    /// Emitted by `swork.report_works`. The cids live in the call arguments.
    WorksReportSuccess { extrinsic: u32 },
    IllegalFileClosed { cid: Vec<u8> },
    FileClosed { cid: Vec<u8> },
    CodeUpdated,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct EventRecord {
    pub phase: Phase,
    pub event: ChainEvent,
}

/// Which call carries the replica updates of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaSource {
    Market,
    Swork,
}

pub trait EventDecoder: Send + Sync {
    /// Decodes the raw `System.Events` value using `metadata`.
    fn decode_events(
        &self,
        raw: &[u8],
        metadata: &MetadataSnapshot,
    ) -> Result<Vec<EventRecord>, DecodeError>;

    /// Extracts the cids touched by a replica-updating extrinsic.
    fn replica_update_cids(
        &self,
        extrinsic: &[u8],
        source: ReplicaSource,
    ) -> Result<Vec<Vec<u8>>, DecodeError>;
}

/// Maps a pallet event onto [`ChainEvent`] from its raw field bytes.
pub fn classify_event(
    pallet: &str,
    variant: &str,
    fields: &[u8],
    phase: Phase,
) -> Result<ChainEvent, DecodeError> {
    let extrinsic = match phase {
        Phase::ApplyExtrinsic(index) => Some(index),
        Phase::Finalization | Phase::Initialization => None,
    };

    let event = match (pallet, variant) {
        ("Market", "FileSuccess") => {
            let (_, cid) = decode_as::<(AccountId, Vec<u8>)>("Market.FileSuccess", fields)?;
            ChainEvent::FileSuccess { cid }
        }
        ("Market", "RenewFileSuccess") => {
            let (_, cid) = decode_as::<(AccountId, Vec<u8>)>("Market.RenewFileSuccess", fields)?;
            ChainEvent::RenewFileSuccess { cid }
        }
        ("Market", "IllegalFileClosed") => {
            ChainEvent::IllegalFileClosed {
                cid: decode_as("Market.IllegalFileClosed", fields)?,
            }
        }
        ("Market", "FileClosed") => {
            ChainEvent::FileClosed {
                cid: decode_as("Market.FileClosed", fields)?,
            }
        }
        ("Market", "UpdateReplicasSuccess") => {
            extrinsic.map_or(ChainEvent::Unknown, |extrinsic| {
                ChainEvent::UpdateReplicasSuccess { extrinsic }
            })
        }
        ("Swork", "WorksReportSuccess") => {
            extrinsic.map_or(ChainEvent::Unknown, |extrinsic| {
                ChainEvent::WorksReportSuccess { extrinsic }
            })
        }
        ("System", "CodeUpdated") => ChainEvent::CodeUpdated,
        _ => ChainEvent::Unknown,
    };
    Ok(event)
}

/// Production decoder. Parsed metadata is cached per snapshot.
pub struct ScaleDecoder {
    parsed: Cache<BlockHash, Metadata>,
}

impl Default for ScaleDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScaleDecoder {
    pub fn new() -> Self {
        Self {
            parsed: Cache::new(PARSED_METADATA_CACHE),
        }
    }

    fn parsed_metadata(&self, snapshot: &MetadataSnapshot) -> Result<Metadata, DecodeError> {
        if let Some(metadata) = self.parsed.get(&snapshot.at) {
            return Ok(metadata);
        }
        let metadata = Metadata::decode(&mut snapshot.bytes.as_slice()).map_err(DecodeError::Metadata)?;
        self.parsed.insert(snapshot.at, metadata.clone());
        Ok(metadata)
    }
}

impl EventDecoder for ScaleDecoder {
    fn decode_events(
        &self,
        raw: &[u8],
        snapshot: &MetadataSnapshot,
    ) -> Result<Vec<EventRecord>, DecodeError> {
        let metadata = self.parsed_metadata(snapshot)?;
        let events = Events::<SubstrateConfig>::decode_from(raw.to_vec(), metadata);

        let mut records = Vec::new();
        for details in events.iter() {
            let details = details.map_err(|e| DecodeError::Events(e.to_string()))?;
            let phase = match details.phase() {
                EventPhase::ApplyExtrinsic(index) => Phase::ApplyExtrinsic(index),
                EventPhase::Finalization => Phase::Finalization,
                EventPhase::Initialization => Phase::Initialization,
            };
            let event = classify_event(
                details.pallet_name(),
                details.variant_name(),
                details.field_bytes(),
                phase,
            )?;
            records.push(EventRecord { phase, event });
        }
        Ok(records)
    }

    fn replica_update_cids(
        &self,
        extrinsic: &[u8],
        source: ReplicaSource,
    ) -> Result<Vec<Vec<u8>>, DecodeError> {
        let args = call_args(extrinsic)?;
        match source {
            ReplicaSource::Market => {
                let call: UpdateReplicasCall = decode_as("market.update_replicas", args)?;
                Ok(call.files.into_iter().map(|file| file.cid).collect())
            }
            ReplicaSource::Swork => {
                let call: ReportWorksCall = decode_as("swork.report_works", args)?;
                Ok(call
                    .added_files
                    .into_iter()
                    .chain(call.deleted_files)
                    .map(|file| file.cid)
                    .collect())
            }
        }
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, Encode, Decode)]
enum MultiAddress {
    Id(AccountId),
    Index(#[codec(compact)] u32),
    Raw(Vec<u8>),
    Address32([u8; 32]),
    Address20([u8; 20]),
}

#[allow(dead_code)]
#[derive(Debug, Clone, Encode, Decode)]
enum MultiSignature {
    Ed25519([u8; 64]),
    Sr25519([u8; 64]),
    Ecdsa([u8; 65]),
}

/// Strips the envelope of an opaque (length prefixed) v4 extrinsic and
/// returns the call arguments that follow the pallet and call indices.
fn call_args(extrinsic: &[u8]) -> Result<&[u8], DecodeError> {
    let mut input = extrinsic;
    Compact::<u32>::decode(&mut input).map_err(|source| DecodeError::Codec {
        what: "extrinsic length",
        source,
    })?;

    let version = decode_next::<u8>("extrinsic version", &mut input)?;
    if version & 0b0111_1111 != EXTRINSIC_VERSION {
        return Err(DecodeError::Extrinsic("only v4 extrinsics are supported"));
    }

    if version & 0b1000_0000 != 0 {
        decode_next::<MultiAddress>("extrinsic signer", &mut input)?;
        decode_next::<MultiSignature>("extrinsic signature", &mut input)?;
        let era = decode_next::<u8>("extrinsic era", &mut input)?;
        if era != 0 {
            decode_next::<u8>("extrinsic era", &mut input)?;
        }
        decode_next::<Compact<u32>>("extrinsic nonce", &mut input)?;
        decode_next::<Compact<u128>>("extrinsic tip", &mut input)?;
    }

    decode_next::<(u8, u8)>("call index", &mut input)?;
    Ok(input)
}

fn decode_next<T: Decode>(what: &'static str, input: &mut &[u8]) -> Result<T, DecodeError> {
    T::decode(input).map_err(|source| DecodeError::Codec { what, source })
}

/// `Market.FilesV2` value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct FileInfoV2 {
    pub file_size: u64,
    pub spower: u64,
    pub expired_at: u32,
    pub calculated_at: u32,
    pub amount: u128,
    pub prepaid: u128,
    pub reported_replica_count: u32,
    pub remaining_paid_count: u32,
    pub replicas: BTreeMap<AccountId, Replica>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct Replica {
    pub who: AccountId,
    pub valid_at: u32,
    pub anchor: Vec<u8>,
    pub is_reported: bool,
    pub created_at: Option<u32>,
}

/// `Swork.WorkReports` value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct WorkReportInfo {
    pub report_slot: u64,
    pub spower: u64,
    pub free: u64,
    pub reported_files_size: u64,
    pub reported_srd_root: Vec<u8>,
    pub reported_files_root: Vec<u8>,
}

/// `Swork.Groups` value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct GroupInfo {
    pub members: Vec<AccountId>,
    pub allowlist: Vec<AccountId>,
}

/// `Swork.Identities` value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct Identity {
    pub anchor: Vec<u8>,
    pub punishment_deadline: u64,
    pub group: Option<AccountId>,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct UpdateReplicasCall {
    pub files: Vec<ReplicaUpdate>,
    pub last_processed_block_wrs: u32,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ReplicaUpdate {
    pub cid: Vec<u8>,
    pub file_size: u64,
    pub replicas: Vec<ReplicaChange>,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ReplicaChange {
    pub reporter: AccountId,
    pub owner: AccountId,
    pub anchor: Vec<u8>,
    pub report_slot: u64,
    pub report_block: u32,
    pub valid_at: u32,
    pub is_added: bool,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ReportWorksCall {
    pub curr_pk: Vec<u8>,
    pub ab_upgrade_pk: Vec<u8>,
    pub slot: u64,
    pub slot_hash: Vec<u8>,
    pub reported_srd_size: u64,
    pub reported_files_size: u64,
    pub added_files: Vec<ReportedFile>,
    pub deleted_files: Vec<ReportedFile>,
    pub reported_srd_root: Vec<u8>,
    pub reported_files_root: Vec<u8>,
    pub sig: Vec<u8>,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ReportedFile {
    pub cid: Vec<u8>,
    pub size: u64,
    pub valid_at: u64,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Wraps call arguments into an opaque extrinsic.
    pub(crate) fn extrinsic(signed: bool, pallet: u8, call: u8, args: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        if signed {
            body.push(0b1000_0000 | EXTRINSIC_VERSION);
            MultiAddress::Id([1u8; 32]).encode_to(&mut body);
            MultiSignature::Sr25519([2u8; 64]).encode_to(&mut body);
            body.extend_from_slice(&[0x15, 0x01]);
            Compact(7u32).encode_to(&mut body);
            Compact(0u128).encode_to(&mut body);
        } else {
            body.push(EXTRINSIC_VERSION);
        }
        body.push(pallet);
        body.push(call);
        body.extend_from_slice(args);
        body.encode()
    }

    pub(crate) fn update_replicas_args(cids: &[&str]) -> Vec<u8> {
        UpdateReplicasCall {
            files: cids
                .iter()
                .map(|cid| ReplicaUpdate {
                    cid: cid.as_bytes().to_vec(),
                    file_size: 1,
                    replicas: vec![ReplicaChange {
                        reporter: [3u8; 32],
                        owner: [3u8; 32],
                        anchor: b"def".to_vec(),
                        report_slot: 1,
                        report_block: 2,
                        valid_at: 3,
                        is_added: true,
                    }],
                })
                .collect(),
            last_processed_block_wrs: 666,
        }
        .encode()
    }

    pub(crate) fn report_works_args(added: &[&str], deleted: &[&str]) -> Vec<u8> {
        let files = |cids: &[&str]| {
            cids.iter()
                .map(|cid| ReportedFile {
                    cid: cid.as_bytes().to_vec(),
                    size: 10,
                    valid_at: 20,
                })
                .collect()
        };
        ReportWorksCall {
            curr_pk: vec![1; 64],
            ab_upgrade_pk: Vec::new(),
            slot: 6000,
            slot_hash: vec![2; 32],
            reported_srd_size: 0,
            reported_files_size: 0,
            added_files: files(added),
            deleted_files: files(deleted),
            reported_srd_root: vec![3; 32],
            reported_files_root: vec![4; 32],
            sig: vec![5; 64],
        }
        .encode()
    }

    #[test]
    fn classifies_file_events() {
        let fields = ([9u8; 32], b"bafyA".to_vec()).encode();
        let event = classify_event("Market", "FileSuccess", &fields, Phase::ApplyExtrinsic(1)).unwrap();
        assert_eq!(event, ChainEvent::FileSuccess { cid: b"bafyA".to_vec() });

        let event =
            classify_event("Market", "RenewFileSuccess", &fields, Phase::ApplyExtrinsic(1)).unwrap();
        assert_eq!(event, ChainEvent::RenewFileSuccess { cid: b"bafyA".to_vec() });

        let closed = b"bafyB".to_vec().encode();
        let event = classify_event("Market", "FileClosed", &closed, Phase::Finalization).unwrap();
        assert_eq!(event, ChainEvent::FileClosed { cid: b"bafyB".to_vec() });
        let event =
            classify_event("Market", "IllegalFileClosed", &closed, Phase::Finalization).unwrap();
        assert_eq!(event, ChainEvent::IllegalFileClosed { cid: b"bafyB".to_vec() });
    }

    #[test]
    fn replica_events_need_an_extrinsic() {
        let event =
            classify_event("Swork", "WorksReportSuccess", &[], Phase::ApplyExtrinsic(3)).unwrap();
        assert_eq!(event, ChainEvent::WorksReportSuccess { extrinsic: 3 });

        let event =
            classify_event("Market", "UpdateReplicasSuccess", &[], Phase::Finalization).unwrap();
        assert_eq!(event, ChainEvent::Unknown);
    }

    #[test]
    fn unknown_and_truncated_events() {
        let event = classify_event("Balances", "Transfer", &[1, 2, 3], Phase::Initialization).unwrap();
        assert_eq!(event, ChainEvent::Unknown);
        assert_eq!(
            classify_event("System", "CodeUpdated", &[], Phase::Finalization).unwrap(),
            ChainEvent::CodeUpdated
        );

        let result = classify_event("Market", "FileSuccess", &[0u8; 4], Phase::ApplyExtrinsic(0));
        assert!(matches!(result, Err(DecodeError::Codec { .. })));
    }

    #[test]
    fn update_replicas_cids_from_signed_extrinsic() {
        let decoder = ScaleDecoder::new();
        let xt = extrinsic(true, 17, 5, &update_replicas_args(&["abc", "bafyX"]));
        let cids = decoder.replica_update_cids(&xt, ReplicaSource::Market).unwrap();
        assert_eq!(cids, vec![b"abc".to_vec(), b"bafyX".to_vec()]);
    }

    #[test]
    fn report_works_cids_include_deleted_files() {
        let decoder = ScaleDecoder::new();
        let xt = extrinsic(true, 9, 3, &report_works_args(&["add1", "add2"], &["del1"]));
        let cids = decoder.replica_update_cids(&xt, ReplicaSource::Swork).unwrap();
        assert_eq!(cids, vec![b"add1".to_vec(), b"add2".to_vec(), b"del1".to_vec()]);
    }

    #[test]
    fn unsigned_extrinsic_and_bad_version() {
        let decoder = ScaleDecoder::new();
        let xt = extrinsic(false, 17, 5, &update_replicas_args(&["abc"]));
        assert_eq!(
            decoder.replica_update_cids(&xt, ReplicaSource::Market).unwrap(),
            vec![b"abc".to_vec()]
        );

        let bad = vec![3u8, 0, 0].encode();
        let result = decoder.replica_update_cids(&bad, ReplicaSource::Market);
        assert!(matches!(result, Err(DecodeError::Extrinsic(_))));
    }

    #[test]
    fn file_info_layout() {
        let mut replicas = BTreeMap::new();
        replicas.insert(
            [4u8; 32],
            Replica {
                who: [5u8; 32],
                valid_at: 10,
                anchor: vec![6u8; 8],
                is_reported: true,
                created_at: Some(11),
            },
        );
        let info = FileInfoV2 {
            file_size: 1024,
            spower: 0,
            expired_at: 3_000_000,
            calculated_at: 100,
            amount: 5,
            prepaid: 0,
            reported_replica_count: 1,
            remaining_paid_count: 3,
            replicas,
        };
        let bytes = info.encode();
        // u64 + u64 + u32 + u32 + u128 + u128 + u32 + u32 before the replica map
        assert_eq!(bytes.len(), 8 + 8 + 4 + 4 + 16 + 16 + 4 + 4 + 1 + 32 + 32 + 4 + 9 + 1 + 5);
        assert_eq!(decode_storage::<FileInfoV2>("Market.FilesV2", &bytes).unwrap(), info);
    }
}
