use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;

use tracing::debug;
use tracing::trace;

use crate::constants::GLOBAL_HIGHEST_SEQUENCE_NUMBER;
use crate::constants::GLOBAL_HIGHEST_TARGET_ID;
use crate::constants::GLOBAL_LAST_REMOTE_SNAPSHOT_VERSION;
use crate::convert::signed_kv;
use crate::convert::signed_vk;
use crate::core::Target;
use crate::core::TargetData;
use crate::core::TargetIdGenerator;
use crate::model::DocumentKey;
use crate::model::DocumentKeySet;
use crate::model::ListenSequenceNumber;
use crate::model::SnapshotVersion;
use crate::model::TargetId;
use crate::storage::read_record;
use crate::storage::scan_records;
use crate::storage::Keyspace;
use crate::storage::LocalStorage;
use crate::storage::WriteBatch;
use crate::Result;
use crate::StorageError;

/// Persisted targets and the documents the backend reported for each.
pub(crate) struct TargetCache {
    targets: BTreeMap<TargetId, TargetData>,
    by_canonical_id: HashMap<String, TargetId>,
    documents_by_target: BTreeSet<(TargetId, DocumentKey)>,
    targets_by_document: BTreeSet<(DocumentKey, TargetId)>,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    last_remote_snapshot_version: SnapshotVersion,
    id_generator: TargetIdGenerator,
}

fn target_key(target_id: TargetId) -> Vec<u8> {
    signed_kv(i64::from(target_id)).to_vec()
}

fn target_document_key(
    target_id: TargetId,
    key: &DocumentKey,
) -> Vec<u8> {
    let mut raw = target_key(target_id);
    raw.extend_from_slice(key.path().canonical_string().as_bytes());
    raw
}

fn parse_target_document_key(raw: &[u8]) -> Result<(TargetId, DocumentKey)> {
    if raw.len() < 8 {
        return Err(StorageError::DataCorruption {
            location: format!("target document key of {} bytes", raw.len()),
        }
        .into());
    }
    let (id, path) = raw.split_at(8);
    let target_id = signed_vk(id)? as TargetId;
    let path = std::str::from_utf8(path).map_err(|e| StorageError::DataCorruption {
        location: format!("target document path: {e}"),
    })?;
    Ok((target_id, DocumentKey::from_string(path)?))
}

impl TargetCache {
    pub(crate) fn load(storage: &dyn LocalStorage) -> Result<Self> {
        let mut targets = BTreeMap::new();
        let mut by_canonical_id = HashMap::new();
        for (_, data) in scan_records::<TargetData>(storage, Keyspace::Targets, &[])? {
            by_canonical_id.insert(data.target.canonical_id(), data.target_id);
            targets.insert(data.target_id, data);
        }

        let mut documents_by_target = BTreeSet::new();
        let mut targets_by_document = BTreeSet::new();
        for (raw, _) in storage.scan_prefix(Keyspace::TargetDocuments, &[])? {
            let (target_id, key) = parse_target_document_key(&raw)?;
            targets_by_document.insert((key.clone(), target_id));
            documents_by_target.insert((target_id, key));
        }

        let highest_target_id: TargetId =
            read_record(storage, Keyspace::Globals, GLOBAL_HIGHEST_TARGET_ID.as_bytes())?.unwrap_or_default();
        let highest_sequence_number =
            read_record(storage, Keyspace::Globals, GLOBAL_HIGHEST_SEQUENCE_NUMBER.as_bytes())?.unwrap_or_default();
        let last_remote_snapshot_version =
            read_record(storage, Keyspace::Globals, GLOBAL_LAST_REMOTE_SNAPSHOT_VERSION.as_bytes())?
                .unwrap_or(SnapshotVersion::MIN);

        debug!(
            "[TargetCache] loaded {} targets, highest target id {}, snapshot {}",
            targets.len(),
            highest_target_id,
            last_remote_snapshot_version
        );
        Ok(Self {
            targets,
            by_canonical_id,
            documents_by_target,
            targets_by_document,
            highest_target_id,
            highest_sequence_number,
            last_remote_snapshot_version,
            id_generator: TargetIdGenerator::for_target_cache(highest_target_id),
        })
    }

    pub(crate) fn allocate_target_id(&mut self) -> TargetId {
        self.id_generator.next()
    }

    pub(crate) fn next_sequence_number(&mut self) -> ListenSequenceNumber {
        self.highest_sequence_number += 1;
        self.highest_sequence_number
    }

    #[cfg(test)]
    pub(crate) fn highest_sequence_number(&self) -> ListenSequenceNumber {
        self.highest_sequence_number
    }

    #[cfg(test)]
    pub(crate) fn highest_target_id(&self) -> TargetId {
        self.highest_target_id
    }

    pub(crate) fn get_target_data(
        &self,
        target: &Target,
    ) -> Option<&TargetData> {
        let target_id = self.by_canonical_id.get(&target.canonical_id())?;
        self.targets.get(target_id).filter(|data| &data.target == target)
    }

    #[cfg(test)]
    pub(crate) fn get_target_data_by_id(
        &self,
        target_id: TargetId,
    ) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }

    /// Stores new or updated target metadata.
    pub(crate) fn save_target_data(
        &mut self,
        data: TargetData,
        batch: &mut WriteBatch,
    ) -> Result<()> {
        trace!("[TargetCache] save target_id={}", data.target_id);
        batch.put_record(Keyspace::Targets, target_key(data.target_id), &data)?;

        if data.target_id > self.highest_target_id {
            self.highest_target_id = data.target_id;
            batch.put_record(Keyspace::Globals, GLOBAL_HIGHEST_TARGET_ID, &self.highest_target_id)?;
        }
        if data.sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = data.sequence_number;
        }
        batch.put_record(Keyspace::Globals, GLOBAL_HIGHEST_SEQUENCE_NUMBER, &self.highest_sequence_number)?;

        self.by_canonical_id.insert(data.target.canonical_id(), data.target_id);
        self.targets.insert(data.target_id, data);
        Ok(())
    }

    #[cfg(test)]
    /// Drops the target together with its document associations.
    pub(crate) fn remove_target_data(
        &mut self,
        target_id: TargetId,
        batch: &mut WriteBatch,
    ) {
        if let Some(data) = self.targets.remove(&target_id) {
            let canonical_id = data.target.canonical_id();
            if self.by_canonical_id.get(&canonical_id) == Some(&target_id) {
                self.by_canonical_id.remove(&canonical_id);
            }
        }
        batch.delete(Keyspace::Targets, target_key(target_id));
        self.remove_matching_keys_for_target_id(target_id, batch);
    }

    pub(crate) fn add_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
        batch: &mut WriteBatch,
    ) {
        for key in keys {
            batch.put(Keyspace::TargetDocuments, target_document_key(target_id, key), Vec::new());
            self.documents_by_target.insert((target_id, key.clone()));
            self.targets_by_document.insert((key.clone(), target_id));
        }
    }

    pub(crate) fn remove_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
        batch: &mut WriteBatch,
    ) {
        for key in keys {
            batch.delete(Keyspace::TargetDocuments, target_document_key(target_id, key));
            self.documents_by_target.remove(&(target_id, key.clone()));
            self.targets_by_document.remove(&(key.clone(), target_id));
        }
    }

    #[cfg(test)]
    pub(crate) fn remove_matching_keys_for_target_id(
        &mut self,
        target_id: TargetId,
        batch: &mut WriteBatch,
    ) {
        let keys = self.get_matching_keys_for_target_id(target_id);
        self.remove_matching_keys(&keys, target_id, batch);
    }

    pub(crate) fn get_matching_keys_for_target_id(
        &self,
        target_id: TargetId,
    ) -> DocumentKeySet {
        self.documents_by_target
            .iter()
            .skip_while(|(id, _)| *id < target_id)
            .take_while(|(id, _)| *id == target_id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Whether any target references `key`.
    pub(crate) fn contains_key(
        &self,
        key: &DocumentKey,
    ) -> bool {
        self.targets_by_document
            .range((key.clone(), TargetId::MIN)..=(key.clone(), TargetId::MAX))
            .next()
            .is_some()
    }

    pub(crate) fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    pub(crate) fn set_last_remote_snapshot_version(
        &mut self,
        version: SnapshotVersion,
        batch: &mut WriteBatch,
    ) -> Result<()> {
        batch.put_record(Keyspace::Globals, GLOBAL_LAST_REMOTE_SNAPSHOT_VERSION, &version)?;
        self.last_remote_snapshot_version = version;
        Ok(())
    }

    pub(crate) fn target_count(&self) -> usize {
        self.targets.len()
    }
}
