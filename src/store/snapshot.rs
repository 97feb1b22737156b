use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::error::{Result, VcsError};
use crate::model::{Branch, Commit, CommitId, Object, ObjectHash, Tag};
use crate::store::memory::MemoryStore;
use crate::store::traits::{CommitStore, ObjectStore, RefStore};

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Durable form of a repository: the `objects`, `commits` and `branches`
/// collections, plus tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    pub format_version: u32,
    pub objects: BTreeMap<ObjectHash, Object>,
    /// Ordered by generation so parents precede children
    pub commits: Vec<Commit>,
    pub branches: BTreeMap<String, Branch>,
    #[serde(default)]
    pub tags: BTreeMap<String, Tag>,
}

impl MemoryStore {
    pub fn to_snapshot(&self) -> Result<RepositorySnapshot> {
        Ok(RepositorySnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            objects: self.objects_snapshot(),
            commits: self.commits_snapshot(),
            branches: self
                .list_branches()?
                .into_iter()
                .map(|b| (b.name.clone(), b))
                .collect(),
            tags: self
                .list_tags()?
                .into_iter()
                .map(|t| (t.name.clone(), t))
                .collect(),
        })
    }

    /// Rebuild a store, re-verifying every hash and reference.
    pub fn from_snapshot(snapshot: RepositorySnapshot) -> Result<Self> {
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(VcsError::Corrupt(format!(
                "unsupported snapshot format version {}",
                snapshot.format_version
            )));
        }

        let store = MemoryStore::new();

        // Blobs first so trees can be checked against them.
        let (blobs, trees): (Vec<_>, Vec<_>) = snapshot
            .objects
            .into_iter()
            .partition(|(_, object)| matches!(object, Object::Blob(_)));
        for (hash, object) in blobs.into_iter().chain(trees) {
            let actual = object.hash();
            if actual != hash {
                log::error!("snapshot object {} rehashes to {}", hash, actual);
                return Err(VcsError::Corrupt(format!(
                    "object stored as {} hashes to {}",
                    hash, actual
                )));
            }
            if let Object::Tree(tree) = &object {
                for (name, entry) in tree.entries() {
                    if !store.contains_object(entry)? {
                        return Err(VcsError::DanglingReference {
                            referrer: format!("tree {} entry '{}'", hash, name),
                            missing: entry.to_string(),
                        });
                    }
                }
            }
            store.put_object(object)?;
        }

        // commit id -> generation recomputed from the parents
        let mut seen: HashMap<CommitId, u64> = HashMap::new();
        for commit in snapshot.commits {
            if !commit.verify_id() {
                return Err(VcsError::Corrupt(format!(
                    "commit {} does not match its content",
                    commit.commit_id()
                )));
            }
            if !store.contains_object(commit.tree_hash())? {
                return Err(VcsError::DanglingReference {
                    referrer: format!("commit {}", commit.commit_id()),
                    missing: commit.tree_hash().to_string(),
                });
            }
            let mut generation = 0;
            for parent in commit.parent_ids() {
                let parent_generation = seen.get(parent).ok_or_else(|| {
                    VcsError::DanglingReference {
                        referrer: format!("commit {}", commit.commit_id()),
                        missing: parent.to_string(),
                    }
                })?;
                generation = generation.max(parent_generation + 1);
            }
            // Generation is not part of the id, so it is checked separately.
            if commit.generation() != generation {
                log::error!(
                    "snapshot commit {} claims generation {}, history gives {}",
                    commit.commit_id(),
                    commit.generation(),
                    generation
                );
                return Err(VcsError::Corrupt(format!(
                    "commit {} has generation {}, expected {}",
                    commit.commit_id(),
                    commit.generation(),
                    generation
                )));
            }
            seen.insert(commit.commit_id().clone(), generation);
            store.insert_commit(commit)?;
        }

        for (_, branch) in snapshot.branches {
            if !seen.contains_key(&branch.head_commit_id) {
                return Err(VcsError::DanglingReference {
                    referrer: format!("branch '{}'", branch.name),
                    missing: branch.head_commit_id.to_string(),
                });
            }
            store.create_branch(branch)?;
        }
        for (_, tag) in snapshot.tags {
            if !seen.contains_key(&tag.commit_id) {
                return Err(VcsError::DanglingReference {
                    referrer: format!("tag '{}'", tag.name),
                    missing: tag.commit_id.to_string(),
                });
            }
            store.create_tag(tag)?;
        }

        Ok(store)
    }

    /// Write the store to `path` as gzip-compressed JSON.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let serialized = serde_json::to_vec(&self.to_snapshot()?)?;
        let compressed = compress_data(&serialized)?;

        // Write next to the target and rename, so a crash never leaves a
        // truncated snapshot behind.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, compressed)?;
        std::fs::rename(&tmp, path)?;
        log::info!(
            "saved repository snapshot to {} ({} bytes uncompressed)",
            path.display(),
            serialized.len()
        );
        Ok(())
    }

    pub fn load_snapshot(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let decompressed = decompress_data(&raw)?;
        let snapshot: RepositorySnapshot = serde_json::from_slice(&decompressed)?;
        let store = Self::from_snapshot(snapshot)?;
        log::info!("loaded repository snapshot from {}", path.display());
        Ok(store)
    }
}

/// Compress data using gzip
fn compress_data(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress data from gzip; plain JSON is passed through
fn decompress_data(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    // gzip magic bytes (1f 8b)
    if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, QualifiedName, Tree};
    use crate::store::traits::ObjectStoreExt;
    use chrono::Utc;
    use serde_json::json;

    fn populated() -> MemoryStore {
        let store = MemoryStore::new();
        let hash = store
            .put_entity(EntityKind::Table, &json!({"columns": [{"name": "id"}]}))
            .unwrap();
        let tree = store
            .put_tree(Tree::new().with_entry(QualifiedName::parse("public.t").unwrap(), hash))
            .unwrap();
        let commit = Commit::new(tree, vec![], "system", "init", Utc::now(), 0);
        let id = store.insert_commit(commit).unwrap().commit_id().clone();
        store
            .create_branch(Branch::new("main".to_string(), id.clone(), None))
            .unwrap();
        store.create_tag(Tag::new("v1".to_string(), id, None)).unwrap();
        store
    }

    #[test]
    fn test_snapshot_roundtrip_in_memory() {
        let store = populated();
        let snapshot = store.to_snapshot().unwrap();
        let restored = MemoryStore::from_snapshot(snapshot.clone()).unwrap();
        assert_eq!(restored.to_snapshot().unwrap(), snapshot);
    }

    #[test]
    fn test_tampered_object_is_rejected() {
        let mut snapshot = populated().to_snapshot().unwrap();
        let (hash, _) = snapshot
            .objects
            .iter()
            .find(|(_, o)| matches!(o, Object::Blob(_)))
            .map(|(h, o)| (h.clone(), o.clone()))
            .unwrap();
        snapshot.objects.insert(
            hash,
            Object::Blob(crate::model::Blob::new(EntityKind::Table, &json!({"columns": []}))),
        );
        let err = MemoryStore::from_snapshot(snapshot).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_branch_pointing_nowhere_is_rejected() {
        let mut snapshot = populated().to_snapshot().unwrap();
        snapshot
            .branches
            .get_mut("main")
            .unwrap()
            .head_commit_id = CommitId::from_hex("deadbeef");
        assert!(matches!(
            MemoryStore::from_snapshot(snapshot),
            Err(VcsError::DanglingReference { .. })
        ));
    }

    #[test]
    fn test_tampered_generation_is_rejected() {
        let store = populated();
        let root = store.get_branch("main").unwrap().unwrap().head_commit_id;
        let tree = store.get_commit(&root).unwrap().unwrap().tree_hash().clone();
        let child = Commit::new(tree, vec![root], "system", "next", Utc::now(), 1);
        store.insert_commit(child).unwrap();

        let mut snapshot = store.to_snapshot().unwrap();
        assert!(MemoryStore::from_snapshot(snapshot.clone()).is_ok());

        // the id does not cover generation, so only the recount catches this
        let mut raw = serde_json::to_value(&snapshot.commits[1]).unwrap();
        raw["generation"] = json!(7);
        snapshot.commits[1] = serde_json::from_value(raw).unwrap();
        assert!(snapshot.commits[1].verify_id());
        assert!(matches!(
            MemoryStore::from_snapshot(snapshot),
            Err(VcsError::Corrupt(_))
        ));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.json.gz");
        let store = populated();
        store.save_snapshot(&path).unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);

        let loaded = MemoryStore::load_snapshot(&path).unwrap();
        assert_eq!(loaded.to_snapshot().unwrap(), store.to_snapshot().unwrap());
    }

    #[test]
    fn test_decompress_passes_plain_json_through() {
        let plain = br#"{"a":1}"#;
        assert_eq!(decompress_data(plain).unwrap(), plain.to_vec());
        let packed = compress_data(plain).unwrap();
        assert_eq!(decompress_data(&packed).unwrap(), plain.to_vec());
    }
}
