//! The in-memory and on-disk mapping from blob id to the pack(s) that
//! contain it (§3.6, §4.4).

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::blob::Kind as BlobKind;
use crate::error::{Error, Result};
use crate::hashing::ObjectId;
use crate::pack::Manifest;
use crate::rcu::Rcu;

/// Where a blob lives: which pack, at what offset, for how many encrypted
/// bytes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub pack: ObjectId,
    pub offset: u64,
    pub length: u64,
}

/// On-disk record for one blob inside a pack entry (§3.6).
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
struct BlobRecord {
    #[serde(rename = "type")]
    kind: BlobKind,
    id: ObjectId,
    offset: u64,
    length: u64,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
struct PackEntry {
    id: ObjectId,
    blobs: Vec<BlobRecord>,
}

/// The wire format of an index object (§3.6, §6.3): a flat list of packs,
/// each with the blobs it contains. Unknown fields are tolerated on
/// deserialize so older/newer index objects stay readable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexFile {
    packs: Vec<PackEntry>,
}

impl IndexFile {
    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }

    pub fn pack_ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.packs.iter().map(|p| &p.id)
    }

    /// The union of `self` and `other`, keyed by pack id so a pack appearing
    /// in both collapses to one entry (§8.6: `merge(I, I) == I`).
    pub fn merge(&self, other: &IndexFile) -> IndexFile {
        let mut by_pack: BTreeMap<ObjectId, PackEntry> = BTreeMap::new();
        for entry in self.packs.iter().chain(other.packs.iter()) {
            by_pack.insert(entry.id, entry.clone());
        }
        IndexFile {
            packs: by_pack.into_values().collect(),
        }
    }
}

/// Everything the in-memory index knows, as one immutable value swapped in
/// wholesale by [`Rcu`]. Cheap to clone structurally since `store`/`update`
/// only ever happen at pack-insertion granularity, not per blob.
#[derive(Debug, Clone, Default)]
struct Contents {
    known_packs: im_like_set::PackSet,
    locations: FxHashMap<(BlobKind, ObjectId), Vec<Location>>,
}

/// A tiny ordered set, kept in its own module so `Contents`'s `Clone` impl
/// doesn't need to pull in a persistent-data-structure crate just for this.
mod im_like_set {
    use std::collections::BTreeSet;

    use crate::hashing::ObjectId;

    #[derive(Debug, Clone, Default)]
    pub struct PackSet(BTreeSet<ObjectId>);

    impl PackSet {
        pub fn insert(&mut self, id: ObjectId) -> bool {
            self.0.insert(id)
        }

        pub fn contains(&self, id: &ObjectId) -> bool {
            self.0.contains(id)
        }

        pub fn iter(&self) -> impl Iterator<Item = &ObjectId> {
            self.0.iter()
        }

        pub fn len(&self) -> usize {
            self.0.len()
        }
    }
}

impl Contents {
    fn insert_pack(&mut self, pack_id: ObjectId, manifest: &[Manifest]) {
        self.known_packs.insert(pack_id);
        for m in manifest {
            self.locations.entry((m.kind, m.id)).or_default().push(Location {
                pack: pack_id,
                offset: m.offset,
                length: m.length,
            });
        }
    }
}

/// The shared-read, synchronized-write blob location map. Lookups never
/// block on an in-progress insert (§4.4, §5): each reader sees either all or
/// none of a given pack's entries.
pub struct Index {
    contents: Rcu<Contents>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            contents: Rcu::new(Contents::default()),
        }
    }

    pub fn has(&self, kind: BlobKind, id: ObjectId) -> bool {
        self.contents.load().locations.contains_key(&(kind, id))
    }

    pub fn lookup(&self, kind: BlobKind, id: ObjectId) -> Result<Vec<Location>> {
        self.contents
            .load()
            .locations
            .get(&(kind, id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{kind:?} blob {id}")))
    }

    /// Records one pack's worth of blobs atomically: a concurrent reader
    /// either sees the whole pack's entries or none of them.
    pub fn insert_pack(&self, pack_id: ObjectId, manifest: &[Manifest]) {
        trace!("Indexing pack {} ({} blobs)", pack_id, manifest.len());
        self.contents.update(|current| {
            let mut next = current.clone();
            next.insert_pack(pack_id, manifest);
            next
        });
    }

    pub fn has_pack(&self, pack_id: &ObjectId) -> bool {
        self.contents.load().known_packs.contains(pack_id)
    }

    pub fn known_packs(&self) -> Vec<ObjectId> {
        self.contents.load().known_packs.iter().copied().collect()
    }

    pub fn count(&self, kind: BlobKind) -> usize {
        self.contents
            .load()
            .locations
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    pub fn pack_count(&self) -> usize {
        self.contents.load().known_packs.len()
    }

    /// A snapshot of every `(kind, id, location)` triple currently known.
    pub fn iter(&self) -> Vec<(BlobKind, ObjectId, Location)> {
        self.contents
            .load()
            .locations
            .iter()
            .flat_map(|((kind, id), locs)| locs.iter().map(move |l| (*kind, *id, *l)))
            .collect()
    }

    /// Builds an on-disk [`IndexFile`] listing only the given packs (used
    /// for incremental `save_index`, not the whole repository's history).
    pub fn to_index_file(&self, pack_ids: &[ObjectId]) -> IndexFile {
        let contents = self.contents.load();
        let mut packs = Vec::with_capacity(pack_ids.len());
        for pack_id in pack_ids {
            let mut blobs: Vec<BlobRecord> = contents
                .locations
                .iter()
                .flat_map(|((kind, id), locs)| {
                    locs.iter().filter(|l| l.pack == *pack_id).map(move |l| BlobRecord {
                        kind: *kind,
                        id: *id,
                        offset: l.offset,
                        length: l.length,
                    })
                })
                .collect();
            blobs.sort_by_key(|b| b.offset);
            packs.push(PackEntry {
                id: *pack_id,
                blobs,
            });
        }
        IndexFile { packs }
    }

    /// Builds an on-disk [`IndexFile`] listing every pack currently known
    /// (used by the periodic full-index coalesce, §4.4).
    pub fn to_full_index_file(&self) -> IndexFile {
        let packs = self.known_packs();
        self.to_index_file(&packs)
    }

    /// Merges an index object's contents into this in-memory index.
    /// Packs already known are skipped (monotonic union).
    pub fn merge_file(&self, file: &IndexFile) {
        for entry in &file.packs {
            if self.has_pack(&entry.id) {
                continue;
            }
            let manifest: Vec<Manifest> = entry
                .blobs
                .iter()
                .map(|b| Manifest {
                    kind: b.kind,
                    id: b.id,
                    offset: b.offset,
                    length: b.length,
                })
                .collect();
            self.insert_pack(entry.id, &manifest);
        }
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blob::Kind;

    fn manifest(entries: &[(Kind, &[u8], u64, u64)]) -> Vec<Manifest> {
        entries
            .iter()
            .map(|(kind, bytes, offset, length)| Manifest {
                kind: *kind,
                id: ObjectId::hash(bytes),
                offset: *offset,
                length: *length,
            })
            .collect()
    }

    #[test]
    fn lookup_missing_is_not_found() {
        let index = Index::new();
        assert!(matches!(
            index.lookup(Kind::Chunk, ObjectId::hash(b"nope")).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let index = Index::new();
        let pack_id = ObjectId::hash(b"a pack");
        let m = manifest(&[(Kind::Chunk, b"chunk a", 0, 10), (Kind::Tree, b"tree a", 10, 20)]);
        index.insert_pack(pack_id, &m);

        assert!(index.has(Kind::Chunk, ObjectId::hash(b"chunk a")));
        let locs = index.lookup(Kind::Chunk, ObjectId::hash(b"chunk a")).unwrap();
        assert_eq!(locs, vec![Location { pack: pack_id, offset: 0, length: 10 }]);
        assert_eq!(index.count(Kind::Chunk), 1);
        assert_eq!(index.count(Kind::Tree), 1);
    }

    #[test]
    fn insertion_is_all_or_nothing_per_pack() {
        let index = Index::new();
        let pack_id = ObjectId::hash(b"a pack");
        let m = manifest(&[(Kind::Chunk, b"a", 0, 1), (Kind::Chunk, b"b", 1, 1)]);
        index.insert_pack(pack_id, &m);
        assert!(index.has(Kind::Chunk, ObjectId::hash(b"a")));
        assert!(index.has(Kind::Chunk, ObjectId::hash(b"b")));
    }

    #[test]
    fn to_index_file_and_back_round_trips() {
        let index = Index::new();
        let pack_id = ObjectId::hash(b"a pack");
        let m = manifest(&[(Kind::Chunk, b"a", 0, 4)]);
        index.insert_pack(pack_id, &m);

        let file = index.to_full_index_file();
        let json = serde_json::to_string(&file).unwrap();
        let parsed: IndexFile = serde_json::from_str(&json).unwrap();

        let restored = Index::new();
        restored.merge_file(&parsed);
        assert!(restored.has(Kind::Chunk, ObjectId::hash(b"a")));
    }

    #[test]
    fn merge_is_idempotent_and_commutative() {
        let a = IndexFile {
            packs: vec![PackEntry {
                id: ObjectId::hash(b"pack a"),
                blobs: vec![BlobRecord {
                    kind: Kind::Chunk,
                    id: ObjectId::hash(b"x"),
                    offset: 0,
                    length: 1,
                }],
            }],
        };
        let b = IndexFile {
            packs: vec![PackEntry {
                id: ObjectId::hash(b"pack b"),
                blobs: vec![BlobRecord {
                    kind: Kind::Tree,
                    id: ObjectId::hash(b"y"),
                    offset: 0,
                    length: 2,
                }],
            }],
        };

        let aa = a.merge(&a);
        assert_eq!(aa.packs.len(), a.packs.len());

        let ab = a.merge(&b);
        let ba = b.merge(&a);
        let mut ab_ids: Vec<_> = ab.pack_ids().collect();
        let mut ba_ids: Vec<_> = ba.pack_ids().collect();
        ab_ids.sort();
        ba_ids.sort();
        assert_eq!(ab_ids, ba_ids);
    }

    #[test]
    fn merge_file_skips_already_known_packs() {
        let index = Index::new();
        let pack_id = ObjectId::hash(b"p");
        index.insert_pack(pack_id, &manifest(&[(Kind::Chunk, b"a", 0, 1)]));

        let file = IndexFile {
            packs: vec![PackEntry {
                id: pack_id,
                blobs: vec![BlobRecord {
                    kind: Kind::Chunk,
                    id: ObjectId::hash(b"a"),
                    offset: 0,
                    length: 1,
                }],
            }],
        };
        index.merge_file(&file);
        assert_eq!(index.pack_count(), 1);
    }
}
