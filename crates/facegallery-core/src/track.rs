//! Association between upstream tracker ids and gallery identities.
//!
//! The tracker reports the same track id on every frame a person stays in
//! view; binding it once keeps admission to at most one decision per track.

use std::collections::HashMap;
use uuid::Uuid;

/// Identity a track was bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackIdentity {
    /// A gallery person, by `global_id`.
    Person(String),
    /// A face with no gallery match; the id is process-local and opaque.
    Stranger(Uuid),
}

#[derive(Debug, Clone)]
struct TrackEntry {
    identity: Option<TrackIdentity>,
    first_seen: u64,
    last_seen: u64,
}

/// Process-local map from tracker ids to identities.
#[derive(Debug, Default)]
pub struct TrackMap {
    entries: HashMap<u64, TrackEntry>,
}

impl TrackMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `track_id` was seen on frame `seq`.
    ///
    /// Returns how many frames the track has been observed for, counting
    /// this one.
    pub fn observe(&mut self, track_id: u64, seq: u64) -> u64 {
        let entry = self.entries.entry(track_id).or_insert(TrackEntry {
            identity: None,
            first_seen: seq,
            last_seen: seq,
        });
        entry.last_seen = entry.last_seen.max(seq);
        entry.last_seen - entry.first_seen + 1
    }

    /// Whether a decision was already taken for this track.
    pub fn is_bound(&self, track_id: u64) -> bool {
        self.entries
            .get(&track_id)
            .is_some_and(|e| e.identity.is_some())
    }

    pub fn get(&self, track_id: u64) -> Option<&TrackIdentity> {
        self.entries.get(&track_id).and_then(|e| e.identity.as_ref())
    }

    /// Bind a track to an identity. A track stays bound until it expires.
    pub fn bind(&mut self, track_id: u64, identity: TrackIdentity, seq: u64) {
        let entry = self.entries.entry(track_id).or_insert(TrackEntry {
            identity: None,
            first_seen: seq,
            last_seen: seq,
        });
        entry.last_seen = entry.last_seen.max(seq);
        entry.identity = Some(identity);
    }

    /// Bind a track to a fresh stranger id and return it.
    pub fn bind_stranger(&mut self, track_id: u64, seq: u64) -> Uuid {
        let id = Uuid::new_v4();
        self.bind(track_id, TrackIdentity::Stranger(id), seq);
        id
    }

    /// Drop tracks not seen for more than `idle_frames` frames before `seq`.
    ///
    /// Returns the number of removed tracks.
    pub fn expire(&mut self, seq: u64, idle_frames: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| seq.saturating_sub(e.last_seen) <= idle_frames);
        before - self.entries.len()
    }

    pub fn remove(&mut self, track_id: u64) -> Option<TrackIdentity> {
        self.entries.remove(&track_id).and_then(|e| e.identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
