use crate::messages::Track;

// ---------------------------------------------------------------------------
// Track queue
// ---------------------------------------------------------------------------

/// Ordered, client-reorderable queue of tracks awaiting playback.
///
/// All mutations run on the orchestrator task between suspension points, so
/// no interior locking is needed; the invariants here are purely structural
/// (unique ids, permutation-preserving reorder).
#[derive(Debug, Default)]
pub struct TrackQueue {
    tracks: Vec<Track>,
}

/// Outcome of `remove`: a tombstoned track has an outstanding fetch whose
/// completion must still trigger file cleanup, so the caller keeps it around.
#[derive(Debug)]
pub enum Removed {
    Gone(Track),
    Tombstoned(Track),
    NotFound,
}

impl TrackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Append a track. FIFO by default.
    pub fn enqueue(&mut self, track: Track) {
        debug_assert!(
            !self.tracks.iter().any(|t| t.id == track.id),
            "duplicate track id"
        );
        self.tracks.push(track);
    }

    /// Remove and return the head, or `None` when empty.
    pub fn pop_front(&mut self) -> Option<Track> {
        if self.tracks.is_empty() {
            None
        } else {
            Some(self.tracks.remove(0))
        }
    }

    /// Rewrite the order per the client-supplied id list.
    ///
    /// The result is a permutation of the ids present at call time: listed
    /// ids come first in the given order, ids missing from the list are
    /// appended in their prior relative order, and unknown ids are ignored.
    /// Nothing is ever dropped.
    pub fn reorder(&mut self, id_order: &[u64]) {
        let mut rest: Vec<Track> = std::mem::take(&mut self.tracks);
        let mut next = Vec::with_capacity(rest.len());

        for &id in id_order {
            if let Some(pos) = rest.iter().position(|t| t.id == id) {
                next.push(rest.remove(pos));
            }
        }
        next.append(&mut rest);

        self.tracks = next;
    }

    /// Remove a track by id, tombstoning it when its fetch is still in
    /// flight so the completion handler can release the file.
    pub fn remove(&mut self, id: u64) -> Removed {
        let Some(pos) = self.tracks.iter().position(|t| t.id == id) else {
            return Removed::NotFound;
        };

        let mut track = self.tracks.remove(pos);
        if track.fetch_in_flight {
            track.tombstoned = true;
            Removed::Tombstoned(track)
        } else {
            Removed::Gone(track)
        }
    }

    /// The first `n` entries, for speculative fetching.
    pub fn prefetch_candidates_mut(&mut self, n: usize) -> &mut [Track] {
        let n = n.min(self.tracks.len());
        &mut self.tracks[..n]
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: u64) -> Track {
        Track {
            id,
            title: format!("track {id}"),
            duration_seconds: 180,
            source_locator: format!("https://example.com/{id}"),
            requested_by: "test".into(),
            added_at: "10:00".into(),
            local_file_path: None,
            fetch_in_flight: false,
            tombstoned: false,
        }
    }

    fn ids(q: &TrackQueue) -> Vec<u64> {
        q.iter().map(|t| t.id).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut q = TrackQueue::new();
        for id in 1..=4 {
            q.enqueue(track(id));
        }
        assert_eq!(ids(&q), vec![1, 2, 3, 4]);
        assert_eq!(q.pop_front().unwrap().id, 1);
        assert_eq!(q.pop_front().unwrap().id, 2);
        assert_eq!(ids(&q), vec![3, 4]);
    }

    #[test]
    fn test_pop_front_empty() {
        let mut q = TrackQueue::new();
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn test_reorder_permutation() {
        let mut q = TrackQueue::new();
        for id in 1..=4 {
            q.enqueue(track(id));
        }
        q.reorder(&[3, 1, 4, 2]);
        assert_eq!(ids(&q), vec![3, 1, 4, 2]);
    }

    #[test]
    fn test_reorder_appends_omitted_in_prior_order() {
        let mut q = TrackQueue::new();
        for id in 1..=5 {
            q.enqueue(track(id));
        }
        // 2 and 4 omitted: they keep their relative order at the tail.
        q.reorder(&[5, 3, 1]);
        assert_eq!(ids(&q), vec![5, 3, 1, 2, 4]);
    }

    #[test]
    fn test_reorder_unknown_id_is_noop_for_that_id() {
        let mut q = TrackQueue::new();
        for id in 1..=3 {
            q.enqueue(track(id));
        }
        q.reorder(&[99, 2, 1]);
        assert_eq!(ids(&q), vec![2, 1, 3]);
    }

    #[test]
    fn test_remove_plain() {
        let mut q = TrackQueue::new();
        for id in 1..=3 {
            q.enqueue(track(id));
        }
        match q.remove(2) {
            Removed::Gone(t) => assert_eq!(t.id, 2),
            other => panic!("unexpected removal result: {other:?}"),
        }
        assert_eq!(ids(&q), vec![1, 3]);
        assert!(matches!(q.remove(2), Removed::NotFound));
    }

    #[test]
    fn test_remove_in_flight_is_tombstoned() {
        let mut q = TrackQueue::new();
        let mut t = track(7);
        t.fetch_in_flight = true;
        q.enqueue(t);

        match q.remove(7) {
            Removed::Tombstoned(t) => {
                assert!(t.tombstoned);
                assert!(t.fetch_in_flight);
            }
            other => panic!("unexpected removal result: {other:?}"),
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_prefetch_candidates_bounded() {
        let mut q = TrackQueue::new();
        q.enqueue(track(1));
        assert_eq!(q.prefetch_candidates_mut(2).len(), 1);
        q.enqueue(track(2));
        q.enqueue(track(3));
        let heads: Vec<u64> = q.prefetch_candidates_mut(2).iter().map(|t| t.id).collect();
        assert_eq!(heads, vec![1, 2]);
    }
}
