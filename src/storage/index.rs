use super::parse_segment_name;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A finalized recording segment. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub sequence: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
    pub size_bytes: u64,
}

impl SegmentFile {
    fn key(&self) -> SegmentKey {
        (self.start_time, self.sequence, self.path.clone())
    }
}

type SegmentKey = (DateTime<Utc>, u32, PathBuf);

fn span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Ordered view of finalized segments, oldest first.
///
/// The recorder is the only writer that adds entries, and only after a
/// segment is closed, so the segment currently being written is never here.
/// Clones share the same entries.
#[derive(Clone, Debug)]
pub struct StorageIndex {
    root: PathBuf,
    entries: Arc<Mutex<BTreeMap<SegmentKey, SegmentFile>>>,
}

impl StorageIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Rebuild the index from what actually exists in the output directory
    ///
    /// A name only carries the session start, so segment `n` is placed at
    /// `session_start + n * segment_len` and its duration is capped at
    /// `segment_len`.
    pub fn rebuild(
        root: impl Into<PathBuf>,
        extension: &str,
        segment_len: Duration,
    ) -> Result<Self> {
        let index = Self::new(root);

        let dir = std::fs::read_dir(&index.root)
            .with_context(|| format!("Failed to scan output directory: {:?}", index.root))?;

        for entry in dir {
            let entry = entry?;
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some((session_start, sequence)) =
                name.to_str().and_then(|n| parse_segment_name(n, extension))
            else {
                continue;
            };

            let start_time = session_start + span(segment_len * sequence);
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or(start_time);
            let duration = (modified - start_time)
                .to_std()
                .unwrap_or_default()
                .min(segment_len);
            let end_time = start_time + span(duration);

            index.register(SegmentFile {
                path: entry.path(),
                sequence,
                start_time,
                end_time,
                duration,
                size_bytes: meta.len(),
            });
        }

        let total_bytes: u64 = index.snapshot().iter().map(|f| f.size_bytes).sum();
        tracing::debug!(
            "Rebuilt storage index with {} segments ({} bytes) from {:?}",
            index.len(),
            total_bytes,
            index.root
        );
        Ok(index)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Add a finalized segment. Files outside the managed directory are refused.
    pub fn register(&self, file: SegmentFile) -> bool {
        if file.path.parent() != Some(self.root.as_path()) {
            tracing::warn!(
                "Refusing to index {:?}: not inside {:?}",
                file.path,
                self.root
            );
            return false;
        }
        self.lock().insert(file.key(), file);
        true
    }

    pub fn oldest(&self) -> Option<SegmentFile> {
        self.lock().values().next().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<SegmentFile> {
        self.lock().values().cloned().collect()
    }

    /// Remove the entry and delete its file under one lock.
    ///
    /// The entry is gone whatever the deletion outcome, so the index never
    /// points at a file that is missing. A file that failed to delete is
    /// picked up again by the next startup rebuild.
    pub fn remove_and_delete(&self, file: &SegmentFile) -> io::Result<u64> {
        let mut entries = self.lock();
        if entries.remove(&file.key()).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "segment is not in the index",
            ));
        }

        match std::fs::remove_file(&file.path) {
            Ok(()) => Ok(file.size_bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SegmentKey, SegmentFile>> {
        // A poisoned map is still structurally valid
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{segment_file_name, session_stamp};
    use chrono::TimeZone;

    fn segment(root: &Path, start: DateTime<Utc>, sequence: u32) -> SegmentFile {
        let name = segment_file_name(&session_stamp(start), sequence, "mp4");
        let path = root.join(name);
        std::fs::write(&path, vec![0u8; 10]).unwrap();
        SegmentFile {
            path,
            sequence,
            start_time: start,
            end_time: start + chrono::Duration::seconds(30),
            duration: Duration::from_secs(30),
            size_bytes: 10,
        }
    }

    #[test]
    fn test_oldest_follows_start_time_then_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let index = StorageIndex::new(dir.path());
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let t2 = t1 + chrono::Duration::seconds(30);

        index.register(segment(dir.path(), t2, 0));
        index.register(segment(dir.path(), t1, 1));
        index.register(segment(dir.path(), t1, 0));

        let order: Vec<_> = index
            .snapshot()
            .iter()
            .map(|f| (f.start_time, f.sequence))
            .collect();
        assert_eq!(order, vec![(t1, 0), (t1, 1), (t2, 0)]);
        assert_eq!(index.oldest().map(|f| f.sequence), Some(0));
    }

    #[test]
    fn test_register_refuses_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let index = StorageIndex::new(dir.path());
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();

        assert!(!index.register(segment(other.path(), t, 0)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_remove_and_delete_drops_entry_even_when_file_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let index = StorageIndex::new(dir.path());
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let file = segment(dir.path(), t, 0);
        index.register(file.clone());

        std::fs::remove_file(&file.path).unwrap();
        assert_eq!(index.remove_and_delete(&file).unwrap(), 0);
        assert!(index.is_empty());
        assert!(index.remove_and_delete(&file).is_err());
    }

    #[test]
    fn test_rebuild_recovers_ordering_from_names() {
        let dir = tempfile::tempdir().unwrap();
        let early = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        segment(dir.path(), late, 0);
        segment(dir.path(), early, 1);
        segment(dir.path(), early, 0);
        std::fs::write(dir.path().join("README.txt"), b"keep me").unwrap();
        std::fs::create_dir(dir.path().join("20260301T090000000_00009.mp4")).unwrap();

        let index = StorageIndex::rebuild(dir.path(), "mp4", Duration::from_secs(30)).unwrap();

        let order: Vec<_> = index
            .snapshot()
            .iter()
            .map(|f| (f.start_time, f.sequence, f.size_bytes))
            .collect();
        let second_slot = early + chrono::Duration::seconds(30);
        assert_eq!(
            order,
            vec![(early, 0, 10), (second_slot, 1, 10), (late, 0, 10)]
        );
    }

    #[test]
    fn test_rebuild_places_later_segments_within_their_slot() {
        let dir = tempfile::tempdir().unwrap();
        let segment_len = Duration::from_secs(30);
        // Session began five minutes ago; segment 4 was written just now
        let session_start = Utc::now() - chrono::Duration::seconds(300);
        let stamp = session_stamp(session_start);
        let path = dir.path().join(segment_file_name(&stamp, 4, "mp4"));
        std::fs::write(&path, vec![0u8; 10]).unwrap();

        let index = StorageIndex::rebuild(dir.path(), "mp4", segment_len).unwrap();

        let rebuilt = index.oldest().unwrap();
        let (named_start, _) = crate::storage::parse_segment_name(
            path.file_name().unwrap().to_str().unwrap(),
            "mp4",
        )
        .unwrap();
        assert_eq!(rebuilt.sequence, 4);
        assert_eq!(rebuilt.start_time, named_start + chrono::Duration::seconds(120));
        assert!(rebuilt.duration <= segment_len, "{:?}", rebuilt.duration);
        assert_eq!(
            rebuilt.end_time,
            rebuilt.start_time + chrono::Duration::from_std(rebuilt.duration).unwrap()
        );
    }

    #[test]
    fn test_rebuild_never_yields_negative_duration() {
        let dir = tempfile::tempdir().unwrap();
        // Named far in the future, so the file was modified before its slot
        let future = Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap();
        segment(dir.path(), future, 2);

        let index = StorageIndex::rebuild(dir.path(), "mp4", Duration::from_secs(30)).unwrap();

        let rebuilt = index.oldest().unwrap();
        assert_eq!(rebuilt.start_time, future + chrono::Duration::seconds(60));
        assert_eq!(rebuilt.duration, Duration::ZERO);
        assert_eq!(rebuilt.end_time, rebuilt.start_time);
    }
}
