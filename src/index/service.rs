use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::config::BrokerHaConfig;
use crate::log::{CheckpointStore, DispatchRequest, MessageType};

use super::{IndexError, IndexFile, Result};

/// Width of the `yyyyMMddHHmmssSSS` index file name.
const FILE_NAME_LEN: usize = 17;

fn format_index_file_name(ts_millis: i64) -> String {
    use chrono::{TimeZone, Utc};
    let dt = Utc
        .timestamp_millis_opt(ts_millis)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
    dt.format("%Y%m%d%H%M%S%3f").to_string()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn is_index_file_name(name: &str) -> bool {
    name.len() == FILE_NAME_LEN && name.bytes().all(|b| b.is_ascii_digit())
}

/// Outcome of [`IndexService::build_index`] for one dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildIndexOutcome {
    /// `n` keys were indexed into the tail file (possibly after rollover).
    Indexed { keys_indexed: usize },
    /// The message is a transactional commit/rollback marker; it carries no
    /// keys of its own.
    SkippedTransactional,
    /// The message's offset is below the tail's `end_phy_offset`: this is a
    /// redelivery of an already-indexed message.
    SkippedAlreadyIndexed,
}

/// An ordered sequence of [`IndexFile`]s. Only the tail is mutable.
pub struct IndexService {
    dir: PathBuf,
    config: BrokerHaConfig,
    files: RwLock<Vec<Arc<IndexFile>>>,
    /// Latched once rollover retries are exhausted; reads still work.
    unwritable: AtomicBool,
}

impl IndexService {
    /// Load (or create) the index directory.
    ///
    /// If the previous shutdown was unclean, any file whose `end_timestamp`
    /// exceeds the checkpoint's `index_msg_timestamp` is discarded rather
    /// than loaded, since recovery cannot trust its six-writes-not-atomic
    /// puts past that point.
    pub fn load(
        dir: impl AsRef<Path>,
        config: BrokerHaConfig,
        clean_shutdown: bool,
        checkpoint: &dyn CheckpointStore,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut names: Vec<String> = fs::read_dir(&dir)
            .map_err(|_| IndexError::InvalidDirectory(dir.display().to_string()))?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| is_index_file_name(n))
            .collect();
        names.sort();

        let checkpoint_ts = checkpoint.index_msg_timestamp();
        let mut files = Vec::with_capacity(names.len());
        for name in names {
            let path = dir.join(&name);
            let file = IndexFile::open(&path)?;
            if !clean_shutdown && file.stats().end_timestamp > checkpoint_ts {
                info!(
                    "discarding index file {name} (end_timestamp={} > checkpoint={checkpoint_ts}) \
                     after unclean shutdown",
                    file.stats().end_timestamp
                );
                drop(file);
                fs::remove_file(&path)?;
                continue;
            }
            files.push(Arc::new(file));
        }

        let service = Self {
            dir,
            config,
            files: RwLock::new(files),
            unwritable: AtomicBool::new(false),
        };
        if service.files.read().is_empty() {
            service.create_tail(0, 0)?;
        }
        Ok(service)
    }

    /// Create a fresh, empty index directory (no prior state to recover).
    pub fn new(dir: impl AsRef<Path>, config: BrokerHaConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let service = Self {
            dir,
            config,
            files: RwLock::new(Vec::new()),
            unwritable: AtomicBool::new(false),
        };
        service.create_tail(0, 0)?;
        Ok(service)
    }

    pub fn is_unwritable(&self) -> bool {
        self.unwritable.load(Ordering::Acquire)
    }

    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    fn create_tail(
        &self,
        seed_begin_phy_offset: i64,
        seed_begin_timestamp: i64,
    ) -> Result<Arc<IndexFile>> {
        let mut files = self.files.write();
        // Two rollovers within the same millisecond would otherwise collide
        // on the file name; nudge forward until a free one is found.
        let mut ts = now_millis();
        let mut path = self.dir.join(format_index_file_name(ts));
        while path.exists() {
            ts += 1;
            path = self.dir.join(format_index_file_name(ts));
        }
        let file = IndexFile::create(
            &path,
            self.config.hash_slot_count,
            self.config.max_index_count,
        )?;
        if seed_begin_timestamp != 0 {
            file.seed_begin(seed_begin_phy_offset, seed_begin_timestamp);
        }
        let file = Arc::new(file);
        files.push(file.clone());
        Ok(file)
    }

    fn current_tail(&self) -> Arc<IndexFile> {
        self.files
            .read()
            .last()
            .cloned()
            .expect("IndexService always has at least one (tail) file")
    }

    /// Roll the current tail over: seal it (background flush) and create a
    /// fresh tail carrying over `end_phy_offset`/`end_timestamp` as the new
    /// file's `begin_*` seeds.
    fn rollover(&self) -> Result<Arc<IndexFile>> {
        let sealed = self.current_tail();
        let stats = sealed.stats();
        let new_tail = self.create_tail(stats.end_phy_offset, stats.end_timestamp)?;
        debug!(
            "rolled over index file {} -> {} (begin_phy_offset={})",
            sealed.path().display(),
            new_tail.path().display(),
            stats.end_phy_offset
        );
        std::thread::spawn(move || {
            if let Err(e) = sealed.flush() {
                warn!(
                    "background flush of sealed index file {} failed: {e}",
                    sealed.path().display()
                );
            }
        });
        Ok(new_tail)
    }

    /// Insert `key` -> `phy_offset`, rolling over (and retrying) on a full
    /// tail up to `config.rollover_retries` times before latching
    /// "index unwritable".
    fn put_with_rollover(&self, key: &str, phy_offset: i64, store_timestamp: i64) -> Result<()> {
        let mut tail = self.current_tail();
        for attempt in 0..=self.config.rollover_retries {
            if tail.put_key(key, phy_offset, store_timestamp)? {
                return Ok(());
            }
            if attempt == self.config.rollover_retries {
                break;
            }
            tail = self.rollover()?;
            std::thread::sleep(Duration::from_millis(
                self.config.rollover_retry_interval_ms,
            ));
        }
        self.unwritable.store(true, Ordering::Release);
        warn!("index unwritable: rollover retries exhausted for key {key:?}");
        Err(IndexError::Unwritable)
    }

    /// The hot path: index every key in a dispatched message.
    pub fn build_index(&self, req: &DispatchRequest) -> Result<BuildIndexOutcome> {
        if matches!(
            req.msg_type,
            MessageType::TransactionCommit | MessageType::TransactionRollback
        ) {
            return Ok(BuildIndexOutcome::SkippedTransactional);
        }

        if req.commit_log_offset < self.current_tail().end_phy_offset() {
            return Ok(BuildIndexOutcome::SkippedAlreadyIndexed);
        }

        let mut keys_indexed = 0;
        for raw_key in req.keys.split(' ').filter(|k| !k.is_empty()) {
            let combined = format!("{}#{raw_key}", req.topic);
            self.put_with_rollover(&combined, req.commit_log_offset, req.store_timestamp)?;
            keys_indexed += 1;
        }
        Ok(BuildIndexOutcome::Indexed { keys_indexed })
    }

    /// Offsets for `(topic, key)` within `[t_begin, t_end]`, newest-first,
    /// plus the service's overall last-update timestamp/offset.
    pub fn query_offset(
        &self,
        topic: &str,
        key: &str,
        max_count: usize,
        t_begin: i64,
        t_end: i64,
    ) -> (Vec<i64>, i64, i64) {
        let max_count = max_count.min(self.config.max_query_count as usize);
        let combined = format!("{topic}#{key}");

        let files = self.files.read();
        let (last_update_ts, last_update_phy) = files
            .last()
            .map(|f| {
                let s = f.stats();
                (s.end_timestamp, s.end_phy_offset)
            })
            .unwrap_or((0, 0));

        let mut out = Vec::new();
        for (idx, file) in files.iter().rev().enumerate() {
            if out.len() >= max_count {
                break;
            }
            let begin_ts = file.begin_timestamp();
            if file.is_time_matched(t_begin, t_end) {
                file.select_phy_offset(&mut out, &combined, max_count, t_begin, t_end, idx == 0);
            }
            // `begin_timestamp == 0` means this file has never been written
            // to; it carries no information about older files.
            if begin_ts != 0 && begin_ts < t_begin {
                break;
            }
        }
        (out, last_update_ts, last_update_phy)
    }

    /// Delete every non-tail file whose `end_phy_offset < cutoff`, stopping
    /// at the first file that does not qualify (the list is time-ordered,
    /// so no later file can qualify either).
    pub fn delete_expired_file(&self, cutoff: i64, destroy_timeout: Duration) -> usize {
        let snapshot: Vec<Arc<IndexFile>> = {
            let files = self.files.read();
            if files.is_empty() {
                return 0;
            }
            files[..files.len() - 1].to_vec()
        };

        let mut deleted = 0;
        let mut files = self.files.write();
        for file in &snapshot {
            if file.end_phy_offset() >= cutoff {
                break;
            }
            if !file.destroy(destroy_timeout) {
                break;
            }
            files.retain(|f| !Arc::ptr_eq(f, file));
            deleted += 1;
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MessageType;
    use tempfile::TempDir;

    fn config(max_index_count: u32) -> BrokerHaConfig {
        BrokerHaConfig {
            hash_slot_count: 4,
            max_index_count,
            max_query_count: 64,
            rollover_retries: 3,
            rollover_retry_interval_ms: 0,
            ..BrokerHaConfig::default()
        }
    }

    fn dispatch(topic: &str, keys: &str, offset: i64, ts: i64) -> DispatchRequest {
        DispatchRequest {
            topic: topic.to_string(),
            keys: keys.to_string(),
            commit_log_offset: offset,
            store_timestamp: ts,
            msg_type: MessageType::Normal,
        }
    }

    #[test]
    fn insert_and_find_by_key() {
        let dir = TempDir::new().unwrap();
        let service = IndexService::new(dir.path(), config(100)).unwrap();

        service
            .build_index(&dispatch("A", "x", 1000, 5000))
            .unwrap();
        service
            .build_index(&dispatch("A", "y", 2000, 5100))
            .unwrap();

        let (offsets, _, _) = service.query_offset("A", "x", 10, 0, i64::MAX);
        assert_eq!(offsets, vec![1000]);
        let (offsets, _, _) = service.query_offset("A", "y", 10, 0, i64::MAX);
        assert_eq!(offsets, vec![2000]);
    }

    #[test]
    fn time_filter_excludes_out_of_range() {
        let dir = TempDir::new().unwrap();
        let service = IndexService::new(dir.path(), config(100)).unwrap();
        service
            .build_index(&dispatch("A", "x", 1000, 5000))
            .unwrap();

        let (offsets, _, _) = service.query_offset("A", "x", 10, 6000, 7000);
        assert!(offsets.is_empty());
    }

    #[test]
    fn rollover_spans_queries_across_files_newest_first() {
        let dir = TempDir::new().unwrap();
        let service = IndexService::new(dir.path(), config(2)).unwrap();

        service.build_index(&dispatch("A", "x", 100, 1000)).unwrap();
        service.build_index(&dispatch("A", "y", 200, 2000)).unwrap();
        // Third put forces a rollover (max_index_count=2 already full).
        service.build_index(&dispatch("A", "x", 300, 3000)).unwrap();

        assert_eq!(service.file_count(), 2);
        let (offsets, _, _) = service.query_offset("A", "x", 10, 0, i64::MAX);
        assert_eq!(offsets, vec![300, 100]);
    }

    #[test]
    fn build_index_skips_transactional_markers_and_redelivery() {
        let dir = TempDir::new().unwrap();
        let service = IndexService::new(dir.path(), config(100)).unwrap();

        let commit = DispatchRequest {
            msg_type: MessageType::TransactionCommit,
            ..dispatch("A", "x", 100, 1000)
        };
        assert_eq!(
            service.build_index(&commit).unwrap(),
            BuildIndexOutcome::SkippedTransactional
        );

        service.build_index(&dispatch("A", "x", 500, 2000)).unwrap();
        let redelivered = dispatch("A", "x", 100, 1000);
        assert_eq!(
            service.build_index(&redelivered).unwrap(),
            BuildIndexOutcome::SkippedAlreadyIndexed
        );
    }
}
