//! # porto-kv
//!
//! Per-container persistence as an append-and-replay node log.
//!
//! Every container owns one node file under the storage root. A `set`
//! appends a single length-delimited record and fsyncs before the caller
//! acknowledges the change; restore replays all records with
//! last-write-wins per key. When a node accumulates far more records than
//! distinct keys it is compacted by rewriting the live pairs.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BytesMut};
use porto_error::{PortoError, Result};
use prost::Message;

/// One persisted key-value record.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct KvPair {
    /// Property or raw key name.
    #[prost(string, tag = "1")]
    pub key: String,
    /// Value as its wire string.
    #[prost(string, tag = "2")]
    pub value: String,
    /// Milliseconds since the epoch at append time.
    #[prost(int64, tag = "3")]
    pub timestamp_ms: i64,
}

/// A node is rewritten once its record count exceeds this multiple of its
/// distinct key count.
const COMPACTION_FACTOR: usize = 4;

/// Append-only node storage rooted at one directory.
pub struct KvStorage {
    root: PathBuf,
    /// Records appended per node since the last rewrite, for compaction.
    record_counts: HashMap<String, usize>,
    /// Distinct keys seen per node, so the compaction check stays O(1).
    node_keys: HashMap<String, std::collections::HashSet<String>>,
}

impl KvStorage {
    /// Opens the storage, creating the root directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| PortoError::unknown(format!("can't create kv root: {e}")))?;
        Ok(Self {
            root,
            record_counts: HashMap::new(),
            node_keys: HashMap::new(),
        })
    }

    fn node_path(&self, node: &str) -> PathBuf {
        self.root.join(node)
    }

    /// Creates an empty node file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create_node(&mut self, node: &str) -> Result<()> {
        File::create(self.node_path(node))
            .map_err(|e| PortoError::unknown(format!("can't create kv node {node}: {e}")))?;
        self.record_counts.insert(node.to_string(), 0);
        self.node_keys.insert(node.to_string(), Default::default());
        Ok(())
    }

    /// Returns whether a node file exists.
    #[must_use]
    pub fn has_node(&self, node: &str) -> bool {
        self.node_path(node).exists()
    }

    /// Appends one record and syncs it to disk before returning.
    ///
    /// # Errors
    ///
    /// Returns an error on any write or sync failure; a failed append must
    /// not be acknowledged to the client.
    pub fn append(&mut self, node: &str, key: &str, value: &str) -> Result<()> {
        let pair = KvPair {
            key: key.to_string(),
            value: value.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };

        let mut buf = BytesMut::with_capacity(pair.encoded_len() + 4);
        pair.encode_length_delimited(&mut buf)
            .map_err(|e| PortoError::unknown(format!("kv encode: {e}")))?;

        let path = self.node_path(node);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| PortoError::unknown(format!("can't open kv node {node}: {e}")))?;
        file.write_all(&buf)
            .map_err(|e| PortoError::unknown(format!("kv append: {e}")))?;
        file.sync_data()
            .map_err(|e| PortoError::unknown(format!("kv sync: {e}")))?;

        let count = self.record_counts.entry(node.to_string()).or_insert(0);
        *count += 1;
        self.node_keys
            .entry(node.to_string())
            .or_default()
            .insert(key.to_string());

        self.maybe_compact(node)
    }

    /// Replays a node, last write winning per key.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be read or a record is
    /// truncated.
    pub fn restore_node(&mut self, node: &str) -> Result<HashMap<String, String>> {
        let records = self.read_records(node)?;
        self.record_counts.insert(node.to_string(), records.len());

        let mut map = HashMap::new();
        for pair in records {
            map.insert(pair.key, pair.value);
        }
        self.node_keys
            .insert(node.to_string(), map.keys().cloned().collect());
        Ok(map)
    }

    /// Removes a node file. Removing an absent node is a success.
    ///
    /// # Errors
    ///
    /// Returns an error on filesystem failures other than absence.
    pub fn remove_node(&mut self, node: &str) -> Result<()> {
        self.record_counts.remove(node);
        self.node_keys.remove(node);
        match fs::remove_file(self.node_path(node)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PortoError::unknown(format!(
                "can't remove kv node {node}: {e}"
            ))),
        }
    }

    /// Lists node names currently on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be read.
    pub fn list_nodes(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| PortoError::unknown(format!("can't read kv root: {e}")))?;

        let mut nodes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PortoError::unknown(format!("kv readdir: {e}")))?;
            if entry.path().is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    nodes.push(name);
                }
            }
        }
        nodes.sort();
        Ok(nodes)
    }

    fn read_records(&self, node: &str) -> Result<Vec<KvPair>> {
        let path = self.node_path(node);
        let mut raw = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut raw))
            .map_err(|e| PortoError::unknown(format!("can't read kv node {node}: {e}")))?;

        let mut records = Vec::new();
        let mut buf = bytes::Bytes::from(raw);
        while buf.has_remaining() {
            let pair = KvPair::decode_length_delimited(&mut buf)
                .map_err(|e| PortoError::unknown(format!("kv node {node} corrupted: {e}")))?;
            records.push(pair);
        }
        Ok(records)
    }

    fn maybe_compact(&mut self, node: &str) -> Result<()> {
        let count = self.record_counts.get(node).copied().unwrap_or(0);
        let distinct = self.node_keys.get(node).map_or(0, |keys| keys.len());
        if distinct == 0 || count <= distinct * COMPACTION_FACTOR {
            return Ok(());
        }

        let records = self.read_records(node)?;
        let mut live: HashMap<String, KvPair> = HashMap::new();
        for pair in records {
            live.insert(pair.key.clone(), pair);
        }

        tracing::debug!(node, records = count, keys = live.len(), "compacting kv node");
        self.rewrite(node, live.into_values())?;
        Ok(())
    }

    fn rewrite(&mut self, node: &str, pairs: impl Iterator<Item = KvPair>) -> Result<()> {
        let tmp = self.root.join(format!("{node}.tmp"));
        let mut buf = BytesMut::new();
        let mut live = 0usize;
        for pair in pairs {
            pair.encode_length_delimited(&mut buf)
                .map_err(|e| PortoError::unknown(format!("kv encode: {e}")))?;
            live += 1;
        }

        let mut file = File::create(&tmp)
            .map_err(|e| PortoError::unknown(format!("can't create kv tmp: {e}")))?;
        file.write_all(&buf)
            .map_err(|e| PortoError::unknown(format!("kv rewrite: {e}")))?;
        file.sync_data()
            .map_err(|e| PortoError::unknown(format!("kv sync: {e}")))?;
        drop(file);

        fs::rename(&tmp, self.node_path(node))
            .map_err(|e| PortoError::unknown(format!("kv rename: {e}")))?;
        self.record_counts.insert(node.to_string(), live);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage() -> (TempDir, KvStorage) {
        let dir = TempDir::new().unwrap();
        let kv = KvStorage::open(dir.path()).unwrap();
        (dir, kv)
    }

    #[test]
    fn append_and_restore() {
        let (_dir, mut kv) = storage();
        kv.create_node("a").unwrap();
        kv.append("a", "command", "sleep 1000").unwrap();
        kv.append("a", "memory_limit", "1048576").unwrap();

        let map = kv.restore_node("a").unwrap();
        assert_eq!(map.get("command").unwrap(), "sleep 1000");
        assert_eq!(map.get("memory_limit").unwrap(), "1048576");
    }

    #[test]
    fn last_write_wins() {
        let (_dir, mut kv) = storage();
        kv.create_node("a").unwrap();
        kv.append("a", "k", "first").unwrap();
        kv.append("a", "k", "second").unwrap();

        let map = kv.restore_node("a").unwrap();
        assert_eq!(map.get("k").unwrap(), "second");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut kv = KvStorage::open(dir.path()).unwrap();
            kv.create_node("x").unwrap();
            kv.append("x", "memory_limit", "1048576").unwrap();
        }

        let mut kv = KvStorage::open(dir.path()).unwrap();
        assert_eq!(kv.list_nodes().unwrap(), vec!["x".to_string()]);
        let map = kv.restore_node("x").unwrap();
        assert_eq!(map.get("memory_limit").unwrap(), "1048576");
    }

    #[test]
    fn compaction_keeps_live_pairs() {
        let (_dir, mut kv) = storage();
        kv.create_node("a").unwrap();
        for i in 0..40 {
            kv.append("a", "k", &format!("v{i}")).unwrap();
        }
        kv.append("a", "other", "stable").unwrap();

        let map = kv.restore_node("a").unwrap();
        assert_eq!(map.get("k").unwrap(), "v39");
        assert_eq!(map.get("other").unwrap(), "stable");

        // After compaction the on-disk record count is bounded by the
        // distinct key count, not the append count.
        let records = kv.read_records("a").unwrap();
        assert!(records.len() <= 2 * COMPACTION_FACTOR);
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, mut kv) = storage();
        kv.create_node("gone").unwrap();
        kv.remove_node("gone").unwrap();
        kv.remove_node("gone").unwrap();
        assert!(!kv.has_node("gone"));
    }

    #[test]
    fn escaped_names_are_plain_files() {
        let (_dir, mut kv) = storage();
        kv.create_node("a%2Fb").unwrap();
        kv.append("a%2Fb", "k", "v").unwrap();
        assert_eq!(kv.list_nodes().unwrap(), vec!["a%2Fb".to_string()]);
    }
}
