//! File operations and the write-apply engine.
//!
//! Writes to open commits never touch the snapshot directly: each call
//! stages a record under `scratch/<repo>/<commit>/<path>/<uuid>` in the
//! coordination store, gated on the commit still being open. At finish
//! time (and on every read of an open commit) the staged records are
//! replayed in mod-revision order onto the parent snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use atoll_hashtree::{clean_path, join_path, HashTree, Node, OpenHashTree};
use atoll_kv::Entry;
use atoll_types::{
    looks_like_commit_id, new_commit_id, CommitRef, Delimiter, FileInfo, FileRef, FileType,
    ObjectHash, PutFileRecord, PutFileRecords, Scope,
};
use bytes::Bytes;
use tracing::debug;

use crate::driver::{check_path, Driver, TOMBSTONE};
use crate::error::{EngineError, Result};

/// Bytes added by `tree` relative to `parent`: the sum of subtree sizes
/// over new file nodes in a full-depth diff.
pub(crate) fn size_change(tree: &HashTree, parent: &HashTree) -> u64 {
    let mut total: i64 = 0;
    // The callback is infallible, so the diff cannot fail.
    tree.diff(parent, "", "", -1, |_, node, is_new| {
        if is_new && node.is_file() {
            total += node.subtree_size;
        }
        Ok(())
    })
    .ok();
    total.max(0) as u64
}

fn node_to_file_info(commit: &CommitRef, path: &str, node: &Node, full: bool) -> FileInfo {
    FileInfo {
        file: FileRef::new(commit.clone(), path),
        file_type: if node.is_file() {
            FileType::File
        } else {
            FileType::Dir
        },
        size_bytes: node.subtree_size.max(0) as u64,
        hash: node.hash.to_vec(),
        objects: if full && node.is_file() {
            node.objects().to_vec()
        } else {
            Vec::new()
        },
        children: if full && node.is_dir() {
            node.children().to_vec()
        } else {
            Vec::new()
        },
    }
}

/// Cut `data` into batches at record boundaries, flushing whenever the
/// datum or byte target is reached (or per record when both are zero).
fn batch_records<'a>(
    values: impl Iterator<Item = &'a [u8]>,
    target_datums: u64,
    target_bytes: u64,
) -> Vec<Vec<u8>> {
    let mut batches = Vec::new();
    let mut buffer: Vec<u8> = Vec::new();
    let mut datums = 0u64;
    let mut bytes_written = 0u64;
    for value in values {
        buffer.extend_from_slice(value);
        bytes_written += value.len() as u64;
        datums += 1;
        let flush = !buffer.is_empty()
            && ((target_bytes != 0 && bytes_written >= target_bytes)
                || (target_datums != 0 && datums >= target_datums)
                || (target_bytes == 0 && target_datums == 0));
        if flush {
            batches.push(std::mem::take(&mut buffer));
            datums = 0;
            bytes_written = 0;
        }
    }
    if !buffer.is_empty() {
        batches.push(buffer);
    }
    batches
}

impl Driver {
    /// Stage an append to a file in an open commit.
    ///
    /// With [`Delimiter::None`] the data becomes one file, split into
    /// fixed-size objects by the store. With [`Delimiter::Line`] or
    /// [`Delimiter::Json`] the data is cut at record boundaries into
    /// batches of `target_file_datums` records or `target_file_bytes`
    /// bytes, and each batch becomes its own numbered child file at
    /// finish time.
    ///
    /// `overwrite_index` gives truncate-then-append semantics: index 0
    /// deletes the path first, a non-zero index replaces the object list
    /// from that position.
    pub async fn put_file(
        &self,
        file: &FileRef,
        delimiter: Delimiter,
        target_file_datums: u64,
        target_file_bytes: u64,
        overwrite_index: Option<u64>,
        data: Bytes,
    ) -> Result<()> {
        self.check_authorized(&file.commit.repo, Scope::Writer).await?;

        // Branch names need resolving to check that the commit is open;
        // syntactic commit IDs skip the lookup.
        let mut commit = file.commit.clone();
        if !looks_like_commit_id(&commit.id) {
            commit = self.inspect_commit(&commit).await?.commit;
        }

        if overwrite_index == Some(0) {
            self.delete_file(&FileRef::new(commit.clone(), &file.path)).await?;
        }
        check_path(&file.path)?;

        let records = match delimiter {
            Delimiter::None => {
                let (hashes, total) = self.objects.put_object_split(data).await?;
                let chunk_size = self.objects.chunk_size();
                let mut records = PutFileRecords::default();
                let mut remaining = total;
                for (i, hash) in hashes.iter().enumerate() {
                    // Every object but the last has exactly chunk_size
                    // bytes.
                    let mut record = PutFileRecord {
                        object_hash: *hash,
                        size_bytes: remaining.min(chunk_size),
                        overwrite_index: None,
                    };
                    remaining = remaining.saturating_sub(chunk_size);
                    if i == 0 {
                        if let Some(index) = overwrite_index {
                            if index != 0 {
                                record.overwrite_index = Some(index);
                            }
                        }
                    }
                    records.records.push(record);
                }
                records
            }
            Delimiter::Line => {
                let batches =
                    batch_records(data.split_inclusive(|&b| b == b'\n'), target_file_datums, target_file_bytes);
                self.put_batches(batches).await?
            }
            Delimiter::Json => {
                let mut values: Vec<&[u8]> = Vec::new();
                let stream = serde_json::Deserializer::from_slice(&data)
                    .into_iter::<&serde_json::value::RawValue>();
                for value in stream {
                    let value = value.map_err(|e| {
                        EngineError::InvalidArgument(format!("malformed JSON input: {e}"))
                    })?;
                    values.push(value.get().as_bytes());
                }
                let batches =
                    batch_records(values.into_iter(), target_file_datums, target_file_bytes);
                self.put_batches(batches).await?
            }
        };

        self.put_records(&commit, &file.path, &records).await
    }

    /// Store each batch as its own object and wrap them in split records.
    async fn put_batches(&self, batches: Vec<Vec<u8>>) -> Result<PutFileRecords> {
        let mut records = PutFileRecords {
            split: true,
            records: Vec::with_capacity(batches.len()),
        };
        for batch in batches {
            let (hash, size) = self.objects.put_object(Bytes::from(batch)).await?;
            records.records.push(PutFileRecord {
                object_hash: hash,
                size_bytes: size,
                overwrite_index: None,
            });
        }
        Ok(records)
    }

    /// Write records into scratch, gated on the commit being open.
    async fn put_records(
        &self,
        commit: &CommitRef,
        path: &str,
        records: &PutFileRecords,
    ) -> Result<()> {
        let key = format!(
            "{}/{}",
            self.scratch_file_prefix(&commit.repo, &commit.id, path),
            new_commit_id()
        );
        let raw = postcard::to_allocvec(records).map_err(atoll_kv::KvError::from)?;
        let open_key = self.open_commits.path(&commit.id);
        self.kv
            .stm(|stm| {
                if stm.get(&open_key).is_none() {
                    return Err(EngineError::CommitNotOpen(commit.clone()));
                }
                stm.put(key.clone(), raw.clone());
                Ok(())
            })
            .await?;
        debug!(commit = %commit, path, records = records.records.len(), "staged put-file records");
        Ok(())
    }

    /// Stage a tombstone: the path is deleted when the commit finishes.
    pub async fn delete_file(&self, file: &FileRef) -> Result<()> {
        self.check_authorized(&file.commit.repo, Scope::Writer).await?;
        let record = self.inspect_commit(&file.commit).await?;
        if record.finished.is_some() {
            return Err(EngineError::CommitFinished(record.commit.clone()));
        }
        let key = format!(
            "{}/{}",
            self.scratch_file_prefix(&record.commit.repo, &record.commit.id, &file.path),
            new_commit_id()
        );
        self.kv.put(key, Bytes::from_static(TOMBSTONE)).await;
        Ok(())
    }

    /// Copy a file or subtree into an open commit, node by node.
    ///
    /// Each source file node re-enters scratch as a fresh record batch;
    /// split-child naming is not preserved beyond the copied names
    /// themselves.
    pub async fn copy_file(&self, src: &FileRef, dst: &FileRef, overwrite: bool) -> Result<()> {
        self.check_authorized(&src.commit.repo, Scope::Reader).await?;
        self.check_authorized(&dst.commit.repo, Scope::Writer).await?;
        check_path(&dst.path)?;

        let mut dst_commit = dst.commit.clone();
        if !looks_like_commit_id(&dst_commit.id) {
            dst_commit = self.inspect_commit(&dst_commit).await?.commit;
        }
        if overwrite {
            self.delete_file(&FileRef::new(dst_commit.clone(), &dst.path)).await?;
        }

        let src_tree = self.get_tree_for_file(src).await?;
        let src_path = clean_path(&src.path);
        let mut copies: Vec<(String, Vec<ObjectHash>, i64)> = Vec::new();
        src_tree
            .walk(&src_path, |walk_path, node| {
                if node.is_file() {
                    let rel = walk_path.strip_prefix(src_path.as_str()).unwrap_or(walk_path);
                    copies.push((
                        join_path(&dst.path, rel),
                        node.objects().to_vec(),
                        node.subtree_size,
                    ));
                }
                Ok(())
            })
            .map_err(|e| {
                if e.is_path_not_found() {
                    EngineError::FileNotFound(src_path.clone())
                } else {
                    e.into()
                }
            })?;

        for (path, objects, size) in copies {
            let mut records = PutFileRecords::default();
            for (i, object) in objects.iter().enumerate() {
                records.records.push(PutFileRecord {
                    object_hash: *object,
                    // The size rides on the first record; the rest
                    // contribute objects only.
                    size_bytes: if i == 0 { size.max(0) as u64 } else { 0 },
                    overwrite_index: None,
                });
            }
            self.put_records(&dst_commit, &path, &records).await?;
        }
        Ok(())
    }

    /// Read a file's content.
    ///
    /// A `size` of 0 means "to the end of the file".
    pub async fn get_file(&self, file: &FileRef, offset: u64, size: u64) -> Result<Bytes> {
        self.check_authorized(&file.commit.repo, Scope::Reader).await?;
        let tree = self.get_tree_for_file(file).await?;
        let path = clean_path(&file.path);
        let node = tree.get(&path).map_err(|e| {
            if e.is_path_not_found() {
                EngineError::FileNotFound(path.clone())
            } else {
                e.into()
            }
        })?;
        if node.is_dir() {
            return Err(EngineError::InvalidArgument(format!("{path} is a directory")));
        }

        let mut out = Vec::new();
        let mut skip = offset;
        let mut remaining = if size == 0 { u64::MAX } else { size };
        for object in node.objects() {
            if remaining == 0 {
                break;
            }
            let data = self.objects.get_object(object, 0, 0).await?;
            let len = data.len() as u64;
            if skip >= len {
                skip -= len;
                continue;
            }
            let start = skip as usize;
            skip = 0;
            let take = (len - start as u64).min(remaining) as usize;
            out.extend_from_slice(&data[start..start + take]);
            remaining -= take as u64;
        }
        Ok(Bytes::from(out))
    }

    /// Fetch a file's metadata, object list included.
    pub async fn inspect_file(&self, file: &FileRef) -> Result<FileInfo> {
        self.check_authorized(&file.commit.repo, Scope::Reader).await?;
        let tree = self.get_tree_for_file(file).await?;
        let path = clean_path(&file.path);
        let node = tree.get(&path).map_err(|e| {
            if e.is_path_not_found() {
                EngineError::FileNotFound(path.clone())
            } else {
                e.into()
            }
        })?;
        Ok(node_to_file_info(&file.commit, &path, node, true))
    }

    /// List a directory. With `full`, object lists and child names are
    /// populated on each entry.
    pub async fn list_file(&self, file: &FileRef, full: bool) -> Result<Vec<FileInfo>> {
        self.check_authorized(&file.commit.repo, Scope::Reader).await?;
        let tree = self.get_tree_for_file(file).await?;
        let path = clean_path(&file.path);
        let nodes = tree.list(&path).map_err(|e| match e {
            e if e.is_path_not_found() => EngineError::FileNotFound(path.clone()),
            atoll_hashtree::TreeError::PathConflict(p) => {
                EngineError::InvalidArgument(format!("{p} is not a directory"))
            }
            e => e.into(),
        })?;
        Ok(nodes
            .into_iter()
            .map(|node| node_to_file_info(&file.commit, &join_path(&path, &node.name), node, full))
            .collect())
    }

    /// All files and directories in a commit whose path matches a glob
    /// pattern.
    pub async fn glob_file(&self, commit: &CommitRef, pattern: &str) -> Result<Vec<FileInfo>> {
        self.check_authorized(&commit.repo, Scope::Reader).await?;
        let tree = self
            .get_tree_for_file(&FileRef::new(commit.clone(), ""))
            .await?;
        Ok(tree
            .glob(pattern)?
            .into_iter()
            .map(|(path, node)| node_to_file_info(commit, &path, node, false))
            .collect())
    }

    /// Diff two files or subtrees. With no `old_file`, the same path in
    /// the new commit's parent is used. Returns (new, old) file infos.
    pub async fn diff_file(
        &self,
        new_file: &FileRef,
        old_file: Option<&FileRef>,
        shallow: bool,
    ) -> Result<(Vec<FileInfo>, Vec<FileInfo>)> {
        if let Some(old) = old_file {
            self.check_authorized(&old.commit.repo, Scope::Reader).await?;
        }
        self.check_authorized(&new_file.commit.repo, Scope::Reader).await?;

        let new_tree = self.get_tree_for_file(new_file).await?;
        let old = match old_file {
            Some(old) => old.clone(),
            None => {
                let record = self.inspect_commit(&new_file.commit).await?;
                let parent = record
                    .parent_commit
                    .unwrap_or_else(|| CommitRef::new(new_file.commit.repo.clone(), ""));
                FileRef::new(parent, &new_file.path)
            }
        };
        let old_tree = self.get_tree_for_file(&old).await?;

        let depth = if shallow { 1 } else { -1 };
        let mut new_infos = Vec::new();
        let mut old_infos = Vec::new();
        new_tree.diff(&old_tree, &new_file.path, &old.path, depth, |path, node, is_new| {
            if is_new {
                new_infos.push(node_to_file_info(&new_file.commit, path, node, false));
            } else {
                old_infos.push(node_to_file_info(&old.commit, path, node, false));
            }
            Ok(())
        })?;
        Ok((new_infos, old_infos))
    }

    /// The finished snapshot tree of a commit, via the LRU cache.
    ///
    /// A missing reference — no commit, empty ID, or a finished commit
    /// with no stored tree — yields an empty tree.
    pub(crate) async fn get_tree_for_commit(
        &self,
        commit: Option<&CommitRef>,
    ) -> Result<Arc<HashTree>> {
        let Some(commit) = commit else {
            return Ok(Arc::new(HashTree::empty()));
        };
        if commit.id.is_empty() {
            return Ok(Arc::new(HashTree::empty()));
        }
        if looks_like_commit_id(&commit.id) {
            if let Some(tree) = self.tree_cache.get(&commit.id) {
                return Ok(tree);
            }
        }

        let record = self.inspect_commit(commit).await?;
        if record.finished.is_none() {
            return Err(EngineError::CommitOpen(record.commit.clone()));
        }
        let Some(tree_ref) = record.tree else {
            return Ok(Arc::new(HashTree::empty()));
        };

        let data = self.objects.get_object(&tree_ref, 0, 0).await?;
        let tree = Arc::new(HashTree::deserialize(&data)?);
        self.tree_cache.put(&record.commit.id, tree.clone());
        Ok(tree)
    }

    /// The snapshot tree seen when reading a file.
    ///
    /// Finished commits come from the cache; an open commit's tree is
    /// recomputed on every call by replaying the path's scratch records
    /// onto the parent snapshot, and is never cached.
    pub(crate) async fn get_tree_for_file(&self, file: &FileRef) -> Result<Arc<HashTree>> {
        if file.commit.id.is_empty() {
            return Ok(Arc::new(HashTree::empty()));
        }
        let record = self.inspect_commit(&file.commit).await?;
        if record.finished.is_some() {
            return self.get_tree_for_commit(Some(&record.commit)).await;
        }

        let prefix = self.scratch_file_prefix(&record.commit.repo, &record.commit.id, &file.path);
        let scratch = self.kv.list_prefix_by_mod_revision(&format!("{prefix}/")).await;
        let parent_tree = self.get_tree_for_commit(record.parent_commit.as_ref()).await?;
        let mut open = parent_tree.open();
        self.apply_writes(&scratch, &mut open)?;
        Ok(Arc::new(open.finish()))
    }

    /// Fold staged scratch records onto an open tree, in the order given
    /// (callers pass mod-revision ascending order).
    pub(crate) fn apply_writes(
        &self,
        entries: &[(String, Entry)],
        tree: &mut OpenHashTree,
    ) -> Result<()> {
        // Sizes of objects staged in this same pass, consulted when an
        // overwrite replaces them.
        let mut size_map: HashMap<ObjectHash, i64> = HashMap::new();
        for (key, entry) in entries {
            let file_path = clean_path(&self.file_path_from_scratch_key(key));

            if entry.value.as_ref() == TOMBSTONE {
                match tree.delete_file(&file_path) {
                    Ok(()) => {}
                    // Deleting a file that never existed in this commit
                    // is a no-op.
                    Err(e) if e.is_path_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            let records: PutFileRecords =
                postcard::from_bytes(&entry.value).map_err(atoll_kv::KvError::from)?;
            if !records.split {
                if records.records.is_empty() {
                    return Err(EngineError::Internal(format!(
                        "empty put-file record batch at {key}"
                    )));
                }
                for record in &records.records {
                    size_map.insert(record.object_hash, record.size_bytes as i64);
                    if let Some(index) = record.overwrite_index {
                        let mut delta = record.size_bytes as i64;
                        if let Ok(node) = tree.get(&file_path) {
                            for object in node.objects().iter().skip(index as usize) {
                                delta -= size_map.get(object).copied().unwrap_or(0);
                            }
                        }
                        tree.put_file_overwrite(&file_path, &[record.object_hash], index, delta)?;
                    } else {
                        tree.put_file(&file_path, &[record.object_hash], record.size_bytes as i64)?;
                    }
                }
            } else {
                // Split batches append after the highest existing child,
                // whose name is a zero-padded 16-digit hex index.
                let children: Vec<String> = match tree.list(&file_path) {
                    Ok(nodes) => nodes.iter().map(|n| n.name.clone()).collect(),
                    Err(e) if e.is_path_not_found() => Vec::new(),
                    Err(e) => return Err(e.into()),
                };
                let mut index_offset: u64 = 0;
                if let Some(last) = children.last() {
                    index_offset = u64::from_str_radix(last, 16).map_err(|_| {
                        EngineError::InvalidArgument(format!(
                            "error parsing filename {last} as int: this likely means \
                             you're using split on a directory which contains other data \
                             that wasn't put with split"
                        ))
                    })? + 1;
                }
                for (i, record) in records.records.iter().enumerate() {
                    let child = format!("{file_path}/{:016x}", index_offset + i as u64);
                    tree.put_file(&child, &[record.object_hash], record.size_bytes as i64)?;
                }
            }
        }
        Ok(())
    }
}
