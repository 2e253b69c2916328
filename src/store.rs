//! The store engine: file lifecycle, record CRUD, the meta slot, and the
//! free-list allocator that backs all of it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::block::{
    BlockKind, EndDescriptor, HeadDescriptor, END_SIZE, HEAD_SIZE, HEADER_SIZE, OVERHEAD,
};
use crate::error::RavrfError;
use crate::header::FileHeader;
use crate::Rref;

fn read_fully<F: Read>(file: &mut F, buf: &mut [u8]) -> Result<(), RavrfError> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            return Err(RavrfError::ShortRead {
                expected: buf.len(),
                got: total,
            });
        }
        total += n;
    }
    Ok(())
}

/// An open RAVRF store, generic over its backing byte stream. Production
/// code gets a `Store<std::fs::File>` from [`create`]/[`open`]; tests can
/// drive a `Store<std::io::Cursor<Vec<u8>>>` directly via
/// [`Store::create`]/[`Store::open`].
pub struct Store<F> {
    file: Option<F>,
    header: FileHeader,
    size: u64,
}

impl<F> Store<F> {
    /// Actual used size of the file, from offset 0 through the last record.
    pub fn file_length(&self) -> u64 {
        self.size
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Releases and returns the backing stream without flushing. Used by
    /// tests and tools that want to inspect the raw bytes of an in-memory
    /// store after a sequence of operations.
    pub fn into_inner(mut self) -> Option<F> {
        self.file.take()
    }

    fn ensure_open(&self) -> Result<(), RavrfError> {
        if self.file.is_none() {
            return Err(RavrfError::NotOpen);
        }
        Ok(())
    }
}

/// Read-only operations: opening an existing store and fetching record data.
impl<F: Read + Seek> Store<F> {
    pub fn open(mut file: F) -> Result<Self, RavrfError> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        match read_fully(&mut file, &mut buf) {
            Ok(()) => {}
            Err(RavrfError::ShortRead { .. }) => {
                return Err(RavrfError::BadHeader(
                    "file is shorter than the header".to_string(),
                ))
            }
            Err(other) => return Err(other),
        }
        let header = FileHeader::decode(&buf)?;
        let size = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file: Some(file),
            header,
            size,
        })
    }

    fn read_head_at(&mut self, rref: u64) -> Result<HeadDescriptor, RavrfError> {
        let file = self.file.as_mut().ok_or(RavrfError::NotOpen)?;
        file.seek(SeekFrom::Start(rref))?;
        let mut buf = [0u8; HEAD_SIZE];
        read_fully(file, &mut buf)?;
        HeadDescriptor::decode(&buf)
    }

    fn read_end_at(&mut self, rref: u64) -> Result<EndDescriptor, RavrfError> {
        let file = self.file.as_mut().ok_or(RavrfError::NotOpen)?;
        file.seek(SeekFrom::Start(rref))?;
        let mut buf = [0u8; END_SIZE];
        read_fully(file, &mut buf)?;
        EndDescriptor::decode(&buf)
    }

    fn read_payload(&mut self, rref: u64, expected: BlockKind) -> Result<Vec<u8>, RavrfError> {
        let head = self.read_head_at(rref)?;
        if head.kind != expected {
            return Err(RavrfError::KindMismatch {
                rref: rref as Rref,
                expected,
                found: head.kind,
            });
        }
        let data_size = head.data_size();
        let mut buf = vec![0u8; data_size as usize];
        let file = self.file.as_mut().ok_or(RavrfError::NotOpen)?;
        file.seek(SeekFrom::Start(rref + HEAD_SIZE as u64))?;
        read_fully(file, &mut buf)?;
        Ok(buf)
    }

    /// Returns exactly `data_size` bytes of the DATA record at `rref`.
    pub fn read_data(&mut self, rref: Rref) -> Result<Vec<u8>, RavrfError> {
        self.ensure_open()?;
        self.read_payload(rref as u64, BlockKind::Data)
    }

    /// Returns the meta record's bytes, or an empty vector if none exists.
    pub fn get_meta(&mut self) -> Result<Vec<u8>, RavrfError> {
        self.ensure_open()?;
        if self.header.meta_root == 0 {
            return Ok(Vec::new());
        }
        self.read_payload(self.header.meta_root as u64, BlockKind::Meta)
    }
}

/// Creation and handle teardown.
impl<F: Write + Seek> Store<F> {
    pub fn create(mut file: F) -> Result<Self, RavrfError> {
        let header = FileHeader::fresh();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.flush()?;
        Ok(Self {
            file: Some(file),
            header,
            size: HEADER_SIZE,
        })
    }

    fn write_header(&mut self) -> Result<(), RavrfError> {
        let bytes = self.header.encode();
        let file = self.file.as_mut().ok_or(RavrfError::NotOpen)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(())
    }

    /// Flushes and releases the underlying handle. Idempotent.
    pub fn close(&mut self) -> Result<(), RavrfError> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        self.file = None;
        Ok(())
    }
}

/// Mutating operations: every one of these needs to read neighboring
/// descriptors as well as write them, so they all live under the combined
/// bound.
impl<F: Read + Write + Seek> Store<F> {
    fn write_head_at(&mut self, rref: u64, head: &HeadDescriptor) -> Result<(), RavrfError> {
        let file = self.file.as_mut().ok_or(RavrfError::NotOpen)?;
        file.seek(SeekFrom::Start(rref))?;
        file.write_all(&head.encode())?;
        Ok(())
    }

    fn write_end_at(&mut self, rref: u64, end: &EndDescriptor) -> Result<(), RavrfError> {
        let file = self.file.as_mut().ok_or(RavrfError::NotOpen)?;
        file.seek(SeekFrom::Start(rref))?;
        file.write_all(&end.encode())?;
        Ok(())
    }

    /// Removes the free block at `rref` (with the given, already-known
    /// `prev_free`/`next_free`) from the list, patching its neighbors and
    /// `free_root` as needed.
    ///
    /// Deliberately keys the `free_root` patch on `free_root == rref`
    /// rather than on `prev_free == 0`: a synthetic, not-actually-linked
    /// descriptor (used to signal "append at EOF" — see `find_available`)
    /// also carries `prev_free == 0`, and must be a true no-op here because
    /// any real unlinking it needed was already done by the caller.
    fn unlink_free_block(
        &mut self,
        rref: u64,
        prev_free: u64,
        next_free: u64,
    ) -> Result<(), RavrfError> {
        if prev_free != 0 {
            let prev_head = self.read_head_at(prev_free)?;
            let patched = HeadDescriptor::new_available(
                prev_head.record_size,
                prev_head.prev_free(),
                next_free as Rref,
            );
            self.write_head_at(prev_free, &patched)?;
        } else if self.header.free_root as u64 == rref {
            self.header.free_root = next_free as Rref;
            self.write_header()?;
        }
        if next_free != 0 {
            let next_head = self.read_head_at(next_free)?;
            let patched = HeadDescriptor::new_available(
                next_head.record_size,
                prev_free as Rref,
                next_head.next_free(),
            );
            self.write_head_at(next_free, &patched)?;
        }
        Ok(())
    }

    /// Walks the free list first-fit, reclaiming a trailing block flush
    /// against EOF if the walk comes up empty. See `SPEC_FULL.md` §4.4.
    fn find_available(&mut self, required: u32) -> Result<(u64, HeadDescriptor), RavrfError> {
        let mut location = self.header.free_root as u64;
        let mut tail: Option<(u64, HeadDescriptor)> = None;

        while location != 0 {
            let head = self.read_head_at(location)?;
            let block_end = location + OVERHEAD as u64 + head.record_size as u64;
            if block_end >= self.size {
                tail = Some((location, head));
            }
            if head.record_size >= required {
                log::debug!(
                    "find_available: first-fit at {location} (record_size={})",
                    head.record_size
                );
                return Ok((location, head));
            }
            location = head.next_free() as u64;
        }

        if let Some((tail_rref, tail_head)) = tail {
            log::debug!(
                "find_available: reclaiming trailing free block at {tail_rref} ({} bytes)",
                tail_head.record_size
            );
            self.unlink_free_block(
                tail_rref,
                tail_head.prev_free() as u64,
                tail_head.next_free() as u64,
            )?;
            self.size = tail_rref;
        }
        let synthetic = HeadDescriptor::new_available(required, 0, 0);
        Ok((self.size, synthetic))
    }

    /// Splits `chosen_head` if there's room for a useful remainder,
    /// otherwise consumes it whole and unlinks it from the free list.
    fn update_free_list(
        &mut self,
        chosen_rref: u64,
        chosen_head: HeadDescriptor,
        required: u32,
    ) -> Result<(u32, u64), RavrfError> {
        let ds = chosen_head.record_size;
        if ds > required + OVERHEAD {
            let remainder_size = ds - required - OVERHEAD;
            let remainder_head = HeadDescriptor::new_available(
                remainder_size,
                chosen_head.prev_free(),
                chosen_head.next_free(),
            );
            self.write_head_at(chosen_rref, &remainder_head)?;
            let remainder_end = chosen_rref + HEAD_SIZE as u64 + remainder_size as u64;
            self.write_end_at(
                remainder_end,
                &EndDescriptor::new(remainder_size, BlockKind::Available),
            )?;
            let new_rref = remainder_end + END_SIZE as u64;
            log::debug!(
                "update_free_list: split {chosen_rref} into remainder={remainder_size}, new record at {new_rref}"
            );
            Ok((required, new_rref))
        } else {
            log::debug!("update_free_list: consuming whole block at {chosen_rref} ({ds} bytes)");
            self.unlink_free_block(
                chosen_rref,
                chosen_head.prev_free() as u64,
                chosen_head.next_free() as u64,
            )?;
            Ok((ds, chosen_rref))
        }
    }

    /// Assembles and writes a brand-new DATA/META record at `rref`.
    fn build_record(
        &mut self,
        kind: BlockKind,
        data: &[u8],
        record_size: u32,
        rref: u64,
    ) -> Result<(), RavrfError> {
        let buf = self.framed_record(kind, data, record_size);
        let file = self.file.as_mut().ok_or(RavrfError::NotOpen)?;
        file.seek(SeekFrom::Start(rref))?;
        file.write_all(&buf)?;
        file.flush()?;

        let end_offset = rref + buf.len() as u64;
        if end_offset > self.size {
            self.size = end_offset;
        }
        Ok(())
    }

    /// Rewrites an existing DATA/META record's payload in place, keeping
    /// `record_size` (and thus the end descriptor) unchanged.
    fn write_in_place(
        &mut self,
        rref: u64,
        kind: BlockKind,
        data: &[u8],
        record_size: u32,
    ) -> Result<(), RavrfError> {
        let buf = self.framed_record(kind, data, record_size);
        let file = self.file.as_mut().ok_or(RavrfError::NotOpen)?;
        file.seek(SeekFrom::Start(rref))?;
        file.write_all(&buf[..HEAD_SIZE + record_size as usize])?;
        file.flush()?;
        Ok(())
    }

    fn framed_record(&self, kind: BlockKind, data: &[u8], record_size: u32) -> Vec<u8> {
        let data_size = data.len() as u32;
        let open_size = record_size - data_size;
        let head = match kind {
            BlockKind::Data => HeadDescriptor::new_data(record_size, data_size, open_size),
            BlockKind::Meta => HeadDescriptor::new_meta(record_size, data_size, open_size),
            BlockKind::Available => unreachable!("only DATA/META records are framed"),
        };
        let end = EndDescriptor::new(record_size, kind);

        let mut buf = Vec::with_capacity(HEAD_SIZE + record_size as usize + END_SIZE);
        buf.extend_from_slice(&head.encode());
        buf.extend_from_slice(data);
        buf.resize(HEAD_SIZE + record_size as usize, 0);
        buf.extend_from_slice(&end.encode());
        buf
    }

    fn allocate_record(
        &mut self,
        kind: BlockKind,
        data: &[u8],
        required: u32,
    ) -> Result<u64, RavrfError> {
        let (chosen_rref, chosen_head) = self.find_available(required)?;
        let (record_size, new_rref) = self.update_free_list(chosen_rref, chosen_head, required)?;
        self.build_record(kind, data, record_size, new_rref)?;
        Ok(new_rref)
    }

    /// Inserts `data` as a new DATA record and returns its RREF.
    pub fn add(&mut self, data: &[u8], padding: u32) -> Result<Rref, RavrfError> {
        self.ensure_open()?;
        if data.is_empty() {
            return Err(RavrfError::Invalid("data must not be empty".to_string()));
        }
        let required = required_size(data.len(), padding)?;
        let new_rref = self.allocate_record(BlockKind::Data, data, required)?;
        Ok(new_rref as Rref)
    }

    /// Rewrites the DATA record at `rref`, reusing its slot when it still
    /// fits or reallocating (and freeing the old slot) otherwise. `rref ==
    /// 0` is equivalent to [`Store::add`].
    pub fn save(&mut self, rref: Rref, data: &[u8], padding: u32) -> Result<Rref, RavrfError> {
        self.ensure_open()?;
        if rref == 0 {
            return self.add(data, padding);
        }
        let rref_u64 = rref as u64;
        let head = self.read_head_at(rref_u64)?;
        if head.kind != BlockKind::Data {
            return Err(RavrfError::KindMismatch {
                rref,
                expected: BlockKind::Data,
                found: head.kind,
            });
        }
        if head.record_size >= data.len() as u32 {
            self.write_in_place(rref_u64, BlockKind::Data, data, head.record_size)?;
            Ok(rref)
        } else {
            let new_rref = self.add(data, padding)?;
            self.delete(rref)?;
            Ok(new_rref)
        }
    }

    /// Frees the DATA/META record at `rref`, coalescing with any adjacent
    /// free neighbors (right neighbor first, then left).
    pub fn delete(&mut self, rref: Rref) -> Result<(), RavrfError> {
        self.ensure_open()?;
        let rref_u64 = rref as u64;
        if rref_u64 < HEADER_SIZE {
            return Err(RavrfError::Invalid(format!(
                "rref {rref} is below HEADER_SIZE ({HEADER_SIZE})"
            )));
        }
        let head = self.read_head_at(rref_u64)?;
        if head.kind != BlockKind::Data && head.kind != BlockKind::Meta {
            return Err(RavrfError::KindMismatch {
                rref,
                expected: BlockKind::Data,
                found: head.kind,
            });
        }
        let mut rs = head.record_size;

        // Right-merge.
        let next_rref = rref_u64 + OVERHEAD as u64 + rs as u64;
        if next_rref < self.size {
            let next_head = self.read_head_at(next_rref)?;
            if next_head.kind == BlockKind::Available {
                log::debug!("delete: right-merging {rref} with neighbor at {next_rref}");
                self.unlink_free_block(
                    next_rref,
                    next_head.prev_free() as u64,
                    next_head.next_free() as u64,
                )?;
                rs += OVERHEAD + next_head.record_size;
            }
        }

        // Left-merge.
        let mut merged_with_left = false;
        if rref_u64 >= HEADER_SIZE + END_SIZE as u64 {
            let prev_end_rref = rref_u64 - END_SIZE as u64;
            let prev_end = self.read_end_at(prev_end_rref)?;
            if prev_end.kind == BlockKind::Available {
                let rs_p = prev_end.record_size;
                let pred_rref = rref_u64 - (rs_p as u64 + OVERHEAD as u64);
                let pred_head = self.read_head_at(pred_rref)?;
                let new_size = rs_p + OVERHEAD + rs;
                log::debug!("delete: left-merging {rref} into predecessor at {pred_rref}");
                let patched = HeadDescriptor::new_available(
                    new_size,
                    pred_head.prev_free(),
                    pred_head.next_free(),
                );
                self.write_head_at(pred_rref, &patched)?;
                let end_rref = pred_rref + HEAD_SIZE as u64 + new_size as u64;
                self.write_end_at(end_rref, &EndDescriptor::new(new_size, BlockKind::Available))?;
                merged_with_left = true;
            }
        }

        if !merged_with_left {
            // No prior free-list member absorbed this block, so it needs to
            // become one itself (this also covers the right-merge-only
            // case: the combined block at `rref` was never in the list).
            let old_free_root = self.header.free_root;
            self.write_head_at(rref_u64, &HeadDescriptor::new_available(rs, 0, old_free_root))?;
            self.write_end_at(
                rref_u64 + HEAD_SIZE as u64 + rs as u64,
                &EndDescriptor::new(rs, BlockKind::Available),
            )?;
            if old_free_root != 0 {
                let old_root_head = self.read_head_at(old_free_root as u64)?;
                let patched = HeadDescriptor::new_available(
                    old_root_head.record_size,
                    rref,
                    old_root_head.next_free(),
                );
                self.write_head_at(old_free_root as u64, &patched)?;
            }
            self.header.free_root = rref;
            self.write_header()?;
        }

        if self.header.meta_root == rref {
            self.header.meta_root = 0;
            self.write_header()?;
        }

        Ok(())
    }

    /// Writes or replaces the singleton meta record.
    pub fn put_meta(&mut self, data: &[u8], padding: u32) -> Result<(), RavrfError> {
        self.ensure_open()?;
        if data.is_empty() {
            return Err(RavrfError::Invalid(
                "meta data must not be empty".to_string(),
            ));
        }
        let required = required_size(data.len(), padding)?;

        if self.header.meta_root == 0 {
            let new_rref = self.allocate_record(BlockKind::Meta, data, required)?;
            self.header.meta_root = new_rref as Rref;
            self.write_header()?;
            return Ok(());
        }

        let meta_rref = self.header.meta_root as u64;
        let head = self.read_head_at(meta_rref)?;
        if head.record_size >= required {
            self.write_in_place(meta_rref, BlockKind::Meta, data, head.record_size)?;
            return Ok(());
        }

        let old_rref = self.header.meta_root;
        let new_rref = self.allocate_record(BlockKind::Meta, data, required)?;
        self.header.meta_root = new_rref as Rref;
        self.write_header()?;
        self.delete(old_rref)?;
        Ok(())
    }
}

fn required_size(data_len: usize, padding: u32) -> Result<u32, RavrfError> {
    u32::try_from(data_len)
        .ok()
        .and_then(|len| len.checked_add(padding))
        .ok_or_else(|| RavrfError::Invalid("requested record size overflows u32".to_string()))
}

const SUFFIX: &str = "ravrf";

fn validate_path(path: &Path) -> Result<PathBuf, RavrfError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RavrfError::BadPath("path has no file name".to_string()))?;
    if name.starts_with('.') {
        return Err(RavrfError::BadPath(
            "file name cannot start with '.'".to_string(),
        ));
    }
    match path.extension() {
        None => Ok(path.with_extension(SUFFIX)),
        Some(ext) => {
            let ext = ext.to_str().unwrap_or("").to_ascii_lowercase();
            if ext == SUFFIX {
                Ok(path.to_path_buf())
            } else {
                Err(RavrfError::BadPath(format!(
                    "file suffix must be '.{SUFFIX}' or absent"
                )))
            }
        }
    }
}

/// Creates a new on-disk store at `path` (appending `.ravrf` if no suffix
/// was given). Fails with [`RavrfError::AlreadyExists`] if the resolved
/// path already exists.
pub fn create<P: AsRef<Path>>(path: P) -> Result<Store<File>, RavrfError> {
    let resolved = validate_path(path.as_ref())?;
    if resolved.exists() {
        return Err(RavrfError::AlreadyExists);
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&resolved)?;
    Store::create(file)
}

/// Opens an existing on-disk store at `path`.
pub fn open<P: AsRef<Path>>(path: P) -> Result<Store<File>, RavrfError> {
    let resolved = validate_path(path.as_ref())?;
    if !resolved.exists() {
        return Err(RavrfError::NotFound);
    }
    if !resolved.is_file() {
        return Err(RavrfError::NotAFile);
    }
    let file = OpenOptions::new().read(true).write(true).open(&resolved)?;
    Store::open(file)
}
