//! Read-only diagnostic scanner.
//!
//! Walks a store sequentially from the first record, independent of the
//! free list, and renders a human-readable report. Tolerates corruption
//! rather than failing: a bad block stops the walk but the report produced
//! so far is still returned.

use std::fmt::Write as _;
use std::io::{Read, Seek, SeekFrom};

use crate::block::{BlockKind, EndDescriptor, HeadDescriptor, END_SIZE, HEAD_SIZE, HEADER_SIZE};
use crate::error::RavrfError;
use crate::header::FileHeader;

/// One entry in a [`LintReport`]: either a successfully parsed block or a
/// problem found while parsing one.
#[derive(Debug, Clone)]
pub enum LintEntry {
    Block {
        location: u64,
        kind: BlockKind,
        record_size: u32,
        /// `(data_size, open_size)` for DATA/META, `(prev_free, next_free)` for AVAILABLE.
        fields: (u32, u32),
        /// Lossy UTF-8 preview of the payload, truncated to `data_size` bytes. `None` for AVAILABLE blocks.
        preview: Option<String>,
    },
    Problem { location: u64, message: String },
}

/// The full result of a lint pass: the decoded header (if readable), every
/// block or problem encountered in file order, and the offset the walk
/// stopped at.
#[derive(Debug, Clone)]
pub struct LintReport {
    pub header: Option<FileHeader>,
    pub file_size: u64,
    pub entries: Vec<LintEntry>,
    pub stopped_at: u64,
}

impl LintReport {
    /// Renders the report in the style of a text dump: one paragraph per
    /// block, file size and header summarized up top.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "RAVRF Lint Report");
        let _ = writeln!(out, "File size: {} bytes", self.file_size);
        match &self.header {
            Some(h) => {
                let _ = writeln!(
                    out,
                    "Header: version={}, meta_root={}, free_root={}\n",
                    h.version, h.meta_root, h.free_root
                );
            }
            None => {
                let _ = writeln!(out, "Header: UNREADABLE\n");
            }
        }
        for entry in &self.entries {
            match entry {
                LintEntry::Block {
                    location,
                    kind,
                    record_size,
                    fields,
                    preview,
                } => {
                    let _ = writeln!(
                        out,
                        "{location}: {kind:?} block, record_size={record_size}, fields=({}, {})",
                        fields.0, fields.1
                    );
                    if let Some(text) = preview {
                        for chunk in text.as_bytes().chunks(100) {
                            let _ = writeln!(out, "    {}", String::from_utf8_lossy(chunk));
                        }
                    }
                    let _ = writeln!(out);
                }
                LintEntry::Problem { location, message } => {
                    let _ = writeln!(out, "{location}: ERROR: {message}");
                }
            }
        }
        let _ = writeln!(out, "*/ End of walk at location {}", self.stopped_at);
        out
    }
}

/// Runs a lint pass over `file`, which is left at an unspecified position
/// afterwards.
pub fn lint<F: Read + Seek>(file: &mut F) -> Result<LintReport, RavrfError> {
    let file_size = file.seek(SeekFrom::End(0))?;

    let header = {
        let mut buf = [0u8; HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        if read_at_most(file, &mut buf)? == HEADER_SIZE as usize {
            FileHeader::decode(&buf).ok()
        } else {
            None
        }
    };

    let mut entries = Vec::new();
    let mut location = HEADER_SIZE;

    while location < file_size {
        let mut head_buf = [0u8; HEAD_SIZE];
        file.seek(SeekFrom::Start(location))?;
        let got = read_at_most(file, &mut head_buf)?;
        if got < HEAD_SIZE {
            entries.push(LintEntry::Problem {
                location,
                message: format!("incomplete head descriptor: expected {HEAD_SIZE} bytes, got {got}"),
            });
            break;
        }
        let head = match HeadDescriptor::decode(&head_buf) {
            Ok(h) => h,
            Err(e) => {
                entries.push(LintEntry::Problem {
                    location,
                    message: format!("invalid head descriptor: {e}"),
                });
                break;
            }
        };

        let data_start = location + HEAD_SIZE as u64;
        let preview = if head.kind == BlockKind::Available {
            None
        } else {
            let mut data_buf = vec![0u8; head.record_size as usize];
            file.seek(SeekFrom::Start(data_start))?;
            let got = read_at_most(file, &mut data_buf)?;
            if got < data_buf.len() {
                entries.push(LintEntry::Problem {
                    location: data_start,
                    message: format!(
                        "incomplete payload: expected {} bytes, got {got}",
                        data_buf.len()
                    ),
                });
                break;
            }
            let visible = head.data_size().min(head.record_size) as usize;
            Some(String::from_utf8_lossy(&data_buf[..visible]).into_owned())
        };

        let fields = (head.field_a, head.field_b);
        entries.push(LintEntry::Block {
            location,
            kind: head.kind,
            record_size: head.record_size,
            fields,
            preview,
        });

        let end_location = data_start + head.record_size as u64;
        let mut end_buf = [0u8; END_SIZE];
        file.seek(SeekFrom::Start(end_location))?;
        let got = read_at_most(file, &mut end_buf)?;
        if got < END_SIZE {
            entries.push(LintEntry::Problem {
                location: end_location,
                message: format!("incomplete end descriptor: expected {END_SIZE} bytes, got {got}"),
            });
            break;
        }
        match EndDescriptor::decode(&end_buf) {
            Ok(end) if end.kind != head.kind => {
                entries.push(LintEntry::Problem {
                    location: end_location,
                    message: format!(
                        "end descriptor kind {:?} does not match head kind {:?}",
                        end.kind, head.kind
                    ),
                });
            }
            Ok(_) => {}
            Err(e) => {
                entries.push(LintEntry::Problem {
                    location: end_location,
                    message: format!("invalid end descriptor: {e}"),
                });
            }
        }

        location = end_location + END_SIZE as u64;
    }

    Ok(LintReport {
        header,
        file_size,
        entries,
        stopped_at: location,
    })
}

/// Like `read_exact` but tolerates short reads, returning how much was
/// actually read instead of erroring.
fn read_at_most<F: Read>(file: &mut F, buf: &mut [u8]) -> Result<usize, RavrfError> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::io::Cursor;

    #[test]
    fn lints_empty_store() {
        let store = Store::create(Cursor::new(Vec::new())).unwrap();
        let mut cursor = store.into_inner().unwrap();
        let report = lint(&mut cursor).unwrap();
        assert!(report.header.is_some());
        assert!(report.entries.is_empty());
    }

    #[test]
    fn lints_populated_store() {
        let mut store = Store::create(Cursor::new(Vec::new())).unwrap();
        store.add(b"hello", 0).unwrap();
        store.add(b"world!!", 4).unwrap();
        store.put_meta(b"m", 0).unwrap();

        let mut cursor = store.into_inner().unwrap();
        let report = lint(&mut cursor).unwrap();
        assert!(report.header.is_some());
        let data_blocks = report
            .entries
            .iter()
            .filter(|e| matches!(e, LintEntry::Block { kind: BlockKind::Data, .. }))
            .count();
        assert_eq!(data_blocks, 2);
        let meta_blocks = report
            .entries
            .iter()
            .filter(|e| matches!(e, LintEntry::Block { kind: BlockKind::Meta, .. }))
            .count();
        assert_eq!(meta_blocks, 1);
        let rendered = report.render();
        assert!(rendered.contains("RAVRF Lint Report"));
    }

    #[test]
    fn reports_truncated_file() {
        let mut store = Store::create(Cursor::new(Vec::new())).unwrap();
        store.add(b"hello", 0).unwrap();
        let mut cursor = store.into_inner().unwrap();
        let bytes = cursor.get_mut();
        let new_len = bytes.len() - 3;
        bytes.truncate(new_len);
        cursor.set_position(0);

        let report = lint(&mut cursor).unwrap();
        assert!(report
            .entries
            .iter()
            .any(|e| matches!(e, LintEntry::Problem { .. })));
    }

    #[test]
    fn reports_coalesced_free_block() {
        let mut store = Store::create(Cursor::new(Vec::new())).unwrap();
        let a = store.add(b"hello", 0).unwrap();
        store.add(b"world", 0).unwrap();
        store.delete(a).unwrap();

        let mut cursor = store.into_inner().unwrap();
        let report = lint(&mut cursor).unwrap();
        let available = report
            .entries
            .iter()
            .filter(|e| matches!(e, LintEntry::Block { kind: BlockKind::Available, .. }))
            .count();
        assert_eq!(available, 1);
    }
}
