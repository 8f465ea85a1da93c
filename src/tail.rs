use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct TailRead {
    pub lines: Vec<String>,
    pub start_offset: u64,
    pub end_offset: u64,
    pub unterminated_from: Option<u64>,
    pub restarted: bool,
    pub error: Option<io::Error>,
}

impl TailRead {
    fn empty(offset: u64) -> Self {
        Self {
            start_offset: offset,
            end_offset: offset,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OffsetReader {
    chunk_size: usize,
}

impl Default for OffsetReader {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl OffsetReader {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn read_from(&self, path: &Path, from_offset: u64) -> TailRead {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                let mut read = TailRead::empty(from_offset);
                read.error = Some(err);
                return read;
            }
        };
        let size = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                let mut read = TailRead::empty(from_offset);
                read.error = Some(err);
                return read;
            }
        };

        let restarted = from_offset > size;
        let start = if restarted { 0 } else { from_offset };
        let mut read = TailRead::empty(start);
        read.restarted = restarted;
        if start == size {
            return read;
        }

        let aligned = match starts_on_line_boundary(&mut file, start) {
            Ok(aligned) => aligned,
            Err(err) => {
                read.error = Some(err);
                return read;
            }
        };
        if let Err(err) = file.seek(SeekFrom::Start(start)) {
            read.error = Some(err);
            return read;
        }

        // Bytes appended after the size check are left for the next pass.
        self.assemble(file.take(size - start), !aligned, &mut read);
        read
    }

    fn assemble(&self, mut source: impl Read, discard_first: bool, read: &mut TailRead) {
        let mut assembler = LineAssembler::new(read.start_offset, discard_first);
        let mut chunk = vec![0u8; self.chunk_size];
        loop {
            match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => assembler.push(&chunk[..n], &mut read.lines),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    read.error = Some(err);
                    read.end_offset = assembler.committed;
                    return;
                }
            }
        }

        read.unterminated_from = assembler.finish(&mut read.lines);
        read.end_offset = assembler.committed;
    }
}

fn starts_on_line_boundary(file: &mut File, offset: u64) -> io::Result<bool> {
    if offset == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(offset - 1))?;
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte)?;
    Ok(byte[0] == b'\n')
}

struct LineAssembler {
    pending: Vec<u8>,
    committed: u64,
    discard_first: bool,
}

impl LineAssembler {
    fn new(start: u64, discard_first: bool) -> Self {
        Self {
            pending: Vec::new(),
            committed: start,
            discard_first,
        }
    }

    fn push(&mut self, mut bytes: &[u8], out: &mut Vec<String>) {
        while let Some(pos) = bytes.iter().position(|byte| *byte == b'\n') {
            self.pending.extend_from_slice(&bytes[..pos]);
            self.committed += self.pending.len() as u64 + 1;
            self.emit(out);
            bytes = &bytes[pos + 1..];
        }
        self.pending.extend_from_slice(bytes);
    }

    fn finish(&mut self, out: &mut Vec<String>) -> Option<u64> {
        if self.pending.is_empty() {
            return None;
        }
        let line_start = self.committed;
        self.committed += self.pending.len() as u64;
        let was_discarded = self.discard_first;
        self.emit(out);
        (!was_discarded).then_some(line_start)
    }

    fn emit(&mut self, out: &mut Vec<String>) {
        let bytes = std::mem::take(&mut self.pending);
        if self.discard_first {
            // Remainder of a line the previous pass already consumed.
            self.discard_first = false;
            return;
        }
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(&bytes);
        out.push(String::from_utf8_lossy(bytes).into_owned());
    }
}
