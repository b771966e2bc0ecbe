//! Output sinks and the file-handle table.
//!
//! [`PrintWriter`] is the embedder-facing sink for `STDOUT`/`STDERR`: the
//! default [`StdPrint`] writes through to the process streams, while
//! [`CollectStringPrint`] captures output for tests. Everything else —
//! real files and in-memory scalar-backed handles — lives in the [`IoTable`],
//! indexed by [`IoId`] from glob IO slots.

use std::{
    borrow::Cow,
    cell::RefCell,
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    rc::Rc,
};

use crate::{
    error::RunResult,
    heap::{Heap, HeapId},
    resource::ResourceTracker,
    value::Value,
};

/// Sink for `STDOUT`/`STDERR` output.
///
/// Implement this to capture or redirect output from embedded Perl code.
pub trait PrintWriter: std::fmt::Debug {
    /// Write a chunk to standard output. No separators or newlines are added.
    fn stdout_write(&mut self, output: Cow<'_, str>);

    /// Write a chunk to standard error (warnings, unhandled-die reporting).
    fn stderr_write(&mut self, output: Cow<'_, str>);
}

/// Default writer: passes output through to the real process streams.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) {
        let _ = io::stdout().write_all(output.as_bytes());
    }

    fn stderr_write(&mut self, output: Cow<'_, str>) {
        let _ = io::stderr().write_all(output.as_bytes());
    }
}

/// Collects both streams into shared buffers; used throughout the test
/// suites. The buffers are `Rc`-shared so a caller can keep reading after
/// the writer has moved into the interpreter.
#[derive(Debug, Default)]
pub struct CollectStringPrint {
    out: Rc<RefCell<String>>,
    err: Rc<RefCell<String>>,
}

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handles onto the (stdout, stderr) buffers.
    #[must_use]
    pub fn buffers(&self) -> (Rc<RefCell<String>>, Rc<RefCell<String>>) {
        (Rc::clone(&self.out), Rc::clone(&self.err))
    }

    #[must_use]
    pub fn output(&self) -> String {
        self.out.borrow().clone()
    }

    #[must_use]
    pub fn errors(&self) -> String {
        self.err.borrow().clone()
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) {
        self.out.borrow_mut().push_str(&output);
    }

    fn stderr_write(&mut self, output: Cow<'_, str>) {
        self.err.borrow_mut().push_str(&output);
    }
}

/// Discards all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn stdout_write(&mut self, _output: Cow<'_, str>) {}

    fn stderr_write(&mut self, _output: Cow<'_, str>) {}
}

/// Index into the [`IoTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct IoId(pub u32);

/// One open handle.
#[derive(Debug)]
pub(crate) enum Handle {
    Stdout,
    Stderr,
    Stdin,
    FileRead { reader: io::BufReader<File>, eof: bool },
    FileWrite(File),
    /// `open $fh, '<', \$scalar` — reads from a byte snapshot of the scalar.
    ScalarRead { data: Vec<u8>, pos: usize },
    /// `open $fh, '>', \$scalar` — appends to the target scalar cell.
    ScalarWrite { cell: HeapId },
    Closed,
}

/// All handles of one compilation context. `IoId`s are never reused, so a
/// stale glob slot reads as closed rather than aliasing a new file.
#[derive(Debug, Default)]
pub(crate) struct IoTable {
    handles: Vec<Handle>,
}

impl IoTable {
    /// Creates the table with the three standard handles at fixed ids 0..3.
    pub(crate) fn with_standard_handles() -> Self {
        Self { handles: vec![Handle::Stdout, Handle::Stderr, Handle::Stdin] }
    }

    pub(crate) const STDOUT: IoId = IoId(0);
    pub(crate) const STDERR: IoId = IoId(1);
    pub(crate) const STDIN: IoId = IoId(2);

    fn add(&mut self, handle: Handle) -> IoId {
        self.handles.push(handle);
        IoId(u32::try_from(self.handles.len() - 1).unwrap_or(u32::MAX))
    }

    fn get_mut(&mut self, id: IoId) -> &mut Handle {
        self.handles.get_mut(id.0 as usize).unwrap_or_else(|| unreachable!("IoId out of range"))
    }

    /// Opens a real file. `mode` is the Perl open mode: `<`, `>`, `>>`.
    pub(crate) fn open_file(&mut self, path: &str, mode: &str) -> io::Result<IoId> {
        let handle = match mode {
            "<" => Handle::FileRead { reader: io::BufReader::new(File::open(path)?), eof: false },
            ">" => Handle::FileWrite(OpenOptions::new().write(true).create(true).truncate(true).open(path)?),
            ">>" => Handle::FileWrite(OpenOptions::new().append(true).create(true).open(path)?),
            _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("Unknown open() mode '{mode}'"))),
        };
        Ok(self.add(handle))
    }

    pub(crate) fn open_scalar_read(&mut self, data: Vec<u8>) -> IoId {
        self.add(Handle::ScalarRead { data, pos: 0 })
    }

    pub(crate) fn open_scalar_write(&mut self, cell: HeapId) -> IoId {
        self.add(Handle::ScalarWrite { cell })
    }

    pub(crate) fn close(&mut self, id: IoId) -> bool {
        let slot = self.get_mut(id);
        let was_open = !matches!(slot, Handle::Closed);
        *self.get_mut(id) = Handle::Closed;
        was_open
    }

    /// Writes bytes to a handle. Returns false (with `$!` left to the caller)
    /// on closed handles or OS errors.
    pub(crate) fn write(
        &mut self,
        id: IoId,
        bytes: &[u8],
        heap: &mut Heap<impl ResourceTracker>,
        writer: &mut dyn PrintWriter,
    ) -> RunResult<bool> {
        match self.get_mut(id) {
            Handle::Stdout => {
                writer.stdout_write(String::from_utf8_lossy(bytes).into_owned().into());
                Ok(true)
            }
            Handle::Stderr => {
                writer.stderr_write(String::from_utf8_lossy(bytes).into_owned().into());
                Ok(true)
            }
            Handle::FileWrite(file) => Ok(file.write_all(bytes).is_ok()),
            Handle::ScalarWrite { cell } => {
                let cell = *cell;
                let appended = {
                    let scalar = heap.scalar(cell);
                    let mut s = scalar.value.to_byte_vec(heap);
                    s.extend_from_slice(bytes);
                    s
                };
                heap.scalar_mut(cell).value = Value::from_bytes(appended);
                Ok(true)
            }
            Handle::Stdin | Handle::FileRead { .. } | Handle::ScalarRead { .. } | Handle::Closed => Ok(false),
        }
    }

    /// Reads one record, honouring the separator `sep` (`None` means slurp).
    /// Returns `None` at end of input.
    pub(crate) fn read_record(&mut self, id: IoId, sep: Option<&[u8]>) -> io::Result<Option<Vec<u8>>> {
        match self.get_mut(id) {
            Handle::Stdin => read_record_from(&mut io::stdin().lock(), sep),
            Handle::FileRead { reader, eof } => {
                let record = read_record_from(reader, sep)?;
                if record.is_none() {
                    *eof = true;
                }
                Ok(record)
            }
            Handle::ScalarRead { data, pos } => {
                if *pos >= data.len() {
                    return Ok(None);
                }
                let rest = &data[*pos..];
                let take = match sep {
                    Some(sep) if !sep.is_empty() => {
                        rest.windows(sep.len()).position(|w| w == sep).map_or(rest.len(), |i| i + sep.len())
                    }
                    _ => rest.len(),
                };
                let record = rest[..take].to_vec();
                *pos += take;
                Ok(Some(record))
            }
            _ => Ok(None),
        }
    }

    /// Perl `eof`: true when the next read would return nothing.
    pub(crate) fn at_eof(&mut self, id: IoId) -> bool {
        match self.get_mut(id) {
            Handle::FileRead { reader, eof } => {
                if *eof {
                    return true;
                }
                match reader.fill_buf() {
                    Ok(buf) => buf.is_empty(),
                    Err(_) => true,
                }
            }
            Handle::ScalarRead { data, pos } => *pos >= data.len(),
            Handle::Stdin => false,
            _ => true,
        }
    }
}

use std::io::BufRead;

/// Reads bytes up to and including `sep` (or all remaining input when `sep`
/// is `None`/empty). A multi-byte separator falls back to a byte-wise scan.
fn read_record_from<R: Read>(reader: &mut R, sep: Option<&[u8]>) -> io::Result<Option<Vec<u8>>> {
    let mut out = Vec::new();
    match sep {
        None | Some([]) => {
            reader.read_to_end(&mut out)?;
        }
        Some(sep) => {
            let mut byte = [0u8; 1];
            loop {
                match reader.read(&mut byte)? {
                    0 => break,
                    _ => {
                        out.push(byte[0]);
                        if out.ends_with(sep) {
                            break;
                        }
                    }
                }
            }
        }
    }
    if out.is_empty() { Ok(None) } else { Ok(Some(out)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_read_honours_separator() {
        let mut table = IoTable::with_standard_handles();
        let id = table.open_scalar_read(b"a\nbb\ncc".to_vec());
        assert_eq!(table.read_record(id, Some(b"\n")).unwrap(), Some(b"a\n".to_vec()));
        assert_eq!(table.read_record(id, Some(b"\n")).unwrap(), Some(b"bb\n".to_vec()));
        assert_eq!(table.read_record(id, Some(b"\n")).unwrap(), Some(b"cc".to_vec()));
        assert_eq!(table.read_record(id, Some(b"\n")).unwrap(), None);
        assert!(table.at_eof(id));
    }

    #[test]
    fn slurp_mode_reads_everything() {
        let mut table = IoTable::with_standard_handles();
        let id = table.open_scalar_read(b"x\ny\n".to_vec());
        assert_eq!(table.read_record(id, None).unwrap(), Some(b"x\ny\n".to_vec()));
        assert_eq!(table.read_record(id, None).unwrap(), None);
    }

    #[test]
    fn closed_handle_refuses_io() {
        let mut table = IoTable::with_standard_handles();
        let id = table.open_scalar_read(Vec::new());
        assert!(table.close(id));
        assert!(!table.close(id));
        assert!(table.at_eof(id));
    }
}
