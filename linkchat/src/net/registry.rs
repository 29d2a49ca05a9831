use crate::net::frame::TransferId;
use hashbrown::HashMap;
use std::fs::File;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One in-progress inbound transfer. Owns the output file handle.
pub struct InboundTransfer {
    pub path: PathBuf,
    file: Option<File>,
    pub expected: u64,
    pub received: u64,
    /// Sequence of the last appended chunk. Repeats of it are re-acked
    /// without being written again.
    pub last_seq: u32,
}

impl InboundTransfer {
    pub fn create(path: PathBuf, expected: u64) -> io::Result<InboundTransfer> {
        let file = File::create(&path)?;

        Ok(InboundTransfer {
            path,
            file: Some(file),
            expected,
            received: 0,
            last_seq: 0,
        })
    }

    pub fn append(&mut self, data: &[u8], seq: u32) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(data)?;
        }

        self.received += data.len() as u64;
        self.last_seq = seq;

        Ok(())
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.expected > 0 && self.received >= self.expected
    }

    /// Closes the output handle. Idempotent.
    #[inline]
    pub fn close(&mut self) {
        self.file.take();
    }
}

/// In-progress inbound transfers keyed by transfer id. Mutated by the file
/// handler on the receive thread and by `stop_file_loop` on the stopping
/// thread.
pub struct TransferRegistry {
    inner: Mutex<HashMap<TransferId, InboundTransfer>>,
}

impl TransferRegistry {
    pub fn new() -> TransferRegistry {
        TransferRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts an entry, closing and discarding any previous entry for the
    /// same id.
    pub fn insert(&self, id: TransferId, transfer: InboundTransfer) {
        let mut map = self.inner.lock().expect("Transfer registry poisoned");

        if let Some(mut stale) = map.insert(id, transfer) {
            stale.close();
        }
    }

    pub fn remove(&self, id: &TransferId) -> Option<InboundTransfer> {
        self.inner
            .lock()
            .expect("Transfer registry poisoned")
            .remove(id)
    }

    /// Runs `op` against the entry for `id`, if present.
    pub fn with_entry<F, R>(&self, id: &TransferId, op: F) -> Option<R>
    where
        F: FnOnce(&mut InboundTransfer) -> R,
    {
        self.inner
            .lock()
            .expect("Transfer registry poisoned")
            .get_mut(id)
            .map(op)
    }

    /// Closes every open handle and drops all entries.
    pub fn clear(&self) {
        let mut map = self.inner.lock().expect("Transfer registry poisoned");

        for (_, transfer) in map.iter_mut() {
            transfer.close();
        }

        map.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("Transfer registry poisoned").len()
    }
}

/// Drops path components that would escape the receive root.
pub fn sanitize(name: &str) -> String {
    name.split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect::<Vec<_>>()
        .join("/")
}

/// Prefixes the first path component, so `notes.txt` lands as
/// `recv_notes.txt` and `dir/a.txt` as `recv_dir/a.txt`.
pub fn receive_name(name: &str) -> String {
    format!("recv_{}", name)
}

/// Picks a non-existing output path by appending `_1`, `_2`, ... before the
/// extension until the name is free.
pub fn unique_output_path(root: &Path, name: &str) -> PathBuf {
    let candidate = root.join(name);

    if !candidate.exists() {
        return candidate;
    }

    let stem = candidate
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "received_file".to_string());
    let extension = candidate
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1;
    loop {
        let next = candidate.with_file_name(format!("{}_{}{}", stem, counter, extension));

        if !next.exists() {
            return next;
        }

        counter += 1;
    }
}
