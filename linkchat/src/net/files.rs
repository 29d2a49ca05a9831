use crate::config::LinkConfig;
use crate::logging;
use crate::net::dispatcher::Dispatcher;
use crate::net::frame::{encode_app, Channel, Kind, Packet, TransferId};
use crate::net::link::FrameSink;
use crate::net::registry::{self, InboundTransfer, TransferRegistry};
use crate::shared::{ErrorType, LinkError, LinkResult, MacAddr};
use hashbrown::HashMap;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::fs::File;
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Meta prefix marking a directory transfer.
const DIR_PREFIX: &str = "DIR:";

/// Pause between FILE_START and the first chunk, giving the receiver time
/// to open its output file. START carries no acknowledgement.
const START_SETTLE: Duration = Duration::from_millis(50);

const HASH_BUF_SIZE: usize = 65536;

/// Transfer progress as reported to the user handler. The `Display` strings
/// are the interface contract towards UI layers.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransferStatus {
    Started,
    Chunk(u32),
    Completed,
    Finished,
    FinishedHashMismatch,
    Error(String),
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransferStatus::Started => write!(f, "started"),
            TransferStatus::Chunk(seq) => write!(f, "chunk:{}", seq),
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::Finished => write!(f, "finished"),
            TransferStatus::FinishedHashMismatch => write!(f, "finished_hash_mismatch"),
            TransferStatus::Error(message) => write!(f, "error:{}", message),
        }
    }
}

pub type TransferHandler = Box<dyn Fn(MacAddr, &Path, &TransferStatus) + Send>;

/// Per-call knobs of the sender state machine.
#[derive(Clone)]
pub struct SendOptions {
    pub use_ack: bool,
    pub retries: u32,
    pub timeout: Duration,
    /// Name carried in the START meta instead of the file's basename. The
    /// folder sender uses this for `/`-separated relative paths.
    pub remote_name: Option<String>,
}

impl Default for SendOptions {
    fn default() -> SendOptions {
        SendOptions {
            use_ack: true,
            retries: 5,
            timeout: Duration::from_secs(1),
            remote_name: None,
        }
    }
}

struct AckSlot {
    expected_src: Option<MacAddr>,
    received: bool,
}

/// Wait primitive for stop-and-wait acknowledgements. The dispatcher routes
/// inbound ACK frames into `notify`; the sender arms a slot keyed by
/// `(transfer_id, seq)` and blocks in `wait`.
struct AckTable {
    slots: Mutex<HashMap<(TransferId, u32), AckSlot>>,
    signal: Condvar,
}

impl AckTable {
    fn new() -> AckTable {
        AckTable {
            slots: Mutex::new(HashMap::new()),
            signal: Condvar::new(),
        }
    }

    fn arm(&self, id: TransferId, seq: u32, expected_src: Option<MacAddr>) {
        let mut slots = self.slots.lock().expect("Ack table poisoned");

        slots.insert(
            (id, seq),
            AckSlot {
                expected_src,
                received: false,
            },
        );
    }

    fn disarm(&self, id: TransferId, seq: u32) {
        let mut slots = self.slots.lock().expect("Ack table poisoned");

        slots.remove(&(id, seq));
    }

    /// Marks a matching armed slot as satisfied. ACKs from unexpected
    /// sources are ignored and do not consume the retry budget.
    fn notify(&self, id: TransferId, seq: u32, src: MacAddr) {
        let mut slots = self.slots.lock().expect("Ack table poisoned");

        if let Some(slot) = slots.get_mut(&(id, seq)) {
            if slot.expected_src.map_or(true, |expected| expected == src) {
                slot.received = true;
                self.signal.notify_all();
            }
        }
    }

    /// Blocks until the slot is satisfied or `timeout` elapses. The slot
    /// stays armed either way so a late ACK still counts for the retry.
    fn wait(&self, id: TransferId, seq: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slots = self.slots.lock().expect("Ack table poisoned");

        loop {
            if slots.get(&(id, seq)).map_or(false, |slot| slot.received) {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let (guard, _) = self
                .signal
                .wait_timeout(slots, deadline - now)
                .expect("Ack table poisoned");
            slots = guard;
        }
    }
}

/// Receive-side state shared between the dispatcher handler and the channel.
struct FileWorker {
    link: Arc<dyn FrameSink>,
    registry: TransferRegistry,
    acks: AckTable,
    callback: Mutex<Option<TransferHandler>>,
    receive_root: PathBuf,
    log: logging::Logger,
}

impl FileWorker {
    fn handle(&self, src: MacAddr, packet: &Packet<'_>) {
        match packet.kind {
            Kind::FileStart => self.on_start(src, packet),
            Kind::FileChunk => self.on_chunk(src, packet),
            Kind::FileEnd => self.on_end(src, packet),
            Kind::Ack => self.acks.notify(packet.id, packet.seq, src),
            _ => (),
        }
    }

    fn on_start(&self, src: MacAddr, packet: &Packet<'_>) {
        let (name, expected) = decode_meta(packet.payload);

        logging::debug!(self.log, "transfer start";
                        "src" => %src,
                        "id" => %packet.id,
                        "name" => &name,
                        "expected" => expected);

        if let Some(relpath) = name.strip_prefix(DIR_PREFIX) {
            let clean = registry::sanitize(relpath);
            if clean.is_empty() {
                return;
            }

            let path = self.receive_root.join(registry::receive_name(&clean));
            match fs::create_dir_all(&path) {
                Ok(()) => self.notify(src, &path, &TransferStatus::Started),
                Err(err) => self.notify(src, &path, &TransferStatus::Error(err.to_string())),
            }

            // Directory markers carry no chunks; nothing to track.
            return;
        }

        let clean = registry::sanitize(&name);
        let target = if clean.is_empty() {
            "received_file".to_string()
        } else {
            clean
        };

        if let Err(err) = fs::create_dir_all(&self.receive_root) {
            self.notify(src, &self.receive_root, &TransferStatus::Error(err.to_string()));
            return;
        }

        let path = registry::unique_output_path(&self.receive_root, &registry::receive_name(&target));

        match InboundTransfer::create(path.clone(), expected) {
            Ok(transfer) => {
                self.registry.insert(packet.id, transfer);
                self.notify(src, &path, &TransferStatus::Started);
            }
            Err(err) => {
                self.notify(src, &path, &TransferStatus::Error(err.to_string()));
            }
        }
    }

    fn on_chunk(&self, src: MacAddr, packet: &Packet<'_>) {
        enum Outcome {
            Appended { path: PathBuf, complete: bool },
            Duplicate,
            Failed { path: PathBuf, reason: String },
        }

        let outcome = self.registry.with_entry(&packet.id, |entry| {
            if packet.seq <= entry.last_seq {
                // Retransmit of an already appended chunk; the ACK got lost.
                return Outcome::Duplicate;
            }

            if packet.seq != entry.last_seq + 1 {
                logging::warn!(self.log, "out of order chunk, appending anyway";
                               "id" => %packet.id,
                               "seq" => packet.seq,
                               "last_seq" => entry.last_seq);
            }

            match entry.append(packet.payload, packet.seq) {
                Ok(()) => Outcome::Appended {
                    path: entry.path.clone(),
                    complete: entry.is_complete(),
                },
                Err(err) => Outcome::Failed {
                    path: entry.path.clone(),
                    reason: err.to_string(),
                },
            }
        });

        let outcome = match outcome {
            Some(outcome) => outcome,
            // Chunk without a START; not buffered, not acked.
            None => return,
        };

        match outcome {
            Outcome::Appended { path, complete } => {
                self.notify(src, &path, &TransferStatus::Chunk(packet.seq));

                if complete {
                    // The entry stays registered so FILE_END can still verify
                    // the hash; only the handle is closed.
                    self.registry.with_entry(&packet.id, |entry| entry.close());
                    self.notify(src, &path, &TransferStatus::Completed);
                }

                self.emit_ack(src, packet.id, packet.seq);
            }
            Outcome::Duplicate => {
                self.emit_ack(src, packet.id, packet.seq);
            }
            Outcome::Failed { path, reason } => {
                if let Some(mut entry) = self.registry.remove(&packet.id) {
                    entry.close();
                }
                self.notify(src, &path, &TransferStatus::Error(reason));
            }
        }
    }

    fn on_end(&self, src: MacAddr, packet: &Packet<'_>) {
        let mut entry = match self.registry.remove(&packet.id) {
            Some(entry) => entry,
            None => return,
        };

        entry.close();

        let remote = String::from_utf8_lossy(packet.payload).into_owned();

        let status = match hash_file(&entry.path) {
            Ok(local) => {
                if !remote.is_empty() && remote != local {
                    TransferStatus::FinishedHashMismatch
                } else {
                    TransferStatus::Finished
                }
            }
            Err(err) => TransferStatus::Error(err.to_string()),
        };

        logging::debug!(self.log, "transfer end";
                        "src" => %src,
                        "id" => %packet.id,
                        "status" => %status);

        self.notify(src, &entry.path, &status);
    }

    fn emit_ack(&self, dest: MacAddr, id: TransferId, seq: u32) {
        match encode_app(Kind::Ack, Channel::File, seq, &id, b"") {
            Ok(data) => {
                if let Err(err) = self.link.send_app(dest, &data) {
                    logging::warn!(self.log, "ack send failed";
                                   "dest" => %dest,
                                   "seq" => seq,
                                   "error" => ?err);
                }
            }
            Err(err) => {
                logging::warn!(self.log, "ack encode failed"; "error" => ?err);
            }
        }
    }

    fn notify(&self, src: MacAddr, path: &Path, status: &TransferStatus) {
        if let Some(callback) = self.callback.lock().expect("File callback poisoned").as_ref() {
            callback(src, path, status);
        }
    }
}

/// Reliable file transfer over the FILE channel: stop-and-wait sender with
/// per-chunk acknowledgements, tolerant receiver with end-to-end SHA-256
/// verification.
pub struct FileChannel {
    worker: Arc<FileWorker>,
    dispatcher: Arc<Dispatcher>,
    chunk_size: usize,
    ack_timeout: Duration,
    ack_retries: u32,
    registered: AtomicBool,
    log: logging::Logger,
}

impl FileChannel {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        link: Arc<dyn FrameSink>,
        dispatcher: Arc<Dispatcher>,
        config: &LinkConfig,
        log: L,
    ) -> FileChannel {
        let log = logging::child(log);

        FileChannel {
            worker: Arc::new(FileWorker {
                link,
                registry: TransferRegistry::new(),
                acks: AckTable::new(),
                callback: Mutex::new(None),
                receive_root: config.transfer.receive_root.clone(),
                log: log.new(logging::o!()),
            }),
            dispatcher,
            chunk_size: config.transfer.chunk_size,
            ack_timeout: config.ack_timeout(),
            ack_retries: config.transfer.ack_retries,
            registered: AtomicBool::new(false),
            log,
        }
    }

    /// Installs the user status handler and starts the dispatcher. Required
    /// before acknowledged sends as well, since ACKs arrive through the
    /// receive loop.
    pub fn start_file_loop(&self, handler: TransferHandler) -> LinkResult<()> {
        *self.worker.callback.lock().expect("File callback poisoned") = Some(handler);

        self.ensure_registered();
        self.dispatcher.start()
    }

    /// Removes the user handler, closes every in-progress inbound transfer
    /// and drops its registry entry. The shared dispatcher keeps running for
    /// the other channels; stopping it is its owner's call.
    pub fn stop_file_loop(&self) {
        *self.worker.callback.lock().expect("File callback poisoned") = None;

        self.worker.registry.clear();
    }

    /// Sends one file with the channel's configured knobs.
    pub fn send_file(&self, dest: Option<MacAddr>, path: &Path) -> LinkResult<()> {
        self.send_file_with(dest, path, &self.default_options())
    }

    /// Sends one file. A `None` destination falls back to broadcast;
    /// broadcast transfers skip ACK waiting, since any number of receivers
    /// may answer.
    pub fn send_file_with(
        &self,
        dest: Option<MacAddr>,
        path: &Path,
        options: &SendOptions,
    ) -> LinkResult<()> {
        let dest = dest.unwrap_or(MacAddr::BROADCAST);

        if !path.is_file() {
            return Err(LinkError::Fatal(ErrorType::FileNotFound));
        }

        self.ensure_registered();

        let wait_for_acks = options.use_ack && !dest.is_broadcast();

        if wait_for_acks && !self.dispatcher.is_running() {
            logging::warn!(self.log, "file loop not running, acks cannot arrive";
                           "dest" => %dest);
        }

        let size = fs::metadata(path)?.len();
        let name = options.remote_name.clone().unwrap_or_else(|| {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string())
        });

        let id = TransferId::random();
        let meta = format!("{}|{}", name, size);

        logging::info!(self.log, "sending file";
                       "dest" => %dest,
                       "id" => %id,
                       "name" => &name,
                       "size" => size);

        let start = encode_app(Kind::FileStart, Channel::File, 0, &id, meta.as_bytes())?;
        self.worker.link.send_app(dest, &start)?;

        thread::sleep(START_SETTLE);

        let mut file = File::open(path)?;
        let mut chunk = Vec::with_capacity(self.chunk_size);
        let mut seq: u32 = 1;

        loop {
            chunk.clear();
            let read = file
                .by_ref()
                .take(self.chunk_size as u64)
                .read_to_end(&mut chunk)?;

            if read == 0 {
                break;
            }

            let data = encode_app(Kind::FileChunk, Channel::File, seq, &id, &chunk)?;

            if wait_for_acks {
                self.transmit_chunk(dest, &data, id, seq, options)?;
            } else {
                self.worker.link.send_app(dest, &data)?;
            }

            seq += 1;
        }

        let digest = hash_file(path)?;
        let end = encode_app(Kind::FileEnd, Channel::File, seq, &id, digest.as_bytes())?;
        self.worker.link.send_app(dest, &end)?;

        logging::info!(self.log, "file sent"; "dest" => %dest, "id" => %id, "chunks" => seq - 1);

        Ok(())
    }

    /// Sends a directory tree: a DIR marker for the root and every
    /// subdirectory, then each file with its `/`-separated relative path.
    pub fn send_folder(&self, dest: Option<MacAddr>, path: &Path) -> LinkResult<()> {
        self.send_folder_with(dest, path, &self.default_options())
    }

    pub fn send_folder_with(
        &self,
        dest: Option<MacAddr>,
        path: &Path,
        options: &SendOptions,
    ) -> LinkResult<()> {
        let dest = dest.unwrap_or(MacAddr::BROADCAST);

        if !path.is_dir() {
            return Err(LinkError::Fatal(ErrorType::FileNotFound));
        }

        let base = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "folder".to_string());

        self.send_dir_marker(dest, &base)?;
        self.walk_folder(dest, path, &base, options)
    }

    /// Blocks until one inbound transfer finishes, returning its source and
    /// output path.
    pub fn receive_file_blocking(&self) -> LinkResult<(MacAddr, PathBuf)> {
        let slot = Arc::new((Mutex::new(None), Condvar::new()));

        let waiter = Arc::clone(&slot);
        self.start_file_loop(Box::new(move |src, path, status| match status {
            TransferStatus::Completed
            | TransferStatus::Finished
            | TransferStatus::FinishedHashMismatch => {
                *waiter.0.lock().expect("Receive slot poisoned") = Some((src, path.to_path_buf()));
                waiter.1.notify_all();
            }
            _ => (),
        }))?;

        let (lock, signal) = &*slot;
        let mut guard = lock.lock().expect("Receive slot poisoned");

        while guard.is_none() {
            guard = signal.wait(guard).expect("Receive slot poisoned");
        }

        let result = guard.take().expect("Receive slot must be filled");
        drop(guard);

        self.stop_file_loop();

        Ok(result)
    }

    pub fn transfers_in_progress(&self) -> usize {
        self.worker.registry.len()
    }

    fn default_options(&self) -> SendOptions {
        SendOptions {
            use_ack: true,
            retries: self.ack_retries,
            timeout: self.ack_timeout,
            remote_name: None,
        }
    }

    /// Stop-and-wait transmission of one chunk. The slot is armed across
    /// attempts so an ACK for an earlier transmission still counts.
    fn transmit_chunk(
        &self,
        dest: MacAddr,
        data: &[u8],
        id: TransferId,
        seq: u32,
        options: &SendOptions,
    ) -> LinkResult<()> {
        self.worker.acks.arm(id, seq, Some(dest));

        for attempt in 1..=options.retries {
            if let Err(err) = self.worker.link.send_app(dest, data) {
                self.worker.acks.disarm(id, seq);
                return Err(err);
            }

            if self.worker.acks.wait(id, seq, options.timeout) {
                self.worker.acks.disarm(id, seq);
                return Ok(());
            }

            logging::debug!(self.log, "ack timeout, retransmitting";
                            "id" => %id,
                            "seq" => seq,
                            "attempt" => attempt);
        }

        self.worker.acks.disarm(id, seq);

        Err(LinkError::Fatal(ErrorType::AckTimeout))
    }

    fn send_dir_marker(&self, dest: MacAddr, relpath: &str) -> LinkResult<()> {
        let id = TransferId::random();
        let meta = format!("{}{}|0", DIR_PREFIX, relpath);

        let start = encode_app(Kind::FileStart, Channel::File, 0, &id, meta.as_bytes())?;
        self.worker.link.send_app(dest, &start)?;

        let end = encode_app(Kind::FileEnd, Channel::File, 0, &id, b"")?;
        self.worker.link.send_app(dest, &end)
    }

    fn walk_folder(
        &self,
        dest: MacAddr,
        dir: &Path,
        rel: &str,
        options: &SendOptions,
    ) -> LinkResult<()> {
        let mut subdirs = Vec::new();
        let mut files = Vec::new();

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                subdirs.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }

        subdirs.sort();
        files.sort();

        for subdir in &subdirs {
            self.send_dir_marker(dest, &join_rel(rel, subdir))?;
        }

        for file in &files {
            let mut file_options = options.clone();
            file_options.remote_name = Some(join_rel(rel, file));

            self.send_file_with(Some(dest), file, &file_options)?;
        }

        for subdir in &subdirs {
            self.walk_folder(dest, subdir, &join_rel(rel, subdir), options)?;
        }

        Ok(())
    }

    fn ensure_registered(&self) {
        if self.registered.swap(true, Ordering::SeqCst) {
            return;
        }

        let worker = Arc::clone(&self.worker);

        self.dispatcher.register_channel_handler(
            Channel::File,
            Box::new(move |src, packet| {
                worker.handle(src, packet);
                Ok(())
            }),
        );
    }
}

/// Relative wire paths always use `/`, regardless of host separator.
fn join_rel(rel: &str, path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    format!("{}/{}", rel, name)
}

/// Decodes `"<name>|<size>"` START meta. Anything malformed falls back to an
/// anonymous zero-sized transfer rather than failing it.
fn decode_meta(payload: &[u8]) -> (String, u64) {
    let text = String::from_utf8_lossy(payload);
    let mut parts = text.splitn(2, '|');

    let name = match parts.next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => return ("received_file".to_string(), 0),
    };

    let size = parts
        .next()
        .and_then(|size| size.trim().parse().ok())
        .unwrap_or(0);

    (name, size)
}

/// Streaming SHA-256 of a file, rendered as lowercase hex.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];

    loop {
        let read = file.read(&mut buf)?;

        if read == 0 {
            break;
        }

        hasher.update(&buf[..read]);
    }

    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect())
}
