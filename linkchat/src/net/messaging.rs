use crate::config::LinkConfig;
use crate::logging;
use crate::net::dispatcher::Dispatcher;
use crate::net::frame::{self, encode_app, Channel, Kind, Packet, TransferId};
use crate::net::link::{FrameSink, LinkSocket};
use crate::shared::{LinkError, LinkResult, MacAddr};
use indexmap::IndexMap;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Request magic broadcast on the CHAT channel.
pub const DISCOVER_REQ: &str = "__LINKCHAT_DISCOVER_REQ__";

/// Reply magic, followed by the opaque display name.
pub const DISCOVER_REPLY_PREFIX: &str = "__LINKCHAT_DISCOVER_RPLY__|";

const MAX_DISPLAY_NAME: usize = 200;

/// Per-read timeout of the private discovery socket, so the reply window
/// deadline is observed promptly.
const DISCOVERY_POLL_TIMEOUT: Duration = Duration::from_millis(500);

pub type MessageHandler = Box<dyn Fn(MacAddr, &str) + Send>;

struct Peer {
    name: String,
    last_seen: Instant,
}

/// In-memory peer records aggregated from discovery replies, in first-seen
/// order. Records expire after the staleness threshold.
pub struct PeerMap {
    inner: Mutex<IndexMap<MacAddr, Peer>>,
    stale_after: Duration,
}

impl PeerMap {
    pub fn new(stale_after: Duration) -> PeerMap {
        PeerMap {
            inner: Mutex::new(IndexMap::new()),
            stale_after,
        }
    }

    /// Records a sighting, keeping the latest name per MAC.
    pub fn observe(&self, mac: MacAddr, name: &str) {
        let mut map = self.inner.lock().expect("Peer map poisoned");

        match map.get_mut(&mac) {
            Some(peer) => {
                peer.name = name.to_string();
                peer.last_seen = Instant::now();
            }
            None => {
                map.insert(
                    mac,
                    Peer {
                        name: name.to_string(),
                        last_seen: Instant::now(),
                    },
                );
            }
        }
    }

    pub fn prune(&self) {
        let now = Instant::now();
        let stale_after = self.stale_after;

        self.inner
            .lock()
            .expect("Peer map poisoned")
            .retain(|_, peer| now.duration_since(peer.last_seen) < stale_after);
    }

    /// Prunes stale records and lists the remainder.
    pub fn peers(&self) -> Vec<(MacAddr, String)> {
        self.prune();

        self.inner
            .lock()
            .expect("Peer map poisoned")
            .iter()
            .map(|(mac, peer)| (*mac, peer.name.clone()))
            .collect()
    }
}

/// Text messaging plus the discovery request/reply protocol, layered on the
/// dispatcher's CHAT channel.
pub struct MessageChannel {
    link: Arc<dyn FrameSink>,
    dispatcher: Arc<Dispatcher>,
    interface: String,
    display_name: String,
    peers: Arc<PeerMap>,
    handler: Arc<Mutex<Option<MessageHandler>>>,
    registered: AtomicBool,
    log: logging::Logger,
}

impl MessageChannel {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        link: Arc<dyn FrameSink>,
        dispatcher: Arc<Dispatcher>,
        config: &LinkConfig,
        log: L,
    ) -> MessageChannel {
        MessageChannel {
            link,
            dispatcher,
            interface: config.link.interface.clone(),
            display_name: default_display_name(),
            peers: Arc::new(PeerMap::new(config.peer_stale_after())),
            handler: Arc::new(Mutex::new(None)),
            registered: AtomicBool::new(false),
            log: logging::child(log),
        }
    }

    /// Sends one text message. A `None` destination falls back to broadcast.
    /// Message ordering is not part of the protocol, so `seq` stays zero.
    pub fn send_message(&self, dest: Option<MacAddr>, text: &str) -> LinkResult<()> {
        self.send_message_seq(dest, text, 0)
    }

    pub fn send_message_seq(&self, dest: Option<MacAddr>, text: &str, seq: u32) -> LinkResult<()> {
        let dest = dest.unwrap_or(MacAddr::BROADCAST);
        let data = encode_app(Kind::Msg, Channel::Chat, seq, &TransferId::NIL, text.as_bytes())?;

        logging::trace!(self.log, "sending message"; "dest" => %dest, "len" => text.len());

        self.link.send_app(dest, &data)
    }

    /// Installs the user handler and starts the dispatcher. The internal
    /// CHAT handler answers discovery requests itself; request and reply
    /// magic never reaches the user handler.
    pub fn start_message_loop(&self, handler: MessageHandler) -> LinkResult<()> {
        *self.handler.lock().expect("Message handler poisoned") = Some(handler);

        self.ensure_registered();
        self.dispatcher.start()
    }

    /// Removes the user handler and stops the dispatcher.
    pub fn stop_message_loop(&self) {
        *self.handler.lock().expect("Message handler poisoned") = None;

        self.dispatcher.stop();
    }

    /// Broadcasts a discovery request and aggregates replies on a private
    /// capture socket until `timeout` elapses. Returns `(mac, name)` pairs,
    /// keeping the last seen name per MAC.
    pub fn discover_peers(&self, timeout: Duration) -> LinkResult<Vec<(MacAddr, String)>> {
        let socket = LinkSocket::capture(&self.interface)?;
        socket.set_read_timeout(DISCOVERY_POLL_TIMEOUT)?;

        self.send_message(None, DISCOVER_REQ)?;

        let mut replies: IndexMap<MacAddr, String> = IndexMap::new();
        let mut buf = vec![0u8; frame::MAX_FRAME_SIZE];
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            let len = match socket.recv_raw(&mut buf) {
                Ok(len) => len,
                Err(LinkError::Timeout) => continue,
                Err(err) => return Err(err),
            };

            let ether = match frame::decode_frame(&buf[..len]) {
                Some(ether) => ether,
                None => continue,
            };

            if ether.ethertype != frame::ETHERTYPE {
                continue;
            }

            let packet = match frame::decode_app(ether.payload) {
                Ok(packet) => packet,
                Err(_) => continue,
            };

            if packet.kind != Kind::Msg {
                continue;
            }

            let text = String::from_utf8_lossy(packet.payload);

            if let Some(name) = text.strip_prefix(DISCOVER_REPLY_PREFIX) {
                logging::debug!(self.log, "discovery reply"; "src" => %ether.src, "name" => name);

                replies.insert(ether.src, name.to_string());
                self.peers.observe(ether.src, name);
            }
        }

        Ok(replies.into_iter().collect())
    }

    /// Discovers peers, then unicasts `text` to each. Returns the
    /// destinations actually reached; per-peer send failures are skipped.
    pub fn send_message_to_all(&self, text: &str, timeout: Duration) -> LinkResult<Vec<MacAddr>> {
        let peers = self.discover_peers(timeout)?;
        let mut sent = Vec::new();

        for (mac, _) in peers {
            match self.send_message(Some(mac), text) {
                Ok(()) => sent.push(mac),
                Err(err) => {
                    logging::warn!(self.log, "send failed"; "dest" => %mac, "error" => ?err);
                }
            }
        }

        Ok(sent)
    }

    /// Blocks on a private capture socket until one text message arrives.
    pub fn receive_message_blocking(&self) -> LinkResult<(MacAddr, String)> {
        let socket = LinkSocket::capture(&self.interface)?;
        let mut buf = vec![0u8; frame::MAX_FRAME_SIZE];

        loop {
            let len = socket.recv_raw(&mut buf)?;

            let ether = match frame::decode_frame(&buf[..len]) {
                Some(ether) => ether,
                None => continue,
            };

            if ether.ethertype != frame::ETHERTYPE {
                continue;
            }

            let packet = match frame::decode_app(ether.payload) {
                Ok(packet) => packet,
                Err(_) => continue,
            };

            if packet.kind == Kind::Msg {
                return Ok((
                    ether.src,
                    String::from_utf8_lossy(packet.payload).into_owned(),
                ));
            }
        }
    }

    /// Peers seen by discovery so far, stale records pruned.
    pub fn known_peers(&self) -> Vec<(MacAddr, String)> {
        self.peers.peers()
    }

    #[inline]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    fn ensure_registered(&self) {
        if self.registered.swap(true, Ordering::SeqCst) {
            return;
        }

        let link = Arc::clone(&self.link);
        let handler = Arc::clone(&self.handler);
        let peers = Arc::clone(&self.peers);
        let display_name = self.display_name.clone();
        let log = self.log.new(logging::o!());

        self.dispatcher.register_channel_handler(
            Channel::Chat,
            Box::new(move |src, packet| {
                handle_chat(&*link, &handler, &peers, &display_name, src, packet, &log);
                Ok(())
            }),
        );
    }
}

fn handle_chat(
    link: &dyn FrameSink,
    handler: &Mutex<Option<MessageHandler>>,
    peers: &PeerMap,
    display_name: &str,
    src: MacAddr,
    packet: &Packet<'_>,
    log: &logging::Logger,
) {
    if packet.kind != Kind::Msg {
        return;
    }

    let text = String::from_utf8_lossy(packet.payload);

    if text == DISCOVER_REQ {
        let reply = format!("{}{}", DISCOVER_REPLY_PREFIX, display_name);

        match encode_app(Kind::Msg, Channel::Chat, 0, &TransferId::NIL, reply.as_bytes()) {
            Ok(data) => {
                // Reply failures must not disturb the receive loop.
                if let Err(err) = link.send_app(src, &data) {
                    logging::debug!(log, "discovery reply failed"; "dest" => %src, "error" => ?err);
                }
            }
            Err(err) => {
                logging::warn!(log, "discovery reply encode failed"; "error" => ?err);
            }
        }

        return;
    }

    if let Some(name) = text.strip_prefix(DISCOVER_REPLY_PREFIX) {
        peers.observe(src, name);
        return;
    }

    if let Some(user) = handler.lock().expect("Message handler poisoned").as_ref() {
        user(src, &text);
    }
}

/// `user@host`, truncated to the wire limit for display names.
pub fn default_display_name() -> String {
    let user = env::var("USER").unwrap_or_else(|_| "user".to_string());
    let host = hostname::get()
        .ok()
        .and_then(|host| host.into_string().ok())
        .unwrap_or_else(|| "host".to_string());

    let mut name = format!("{}@{}", user, host);

    if name.len() > MAX_DISPLAY_NAME {
        let mut cut = MAX_DISPLAY_NAME;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }

    name
}
