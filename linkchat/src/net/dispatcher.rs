use crate::logging;
use crate::net::frame::{self, Channel, Packet};
use crate::net::link::LinkSocket;
use crate::shared::{ErrorType, LinkError, LinkResult, MacAddr};
use hashbrown::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

/// Handlers run on the receive thread; anything long must be handed off.
pub type FrameHandler = Box<dyn Fn(MacAddr, &Packet<'_>) -> LinkResult<()> + Send>;

/// Receive timeout on the capture socket. Bounds how long `stop` blocks
/// while joining the worker.
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Default)]
struct HandlerTable {
    by_channel: HashMap<u8, Vec<FrameHandler>>,
    any: Vec<FrameHandler>,
}

/// The single receive worker. Owns the capture socket and the background
/// thread; both die with this value.
pub struct Dispatcher {
    interface: String,
    handlers: Arc<Mutex<HandlerTable>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    log: logging::Logger,
}

impl Dispatcher {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(interface: &str, log: L) -> Dispatcher {
        Dispatcher {
            interface: interface.to_string(),
            handlers: Arc::new(Mutex::new(HandlerTable::default())),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            log: logging::child(log),
        }
    }

    /// Registers a handler for one channel. Handlers on the same channel are
    /// invoked sequentially in registration order.
    pub fn register_channel_handler(&self, channel: Channel, handler: FrameHandler) {
        let mut table = self.handlers.lock().expect("Handler table poisoned");

        table
            .by_channel
            .entry(channel.into())
            .or_insert_with(Vec::new)
            .push(handler);
    }

    /// Registers a handler invoked for every decoded frame regardless of
    /// channel, after the channel handlers.
    pub fn register_any_handler(&self, handler: FrameHandler) {
        let mut table = self.handlers.lock().expect("Handler table poisoned");

        table.any.push(handler);
    }

    /// Opens the capture socket and launches the receive worker. Starting a
    /// running dispatcher is a no-op.
    pub fn start(&self) -> LinkResult<()> {
        let mut worker = self.worker.lock().expect("Worker slot poisoned");

        if worker.is_some() {
            return Ok(());
        }

        let socket = LinkSocket::capture(&self.interface)?;
        socket.set_read_timeout(POLL_TIMEOUT)?;

        self.running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let handlers = Arc::clone(&self.handlers);
        let log = self.log.new(logging::o!());

        let handle = thread::Builder::new()
            .name("linkchat-recv".to_string())
            .spawn(move || recv_loop(socket, running, handlers, log))?;

        *worker = Some(handle);

        logging::debug!(self.log, "dispatcher started"; "interface" => &self.interface);

        Ok(())
    }

    /// Signals the worker to exit and joins it. The worker observes the stop
    /// flag within one poll interval, so this returns promptly. After `stop`
    /// returns no further handler invocation occurs.
    pub fn stop(&self) {
        let mut worker = self.worker.lock().expect("Worker slot poisoned");

        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = worker.take() {
            drop(handle.join());
            logging::debug!(self.log, "dispatcher stopped"; "interface" => &self.interface);
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Decodes one application frame and routes it to the registered
    /// handlers. The receive worker calls this for every matching frame.
    pub(crate) fn dispatch(&self, src: MacAddr, data: &[u8]) {
        route(&self.handlers, &self.log, src, data);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn recv_loop(
    socket: LinkSocket,
    running: Arc<AtomicBool>,
    handlers: Arc<Mutex<HandlerTable>>,
    log: logging::Logger,
) {
    let mut buf = vec![0u8; frame::MAX_FRAME_SIZE];

    while running.load(Ordering::SeqCst) {
        let len = match socket.recv_raw(&mut buf) {
            Ok(len) => len,
            Err(LinkError::Timeout) => continue,
            Err(LinkError::Fatal(ErrorType::SocketClosed)) => break,
            Err(err) => {
                logging::warn!(log, "receive failed"; "error" => ?err);
                break;
            }
        };

        let ether = match frame::decode_frame(&buf[..len]) {
            Some(ether) => ether,
            None => continue,
        };

        if ether.ethertype != frame::ETHERTYPE {
            continue;
        }

        route(&handlers, &log, ether.src, ether.payload);
    }

    running.store(false, Ordering::SeqCst);
}

fn route(handlers: &Mutex<HandlerTable>, log: &logging::Logger, src: MacAddr, data: &[u8]) {
    let packet = match frame::decode_app(data) {
        Ok(packet) => packet,
        Err(err) => {
            logging::trace!(log, "dropping undecodable frame"; "src" => %src, "error" => ?err);
            return;
        }
    };

    let table = handlers.lock().expect("Handler table poisoned");

    if let Some(list) = table.by_channel.get(&packet.channel) {
        for handler in list {
            invoke(handler, src, &packet, log);
        }
    }

    for handler in &table.any {
        invoke(handler, src, &packet, log);
    }
}

/// Handler failures are logged and must never take down the receive loop.
fn invoke(handler: &FrameHandler, src: MacAddr, packet: &Packet<'_>, log: &logging::Logger) {
    match catch_unwind(AssertUnwindSafe(|| handler(src, packet))) {
        Ok(Ok(())) => (),
        Ok(Err(err)) => {
            logging::warn!(log, "handler error";
                           "src" => %src,
                           "channel" => packet.channel,
                           "error" => ?err);
        }
        Err(_) => {
            logging::error!(log, "handler panicked";
                            "src" => %src,
                            "channel" => packet.channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::frame::{encode_app, Kind, TransferId};
    use std::sync::atomic::AtomicUsize;

    fn test_src() -> MacAddr {
        "02:00:00:00:00:01".parse().unwrap()
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> FrameHandler {
        Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_demultiplexing() {
        let dispatcher = Dispatcher::new("lo", None);
        let chat_hits = Arc::new(AtomicUsize::new(0));
        let file_hits = Arc::new(AtomicUsize::new(0));

        dispatcher.register_channel_handler(Channel::Chat, counting_handler(chat_hits.clone()));
        dispatcher.register_channel_handler(Channel::File, counting_handler(file_hits.clone()));

        let data = encode_app(Kind::Msg, Channel::Chat, 0, &TransferId::NIL, b"hi").unwrap();
        dispatcher.dispatch(test_src(), &data);

        assert_eq!(chat_hits.load(Ordering::SeqCst), 1);
        assert_eq!(file_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_any_handler_sees_all_channels() {
        let dispatcher = Dispatcher::new("lo", None);
        let hits = Arc::new(AtomicUsize::new(0));

        dispatcher.register_any_handler(counting_handler(hits.clone()));

        let chat = encode_app(Kind::Msg, Channel::Chat, 0, &TransferId::NIL, b"a").unwrap();
        let file = encode_app(Kind::Ack, Channel::File, 1, &TransferId::NIL, b"").unwrap();
        dispatcher.dispatch(test_src(), &chat);
        dispatcher.dispatch(test_src(), &file);

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_registration_order() {
        let dispatcher = Dispatcher::new("lo", None);
        let order = Arc::new(Mutex::new(Vec::new()));

        for &tag in &["first", "second"] {
            let order = order.clone();
            dispatcher.register_channel_handler(
                Channel::Chat,
                Box::new(move |_, _| {
                    order.lock().unwrap().push(tag);
                    Ok(())
                }),
            );
        }

        let data = encode_app(Kind::Msg, Channel::Chat, 0, &TransferId::NIL, b"x").unwrap();
        dispatcher.dispatch(test_src(), &data);

        assert_eq!(&order.lock().unwrap()[..], &["first", "second"]);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_delivery() {
        let dispatcher = Dispatcher::new("lo", None);
        let hits = Arc::new(AtomicUsize::new(0));

        dispatcher.register_channel_handler(Channel::Chat, Box::new(|_, _| panic!("boom")));
        dispatcher.register_channel_handler(Channel::Chat, counting_handler(hits.clone()));

        let data = encode_app(Kind::Msg, Channel::Chat, 0, &TransferId::NIL, b"x").unwrap();
        dispatcher.dispatch(test_src(), &data);
        dispatcher.dispatch(test_src(), &data);

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_erring_handler_does_not_stop_delivery() {
        let dispatcher = Dispatcher::new("lo", None);
        let hits = Arc::new(AtomicUsize::new(0));

        dispatcher.register_channel_handler(
            Channel::Chat,
            Box::new(|_, _| Err(LinkError::Fatal(ErrorType::MalformedHeader))),
        );
        dispatcher.register_channel_handler(Channel::Chat, counting_handler(hits.clone()));

        let data = encode_app(Kind::Msg, Channel::Chat, 0, &TransferId::NIL, b"x").unwrap();
        dispatcher.dispatch(test_src(), &data);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_undecodable_frame_is_dropped() {
        let dispatcher = Dispatcher::new("lo", None);
        let hits = Arc::new(AtomicUsize::new(0));

        dispatcher.register_any_handler(counting_handler(hits.clone()));

        dispatcher.dispatch(test_src(), &[0u8; 10]);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_err_missing_interface() {
        let dispatcher = Dispatcher::new("definitely-no-such-iface0", None);

        let result = dispatcher.start();

        assert_eq!(
            result.unwrap_err(),
            LinkError::Fatal(ErrorType::InterfaceMissing)
        );
        assert!(!dispatcher.is_running());
    }
}
