//! The networking modules in `linkchat` carry all traffic between peers on
//! the local segment: raw link I/O, the frame codec, the receive dispatcher
//! and the chat/file/discovery channels built on top of it.

pub mod dispatcher;
pub mod files;
pub mod frame;
pub mod link;
pub mod messaging;
pub mod registry;

#[cfg(test)]
pub(crate) mod mock {
    use crate::net::link::FrameSink;
    use crate::shared::{LinkResult, MacAddr};
    use std::sync::Mutex;

    /// Captures outbound frames instead of touching a raw socket.
    pub struct MockLink {
        mac: MacAddr,
        frames: Mutex<Vec<(MacAddr, Vec<u8>)>>,
    }

    impl MockLink {
        pub fn new(mac: &str) -> MockLink {
            MockLink {
                mac: mac.parse().unwrap(),
                frames: Mutex::new(Vec::new()),
            }
        }

        /// Drains everything captured so far.
        pub fn take(&self) -> Vec<(MacAddr, Vec<u8>)> {
            self.frames.lock().unwrap().drain(..).collect()
        }

        pub fn len(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    impl FrameSink for MockLink {
        fn send_app(&self, dest: MacAddr, data: &[u8]) -> LinkResult<()> {
            self.frames.lock().unwrap().push((dest, data.to_vec()));
            Ok(())
        }

        fn local_mac(&self) -> MacAddr {
            self.mac
        }
    }
}
