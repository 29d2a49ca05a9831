#![allow(clippy::new_without_default)]

//! Peer-to-peer chat and file transfer directly over raw Ethernet frames.
//! Hosts on the same L2 segment exchange text messages, discover each other
//! and transfer files reliably, identified by nothing but their MAC
//! addresses. No IP, no TCP.

pub mod config;
pub mod logging;
pub mod net;
pub mod shared;

pub use crate::config::LinkConfig;
pub use crate::net::dispatcher::Dispatcher;
pub use crate::net::files::{FileChannel, SendOptions, TransferStatus};
pub use crate::net::frame::ETHERTYPE;
pub use crate::net::link::{FrameSink, LinkSocket};
pub use crate::net::messaging::MessageChannel;
pub use crate::shared::{ErrorType, LinkError, LinkResult, MacAddr};
