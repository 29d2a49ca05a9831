use crate::net::frame;
use crate::shared::{ErrorType, LinkError, LinkResult, MacAddr};
use std::ffi::CString;
use std::fs;
use std::io;
use std::mem;
use std::time::Duration;

/// Protocol value that makes a capture socket observe all L2 traffic on the
/// interface. Filtering by EtherType happens in user code.
const ETH_P_ALL: u16 = 0x0003;

/// Transmission seam between the channels and the wire. The channels only
/// ever emit complete application frames under the LinkChat EtherType.
pub trait FrameSink: Send + Sync {
    fn send_app(&self, dest: MacAddr, data: &[u8]) -> LinkResult<()>;

    fn local_mac(&self) -> MacAddr;
}

/// A raw AF_PACKET socket bound to one named interface.
#[derive(Debug)]
pub struct LinkSocket {
    fd: libc::c_int,
    mac: MacAddr,
}

impl LinkSocket {
    /// Opens a send socket. Requires CAP_NET_RAW or root.
    pub fn open(interface: &str) -> LinkResult<LinkSocket> {
        Self::open_raw(interface, 0)
    }

    /// Opens a capture socket observing all traffic on the interface.
    pub fn capture(interface: &str) -> LinkResult<LinkSocket> {
        Self::open_raw(interface, ETH_P_ALL)
    }

    fn open_raw(interface: &str, protocol: u16) -> LinkResult<LinkSocket> {
        // Resolving the MAC up front doubles as the existence check.
        let mac = interface_mac(interface)?;

        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                i32::from(protocol.to_be()),
            )
        };

        if fd < 0 {
            return Err(os_error());
        }

        let socket = LinkSocket { fd, mac };

        let name = CString::new(interface)
            .map_err(|_| LinkError::Fatal(ErrorType::InterfaceMissing))?;
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };

        if index == 0 {
            return Err(LinkError::Fatal(ErrorType::InterfaceMissing));
        }

        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = protocol.to_be();
        addr.sll_ifindex = index as i32;

        let result = unsafe {
            libc::bind(
                socket.fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };

        if result < 0 {
            return Err(os_error());
        }

        Ok(socket)
    }

    /// Bounds every subsequent `recv_raw` by the supplied wall-clock timeout.
    pub fn set_read_timeout(&self, timeout: Duration) -> LinkResult<()> {
        let time = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: i64::from(timeout.subsec_micros()) as libc::suseconds_t,
        };

        let result = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &time as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };

        if result < 0 {
            return Err(os_error());
        }

        Ok(())
    }

    /// Assembles the Ethernet header and writes the whole frame in a single
    /// syscall.
    pub fn send_frame(&self, dest: MacAddr, ethertype: u16, payload: &[u8]) -> LinkResult<usize> {
        let data = frame::encode_frame(dest, self.mac, ethertype, payload);

        let sent = unsafe {
            libc::send(
                self.fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0,
            )
        };

        if sent < 0 {
            return Err(os_error());
        }

        Ok(sent as usize)
    }

    /// Blocking read of one raw frame into `buf`, returning the frame length.
    /// Frames shorter than the Ethernet header must be discarded by the
    /// caller.
    pub fn recv_raw(&self, buf: &mut [u8]) -> LinkResult<usize> {
        let received =
            unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };

        if received < 0 {
            return Err(os_error());
        }

        Ok(received as usize)
    }

    #[inline]
    pub fn mac(&self) -> MacAddr {
        self.mac
    }
}

impl FrameSink for LinkSocket {
    #[inline]
    fn send_app(&self, dest: MacAddr, data: &[u8]) -> LinkResult<()> {
        self.send_frame(dest, frame::ETHERTYPE, data).map(|_| ())
    }

    #[inline]
    fn local_mac(&self) -> MacAddr {
        self.mac
    }
}

impl Drop for LinkSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Reads the interface MAC from `/sys/class/net/<interface>/address`.
pub fn interface_mac(interface: &str) -> LinkResult<MacAddr> {
    let path = format!("/sys/class/net/{}/address", interface);

    let text = fs::read_to_string(&path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => LinkError::Fatal(ErrorType::InterfaceMissing),
        _ => err.into(),
    })?;

    text.trim().parse()
}

/// Maps the current OS error onto the link taxonomy.
fn os_error() -> LinkError {
    let err = io::Error::last_os_error();

    match err.raw_os_error() {
        Some(libc::ENETDOWN) => LinkError::Fatal(ErrorType::InterfaceDown),
        Some(libc::EBADF) => LinkError::Fatal(ErrorType::SocketClosed),
        Some(libc::ENODEV) | Some(libc::ENXIO) => LinkError::Fatal(ErrorType::InterfaceMissing),
        _ => err.into(),
    }
}
