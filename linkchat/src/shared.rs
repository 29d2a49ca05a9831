use std::fmt;
use std::io;
use std::str::FromStr;

pub type LinkResult<T> = Result<T, LinkError>;

#[derive(Debug, Eq, PartialEq)]
pub enum LinkError {
    /// A bounded wait elapsed without data. Retryable, never fatal on its own.
    Timeout,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    InterfaceMissing,
    PermissionDenied,
    InterfaceDown,
    SocketClosed,
    MalformedHeader,
    VersionMismatch,
    PayloadTooLarge,
    InvalidTransferId,
    InvalidMac,
    AckTimeout,
    FileNotFound,
    Io(io::ErrorKind),
}

impl From<io::Error> for LinkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => LinkError::Timeout,
            io::ErrorKind::PermissionDenied => LinkError::Fatal(ErrorType::PermissionDenied),
            kind => LinkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for LinkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(LinkError::Timeout) => false,
            _ => true,
        }
    }
}

const MAC_LEN: usize = 6;

/// A hardware address. Peers are identified by nothing else.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct MacAddr([u8; MAC_LEN]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; MAC_LEN]);

    #[inline]
    pub fn new(octets: [u8; MAC_LEN]) -> MacAddr {
        MacAddr(octets)
    }

    /// Parses the leading six bytes of a raw frame slice. The caller must have
    /// validated the length.
    #[inline]
    pub fn from_slice(raw: &[u8]) -> MacAddr {
        let mut octets = [0u8; MAC_LEN];
        octets.copy_from_slice(&raw[..MAC_LEN]);
        MacAddr(octets)
    }

    #[inline]
    pub fn octets(&self) -> &[u8; MAC_LEN] {
        &self.0
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = LinkError;

    /// Accepts colon separated hex octets in either case.
    fn from_str(text: &str) -> LinkResult<MacAddr> {
        let mut octets = [0u8; MAC_LEN];
        let mut count = 0;

        for part in text.split(':') {
            if count == MAC_LEN || part.len() != 2 {
                return Err(LinkError::Fatal(ErrorType::InvalidMac));
            }

            octets[count] = u8::from_str_radix(part, 16)
                .map_err(|_| LinkError::Fatal(ErrorType::InvalidMac))?;
            count += 1;
        }

        if count != MAC_LEN {
            return Err(LinkError::Fatal(ErrorType::InvalidMac));
        }

        Ok(MacAddr(octets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_roundtrip() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:0f".parse().unwrap();

        assert_eq!(mac.octets(), &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x0f]);
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:0f");
    }

    #[test]
    fn test_mac_parse_upper_case() {
        let mac: MacAddr = "02:00:AB:00:00:01".parse().unwrap();

        assert_eq!(mac.to_string(), "02:00:ab:00:00:01");
    }

    #[test]
    fn test_mac_parse_err_short() {
        let result = "aa:bb:cc".parse::<MacAddr>();

        assert_eq!(result.unwrap_err(), LinkError::Fatal(ErrorType::InvalidMac));
    }

    #[test]
    fn test_mac_parse_err_garbage() {
        let result = "aa:bb:cc:dd:ee:zz".parse::<MacAddr>();

        assert_eq!(result.unwrap_err(), LinkError::Fatal(ErrorType::InvalidMac));
    }

    #[test]
    fn test_broadcast() {
        let mac: MacAddr = "ff:ff:ff:ff:ff:ff".parse().unwrap();

        assert!(mac.is_broadcast());
        assert_eq!(mac, MacAddr::BROADCAST);
    }

    #[test]
    fn test_io_error_folding() {
        let timeout: LinkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        let denied: LinkError = io::Error::from(io::ErrorKind::PermissionDenied).into();

        assert_eq!(timeout, LinkError::Timeout);
        assert_eq!(denied, LinkError::Fatal(ErrorType::PermissionDenied));
        assert!(!Err::<(), _>(timeout).has_failed());
        assert!(Err::<(), _>(denied).has_failed());
    }
}
