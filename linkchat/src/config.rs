use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Serialize, Deserialize)]
pub struct Link {
    /// OS name of the interface to bind. There is no sensible universal
    /// default; the placeholder is only good for containers.
    pub interface: String,
}

#[derive(Serialize, Deserialize)]
pub struct Transfer {
    pub chunk_size: usize,
    pub ack_timeout_secs: f64,
    pub ack_retries: u32,
    pub receive_root: PathBuf,
}

#[derive(Serialize, Deserialize)]
pub struct Discovery {
    pub timeout_secs: f64,
    pub stale_after_secs: f64,
}

#[derive(Serialize, Deserialize)]
pub struct LinkConfig {
    pub link: Link,
    pub transfer: Transfer,
    pub discovery: Discovery,
}

impl Default for LinkConfig {
    fn default() -> LinkConfig {
        LinkConfig {
            link: Link {
                interface: "eth0".to_string(),
            },
            transfer: Transfer {
                chunk_size: 1200,
                ack_timeout_secs: 1.0,
                ack_retries: 5,
                receive_root: PathBuf::from("."),
            },
            discovery: Discovery {
                timeout_secs: 2.0,
                stale_after_secs: 10.0,
            },
        }
    }
}

impl LinkConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> LinkConfig {
        serdeconv::from_toml_file(path).expect("Error loading link configuration file")
    }

    #[inline]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.transfer.ack_timeout_secs)
    }

    #[inline]
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.discovery.timeout_secs)
    }

    #[inline]
    pub fn peer_stale_after(&self) -> Duration {
        Duration::from_secs_f64(self.discovery.stale_after_secs)
    }
}
