//! ethtool EEPROM access through `SIOCETHTOOL`.

use anyhow::{Context, Result};
use std::ffi::c_void;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use log::info;

use super::ConfigRegisters;
use crate::eeprom::format::ETHERNET_CONFIG_LENGTH;

pub const IFNAMSIZ: usize = 16;

const SIOCETHTOOL: libc::c_ulong = 0x8946;
const ETHTOOL_GEEPROM: u32 = 0x0b;
const ETHTOOL_SEEPROM: u32 = 0x0c;

/// `struct ethtool_eeprom` with room for a full configuration.
#[repr(C)]
struct EthtoolEeprom {
    cmd: u32,
    magic: u32,
    offset: u32,
    len: u32,
    data: [u8; ETHERNET_CONFIG_LENGTH],
}

impl EthtoolEeprom {
    fn new(cmd: u32, magic: u32, offset: u32, len: usize) -> Self {
        Self {
            cmd,
            magic,
            offset,
            len: len as u32,
            data: [0; ETHERNET_CONFIG_LENGTH],
        }
    }
}

/// `struct ifreq` carrying an `ifr_data` pointer.
#[repr(C)]
struct IfReq {
    name: [libc::c_char; IFNAMSIZ],
    data: *mut c_void,
    // Rest of the ifr_ifru union
    _pad: [u8; 24],
}

/// Control socket bound to one interface.
pub struct EthtoolChannel {
    socket: OwnedFd,
    name: [libc::c_char; IFNAMSIZ],
}

fn open_socket() -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) calls; ownership of a valid fd moves into OwnedFd.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd >= 0 {
            return Ok(OwnedFd::from_raw_fd(fd));
        }

        let fd = libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_GENERIC);
        if fd >= 0 {
            return Ok(OwnedFd::from_raw_fd(fd));
        }
    }

    Err(io::Error::last_os_error())
}

impl EthtoolChannel {
    /// Open a control channel for interface `ifname`.
    pub fn open(ifname: &str) -> Result<Self> {
        let mut name = [0 as libc::c_char; IFNAMSIZ];
        for (slot, byte) in name.iter_mut().zip(ifname.bytes().take(IFNAMSIZ - 1)) {
            *slot = byte as libc::c_char;
        }

        info!("opening ethtool control socket");
        let socket = open_socket().context("could not open ethtool control socket")?;

        Ok(Self { socket, name })
    }

    fn ioctl(&mut self, request: &mut EthtoolEeprom) -> io::Result<()> {
        let mut ifr = IfReq {
            name: self.name,
            data: request as *mut EthtoolEeprom as *mut c_void,
            _pad: [0; 24],
        };

        // SAFETY: ifr and the request it points to outlive the call.
        let rc = unsafe {
            libc::ioctl(
                self.socket.as_raw_fd(),
                SIOCETHTOOL as _,
                &mut ifr as *mut IfReq,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl ConfigRegisters for EthtoolChannel {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> io::Result<()> {
        let len = buf.len().min(ETHERNET_CONFIG_LENGTH);
        let mut request = EthtoolEeprom::new(ETHTOOL_GEEPROM, 0, offset, len);
        self.ioctl(&mut request)?;
        buf[..len].copy_from_slice(&request.data[..len]);
        Ok(())
    }

    fn write(&mut self, offset: u32, magic: u32, data: &[u8]) -> io::Result<()> {
        if data.len() > ETHERNET_CONFIG_LENGTH {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        let mut request = EthtoolEeprom::new(ETHTOOL_SEEPROM, magic, offset, data.len());
        request.data[..data.len()].copy_from_slice(data);
        self.ioctl(&mut request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        assert_eq!(std::mem::size_of::<EthtoolEeprom>(), 16 + ETHERNET_CONFIG_LENGTH);
        assert!(std::mem::size_of::<IfReq>() >= 40);
    }
}
