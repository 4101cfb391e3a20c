//! AF_PACKET capture backend
//!
//! Frames this host transmits on the interface are looped back to packet
//! sockets as PACKET_OUTGOING; `recv` skips them so a bridge never re-reads
//! its own output.

use super::{Capture, RxInfo};
use crate::{Error, Result};
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;
use tracing::debug;

/// Turn a libc return value into an `io::Result`
fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_len(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn eth_p_all() -> u16 {
    (libc::ETH_P_ALL as u16).to_be()
}

/// Raw packet socket bound to one interface in promiscuous mode
pub struct AfPacketSocket {
    async_fd: AsyncFd<OwnedFd>,
    ifname: String,
    ifindex: i32,
}

impl AfPacketSocket {
    /// Open a non-blocking packet socket on `ifname`
    pub fn bind(ifname: &str) -> Result<Self> {
        let raw = cvt(unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                eth_p_all() as i32,
            )
        })?;
        // closed on every early return from here on
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let ifindex = interface_index(fd.as_raw_fd(), ifname)?;

        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: eth_p_all(),
            sll_ifindex: ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };
        cvt(unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sockaddr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        })?;

        set_promisc(fd.as_raw_fd(), ifindex, true)?;
        debug!(interface = ifname, ifindex, "packet socket bound");

        Ok(Self {
            async_fd: AsyncFd::new(fd)?,
            ifname: ifname.to_string(),
            ifindex,
        })
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn ifindex(&self) -> i32 {
        self.ifindex
    }

    /// Receive the next frame that did not originate on this host
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<RxInfo> {
        loop {
            let mut guard = self.async_fd.readable_mut().await?;

            let received = guard.try_io(|inner| {
                let mut from: libc::sockaddr_ll = unsafe { mem::zeroed() };
                let mut from_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
                let len = cvt_len(unsafe {
                    libc::recvfrom(
                        inner.get_ref().as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                        &mut from as *mut _ as *mut libc::sockaddr,
                        &mut from_len,
                    )
                })?;
                Ok((len, from.sll_pkttype))
            });

            match received {
                Ok(Ok((_, pkttype))) if pkttype == libc::PACKET_OUTGOING as u8 => continue,
                Ok(Ok((len, _))) => return Ok(RxInfo { len, vlan_id: None }),
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Transmit one frame on the interface
    pub async fn send(&mut self, buf: &[u8]) -> Result<usize> {
        loop {
            let mut guard = self.async_fd.writable_mut().await?;

            match guard.try_io(|inner| {
                cvt_len(unsafe {
                    libc::send(
                        inner.get_ref().as_raw_fd(),
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                        0,
                    )
                })
            }) {
                Ok(result) => return result.map_err(Error::Io),
                Err(_would_block) => continue,
            }
        }
    }
}

fn interface_index(fd: RawFd, ifname: &str) -> Result<i32> {
    let not_found = || Error::InterfaceNotFound {
        name: ifname.to_string(),
    };
    let name = CString::new(ifname).map_err(|_| not_found())?;
    let bytes = name.as_bytes_with_nul();

    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    if bytes.len() > ifr.ifr_name.len() {
        return Err(not_found());
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    cvt(unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX, &mut ifr) }).map_err(|_| not_found())?;
    Ok(unsafe { ifr.ifr_ifru.ifru_ifindex })
}

fn set_promisc(fd: RawFd, ifindex: i32, enable: bool) -> io::Result<()> {
    let mreq = libc::packet_mreq {
        mr_ifindex: ifindex,
        mr_type: libc::PACKET_MR_PROMISC as u16,
        mr_alen: 0,
        mr_address: [0; 8],
    };
    let optname = if enable {
        libc::PACKET_ADD_MEMBERSHIP
    } else {
        libc::PACKET_DROP_MEMBERSHIP
    };

    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            optname,
            &mreq as *const _ as *const libc::c_void,
            mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

impl AsRawFd for AfPacketSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.async_fd.get_ref().as_raw_fd()
    }
}

impl Drop for AfPacketSocket {
    fn drop(&mut self) {
        // the OwnedFd closes itself
        let _ = set_promisc(self.as_raw_fd(), self.ifindex, false);
    }
}

impl Capture for AfPacketSocket {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<RxInfo> {
        AfPacketSocket::recv(self, buf).await
    }

    async fn send(&mut self, buf: &[u8]) -> Result<usize> {
        AfPacketSocket::send(self, buf).await
    }
}
