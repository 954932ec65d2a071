//! Raw rtnetlink transport for traffic-control objects.
//!
//! Builds RTM_*QDISC / RTM_*TCLASS / RTM_*TFILTER messages by hand over
//! an `AF_NETLINK` socket. Only the message shapes the binder needs are
//! implemented.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use porto_error::{PortoError, Result};

pub(crate) const RTM_NEWQDISC: u16 = 36;
pub(crate) const RTM_DELQDISC: u16 = 37;
pub(crate) const RTM_NEWTCLASS: u16 = 40;
pub(crate) const RTM_DELTCLASS: u16 = 41;
pub(crate) const RTM_NEWTFILTER: u16 = 44;
pub(crate) const RTM_DELTFILTER: u16 = 45;

pub(crate) const NLM_F_REQUEST: u16 = 0x0001;
pub(crate) const NLM_F_ACK: u16 = 0x0004;
pub(crate) const NLM_F_EXCL: u16 = 0x0200;
pub(crate) const NLM_F_CREATE: u16 = 0x0400;

pub(crate) const TCA_KIND: u16 = 1;
pub(crate) const TCA_OPTIONS: u16 = 2;

pub(crate) const TCA_HTB_PARMS: u16 = 1;
pub(crate) const TCA_HTB_INIT: u16 = 2;
pub(crate) const TCA_HTB_CTAB: u16 = 3;
pub(crate) const TCA_HTB_RTAB: u16 = 4;

/// `TC_H_ROOT`: parent handle meaning "attach at the device root".
pub(crate) const TC_H_ROOT: u32 = 0xFFFF_FFFF;

const NLA_F_NESTED: u16 = 1 << 15;

/// Netlink message header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

/// Traffic-control message body.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct TcMsg {
    pub tcm_family: u8,
    pub _pad1: u8,
    pub _pad2: u16,
    pub tcm_ifindex: i32,
    pub tcm_handle: u32,
    pub tcm_parent: u32,
    pub tcm_info: u32,
}

impl TcMsg {
    pub(crate) const fn new(ifindex: i32, handle: u32, parent: u32, info: u32) -> Self {
        Self {
            tcm_family: libc::AF_UNSPEC as u8,
            _pad1: 0,
            _pad2: 0,
            tcm_ifindex: ifindex,
            tcm_handle: handle,
            tcm_parent: parent,
            tcm_info: info,
        }
    }
}

/// Netlink attribute header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlAttr {
    nla_len: u16,
    nla_type: u16,
}

fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    // repr(C) POD structs only.
    unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>()) }
}

/// Message builder for one tc request.
pub(crate) struct TcRequest {
    buf: Vec<u8>,
}

impl TcRequest {
    pub(crate) fn new(tcm: TcMsg) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        buf.extend_from_slice(as_bytes(&tcm));
        Self { buf }
    }

    pub(crate) fn attr_string(&mut self, attr_type: u16, value: &str) {
        let payload_len = value.len() + 1;
        self.attr_header(attr_type, payload_len);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        self.pad(payload_len);
    }

    pub(crate) fn attr_bytes(&mut self, attr_type: u16, value: &[u8]) {
        self.attr_header(attr_type, value.len());
        self.buf.extend_from_slice(value);
        self.pad(value.len());
    }

    /// Opens a nested attribute; returns a cursor to close it with.
    pub(crate) fn nest_open(&mut self, attr_type: u16) -> usize {
        let start = self.buf.len();
        let attr = NlAttr {
            nla_len: 0,
            nla_type: attr_type | NLA_F_NESTED,
        };
        self.buf.extend_from_slice(as_bytes(&attr));
        start
    }

    pub(crate) fn nest_close(&mut self, start: usize) {
        let len = (self.buf.len() - start) as u16;
        self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
    }

    fn attr_header(&mut self, attr_type: u16, payload_len: usize) {
        let attr = NlAttr {
            nla_len: (mem::size_of::<NlAttr>() + payload_len) as u16,
            nla_type: attr_type,
        };
        self.buf.extend_from_slice(as_bytes(&attr));
    }

    fn pad(&mut self, payload_len: usize) {
        let rem = (mem::size_of::<NlAttr>() + payload_len) % 4;
        if rem != 0 {
            self.buf.extend(std::iter::repeat(0).take(4 - rem));
        }
    }

    fn finish(mut self, msg_type: u16, flags: u16, seq: u32) -> Vec<u8> {
        let hdr = NlMsgHdr {
            nlmsg_len: self.buf.len() as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: seq,
            nlmsg_pid: 0,
        };
        self.buf[..mem::size_of::<NlMsgHdr>()].copy_from_slice(as_bytes(&hdr));
        self.buf
    }
}

/// Blocking rtnetlink socket for tc requests.
pub struct NetlinkSocket {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkSocket {
    /// Opens and binds an rtnetlink socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    pub fn new() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(PortoError::unknown(format!(
                "can't create netlink socket: {}",
                io::Error::last_os_error()
            )));
        }

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        let ret = unsafe {
            libc::bind(
                fd,
                std::ptr::addr_of!(addr).cast(),
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(PortoError::unknown(format!(
                "can't bind netlink socket: {err}"
            )));
        }

        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            seq: 0,
        })
    }

    /// Sends one tc request and waits for the kernel's ack.
    ///
    /// Returns the kernel's errno as `Err(raw_errno)` inside `Ok` so
    /// callers can implement idempotency without string matching.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the socket itself fails.
    pub(crate) fn request(
        &mut self,
        msg_type: u16,
        flags: u16,
        req: TcRequest,
    ) -> Result<std::result::Result<(), i32>> {
        self.seq = self.seq.wrapping_add(1);
        let msg = req.finish(msg_type, NLM_F_REQUEST | NLM_F_ACK | flags, self.seq);

        let sent = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr().cast(),
                msg.len(),
                0,
            )
        };
        if sent < 0 {
            return Err(PortoError::unknown(format!(
                "can't send netlink message: {}",
                io::Error::last_os_error()
            )));
        }

        let mut buf = [0u8; 4096];
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
            )
        };
        if len < 0 {
            return Err(PortoError::unknown(format!(
                "can't receive netlink ack: {}",
                io::Error::last_os_error()
            )));
        }

        let hdr_size = mem::size_of::<NlMsgHdr>() as isize;
        if len >= hdr_size + 4 {
            let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
            if msg_type == libc::NLMSG_ERROR as u16 {
                let errno = i32::from_ne_bytes([
                    buf[hdr_size as usize],
                    buf[hdr_size as usize + 1],
                    buf[hdr_size as usize + 2],
                    buf[hdr_size as usize + 3],
                ]);
                if errno != 0 {
                    return Ok(Err(-errno));
                }
            }
        }
        Ok(Ok(()))
    }

    /// Resolves a link name to its interface index.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotAvailable` for an unknown link.
    pub fn ifindex(name: &str) -> Result<u32> {
        let c_name = std::ffi::CString::new(name)
            .map_err(|e| PortoError::invalid_value(format!("bad link name {name:?}: {e}")))?;
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if index == 0 {
            return Err(PortoError::new(
                porto_error::EError::ResourceNotAvailable,
                format!("network link {name} not found"),
            ));
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attrs_are_aligned() {
        let mut req = TcRequest::new(TcMsg::new(1, 0, TC_H_ROOT, 0));
        req.attr_string(TCA_KIND, "htb");
        // header(4) + "htb\0"(4) lands on an aligned boundary already
        let after_kind = req.buf.len();
        assert_eq!(after_kind % 4, 0);

        req.attr_bytes(TCA_OPTIONS, &[1, 2, 3]);
        assert_eq!(req.buf.len() % 4, 0);
    }

    #[test]
    fn nested_attr_length_covers_children() {
        let mut req = TcRequest::new(TcMsg::new(1, 0, TC_H_ROOT, 0));
        let nest = req.nest_open(TCA_OPTIONS);
        req.attr_bytes(TCA_HTB_INIT, &[0u8; 8]);
        req.nest_close(nest);

        let nla_len = u16::from_ne_bytes([req.buf[nest], req.buf[nest + 1]]);
        assert_eq!(nla_len as usize, req.buf.len() - nest);
    }

    #[test]
    fn finish_stamps_header() {
        let req = TcRequest::new(TcMsg::new(2, 0x0001_0000, TC_H_ROOT, 0));
        let msg = req.finish(RTM_NEWQDISC, NLM_F_REQUEST | NLM_F_ACK, 7);

        let nlmsg_len = u32::from_ne_bytes([msg[0], msg[1], msg[2], msg[3]]);
        assert_eq!(nlmsg_len as usize, msg.len());
        let nlmsg_type = u16::from_ne_bytes([msg[4], msg[5]]);
        assert_eq!(nlmsg_type, RTM_NEWQDISC);
    }
}
