// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Kernel netlink socket.
//!
//! [`NetlinkLink`] abstracts the raw socket so the multiplexer's queueing
//! and correlation logic runs identically against the kernel and against
//! an in-memory link under test. [`KernelLink`] is the production
//! implementation: one `PF_NETLINK`/`SOCK_RAW` socket per protocol, bound
//! to a port id mixing the process id with a per-process instance counter
//! (22-bit pid slot, 10-bit instance slot).

use std::io;
use std::os::fd::RawFd;

use crate::config::NETLINK_SOCKET_RCVBUF;

/// Transport abstraction under the netlink multiplexer.
pub trait NetlinkLink {
    /// Send a batch of wire messages as one vectored datagram to the
    /// kernel. Returns the byte count written.
    fn send_batch(&mut self, parts: &[&[u8]]) -> io::Result<usize>;

    /// Size of the next pending datagram without consuming it.
    /// `WouldBlock` when nothing is queued.
    fn peek_len(&mut self) -> io::Result<usize>;

    /// Receive one datagram. `WouldBlock` when nothing is queued.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Join a multicast group.
    fn join_group(&mut self, group: u32) -> io::Result<()>;

    /// Raw descriptor for registrar hookup; `None` for in-memory links.
    fn raw_fd(&self) -> Option<RawFd>;

    /// Port id the socket is bound to.
    fn port_id(&self) -> u32;
}

/// Port id derivation: 22 bits of process id, 10 bits of instance counter.
pub fn derive_port_id(pid: u32, instance: u32) -> u32 {
    (pid & ((1 << 22) - 1)) | (instance << 22)
}

/// Raw kernel netlink socket.
pub struct KernelLink {
    fd: RawFd,
    port_id: u32,
    protocol: i32,
}

impl KernelLink {
    /// Open, configure and bind a netlink socket for `protocol`.
    pub fn open(protocol: i32, instance: u32) -> io::Result<Self> {
        // SAFETY: plain socket(2) call, result checked below.
        let fd = unsafe {
            libc::socket(
                libc::PF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let rcvbuf: libc::c_int = NETLINK_SOCKET_RCVBUF as libc::c_int;
        // SAFETY: fd is owned, option value outlives the call.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                std::ptr::addr_of!(rcvbuf).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            log::warn!(
                "[NL] protocol {}: cannot set receive buffer size: {}",
                protocol,
                io::Error::last_os_error()
            );
        }

        // SAFETY: getpid never fails.
        let pid = unsafe { libc::getpid() } as u32;
        let port_id = derive_port_id(pid, instance);

        // SAFETY: sockaddr_nl is plain-old-data and fully initialized.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = port_id;
        // SAFETY: addr outlives the call, length matches the struct.
        let rc = unsafe {
            libc::bind(
                fd,
                std::ptr::addr_of!(addr).cast(),
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            log::warn!("[NL] protocol {}: could not bind socket: {}", protocol, err);
            // SAFETY: fd is still owned here.
            unsafe { libc::close(fd) };
            return Err(err);
        }

        log::debug!(
            "[NL] protocol {}: bound netlink socket port id {}",
            protocol,
            port_id
        );
        Ok(Self {
            fd,
            port_id,
            protocol,
        })
    }
}

impl NetlinkLink for KernelLink {
    fn send_batch(&mut self, parts: &[&[u8]]) -> io::Result<usize> {
        let iov: Vec<libc::iovec> = parts
            .iter()
            .map(|part| libc::iovec {
                iov_base: part.as_ptr() as *mut libc::c_void,
                iov_len: part.len(),
            })
            .collect();

        // kernel destination: port id zero, no groups
        // SAFETY: sockaddr_nl is plain-old-data.
        let mut dest: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        dest.nl_family = libc::AF_NETLINK as libc::sa_family_t;

        // SAFETY: msghdr is plain-old-data; iov and dest outlive the call.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = std::ptr::addr_of_mut!(dest).cast();
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        msg.msg_iov = iov.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iov.len();

        // SAFETY: all referenced buffers are valid for the duration.
        let sent = unsafe { libc::sendmsg(self.fd, &msg, libc::MSG_DONTWAIT) };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    fn peek_len(&mut self) -> io::Result<usize> {
        let mut probe = [0u8; 1];
        // MSG_TRUNC makes recv return the real datagram length even when
        // the probe buffer is smaller.
        // SAFETY: probe buffer is valid for one byte.
        let len = unsafe {
            libc::recv(
                self.fd,
                probe.as_mut_ptr().cast(),
                probe.len(),
                libc::MSG_PEEK | libc::MSG_TRUNC | libc::MSG_DONTWAIT,
            )
        };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(len as usize)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is a valid writable slice.
        let len = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(len as usize)
    }

    fn join_group(&mut self, group: u32) -> io::Result<()> {
        let value: libc::c_int = group as libc::c_int;
        // SAFETY: option value outlives the call.
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_NETLINK,
                libc::NETLINK_ADD_MEMBERSHIP,
                std::ptr::addr_of!(value).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.fd)
    }

    fn port_id(&self) -> u32 {
        self.port_id
    }
}

impl Drop for KernelLink {
    fn drop(&mut self) {
        log::debug!("[NL] protocol {}: closing socket", self.protocol);
        // SAFETY: fd is owned and not used after this point.
        unsafe { libc::close(self.fd) };
    }
}

// ============================================================================
// Tests
// ============================================================================
