//! Minimal netlink transport for the kernel audit subsystem.

use std::{
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::atomic::{AtomicU32, Ordering},
};

use bytes::{Buf, BufMut, BytesMut};
use nix::{
    errno::Errno,
    sys::{
        socket::{
            AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, recv,
            sendto, setsockopt, socket, sockopt,
        },
        time::TimeVal,
    },
};
use thiserror::Error;

pub const NLMSG_HDRLEN: usize = 16;

pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

pub const NLM_F_REQUEST: u16 = 0x1;
pub const NLM_F_ACK: u16 = 0x4;

/// Multicast group delivering a read-only copy of audit records.
pub const AUDIT_NLGRP_READLOG: u32 = 1;

const MAX_MESSAGE_SIZE: usize = 10 * 1024;
const REPLY_TIMEOUT_SECS: i64 = 5;

#[derive(Error, Debug)]
pub enum NetlinkError {
    #[error("netlink socket error")]
    Socket(#[from] Errno),
    #[error("kernel replied with error code {0}")]
    Kernel(Errno),
    #[error("truncated netlink message ({0} bytes)")]
    Truncated(usize),
    #[error("unexpected reply of type {0}")]
    UnexpectedReply(u16),
}

impl NetlinkError {
    /// The socket has been closed under us.
    pub fn is_closed(&self) -> bool {
        matches!(self, NetlinkError::Socket(Errno::EBADF | Errno::ENOTSOCK))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub len: u32,
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub data: Vec<u8>,
}

/// An `AF_NETLINK` / `NETLINK_AUDIT` socket.
#[derive(Debug)]
pub struct NetlinkSocket {
    fd: OwnedFd,
    seq: AtomicU32,
}

impl NetlinkSocket {
    /// Open a blocking socket for request/reply exchanges.
    pub fn unicast() -> Result<Self, NetlinkError> {
        let socket = Self::open(SockFlag::SOCK_CLOEXEC, 0)?;
        setsockopt(&socket.fd, sockopt::ReceiveTimeout, &TimeVal::new(REPLY_TIMEOUT_SECS, 0))?;
        Ok(socket)
    }

    /// Open a non-blocking socket subscribed to the audit record multicast group.
    pub fn multicast() -> Result<Self, NetlinkError> {
        Self::open(
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            1 << (AUDIT_NLGRP_READLOG - 1),
        )
    }

    fn open(flags: SockFlag, groups: u32) -> Result<Self, NetlinkError> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            flags,
            SockProtocol::NetlinkAudit,
        )?;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, groups))?;
        Ok(Self {
            fd,
            seq: AtomicU32::new(1),
        })
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// Send a request to the kernel, returning its sequence number.
    pub fn send(&self, msg_type: u16, flags: u16, payload: &[u8]) -> Result<u32, NetlinkError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let buf = encode(msg_type, flags | NLM_F_REQUEST, seq, payload);
        sendto(
            self.fd.as_raw_fd(),
            &buf,
            &NetlinkAddr::new(0, 0),
            MsgFlags::empty(),
        )?;
        Ok(seq)
    }

    /// Blocking receive of one datagram, split into its messages.
    pub fn receive(&self) -> Result<Vec<Message>, NetlinkError> {
        let mut buf = vec![0; MAX_MESSAGE_SIZE];
        let len = recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::empty())?;
        decode(&buf[..len])
    }

    /// Send `payload` and wait for the acknowledgement.
    pub fn request_ack(&self, msg_type: u16, payload: &[u8]) -> Result<(), NetlinkError> {
        let seq = self.send(msg_type, NLM_F_ACK, payload)?;
        loop {
            for message in self.receive()? {
                if message.header.seq != seq {
                    continue;
                }
                return match message.header.msg_type {
                    NLMSG_ERROR => check_ack(&message.data),
                    other => Err(NetlinkError::UnexpectedReply(other)),
                };
            }
        }
    }

    /// Send `payload` and collect every reply of `reply_type` until the
    /// kernel signals the end of the dump.
    pub fn request_dump(
        &self,
        msg_type: u16,
        reply_type: u16,
        payload: &[u8],
    ) -> Result<Vec<Vec<u8>>, NetlinkError> {
        let seq = self.send(msg_type, NLM_F_ACK, payload)?;
        let mut replies = Vec::new();
        loop {
            for message in self.receive()? {
                if message.header.seq != seq {
                    continue;
                }
                match message.header.msg_type {
                    NLMSG_DONE => return Ok(replies),
                    NLMSG_ERROR => check_ack(&message.data)?,
                    t if t == reply_type => replies.push(message.data),
                    other => return Err(NetlinkError::UnexpectedReply(other)),
                }
            }
        }
    }

    /// Send `payload` and return the first reply of `reply_type`.
    pub fn request_reply(
        &self,
        msg_type: u16,
        reply_type: u16,
        payload: &[u8],
    ) -> Result<Vec<u8>, NetlinkError> {
        let seq = self.send(msg_type, 0, payload)?;
        loop {
            for message in self.receive()? {
                if message.header.seq != seq {
                    continue;
                }
                match message.header.msg_type {
                    NLMSG_ERROR => check_ack(&message.data)?,
                    t if t == reply_type => return Ok(message.data),
                    other => return Err(NetlinkError::UnexpectedReply(other)),
                }
            }
        }
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

pub fn encode(msg_type: u16, flags: u16, seq: u32, payload: &[u8]) -> BytesMut {
    let len = NLMSG_HDRLEN + payload.len();
    let mut buf = BytesMut::with_capacity(align(len));
    buf.put_u32_ne(len as u32);
    buf.put_u16_ne(msg_type);
    buf.put_u16_ne(flags);
    buf.put_u32_ne(seq);
    buf.put_u32_ne(0);
    buf.put_slice(payload);
    buf.resize(align(len), 0);
    buf
}

/// Split a datagram into netlink messages.
pub fn decode(mut buf: &[u8]) -> Result<Vec<Message>, NetlinkError> {
    let mut messages = Vec::new();
    while buf.len() >= NLMSG_HDRLEN {
        let header = parse_header(buf);
        let len = header.len as usize;
        if len < NLMSG_HDRLEN || len > buf.len() {
            return Err(NetlinkError::Truncated(buf.len()));
        }
        messages.push(Message {
            header,
            data: buf[NLMSG_HDRLEN..len].to_vec(),
        });
        buf = &buf[align(len).min(buf.len())..];
    }
    Ok(messages)
}

/// Decode a datagram carrying a single audit record.
///
/// Audit records pushed by the kernel do not have a reliable length in
/// their header, so everything after it is taken as payload.
pub fn decode_record(buf: &[u8]) -> Result<Message, NetlinkError> {
    if buf.len() < NLMSG_HDRLEN {
        return Err(NetlinkError::Truncated(buf.len()));
    }
    let mut data = &buf[NLMSG_HDRLEN..];
    while let [rest @ .., 0] = data {
        data = rest;
    }
    Ok(Message {
        header: parse_header(buf),
        data: data.to_vec(),
    })
}

fn parse_header(mut buf: &[u8]) -> Header {
    Header {
        len: buf.get_u32_ne(),
        msg_type: buf.get_u16_ne(),
        flags: buf.get_u16_ne(),
        seq: buf.get_u32_ne(),
        pid: buf.get_u32_ne(),
    }
}

fn check_ack(mut data: &[u8]) -> Result<(), NetlinkError> {
    if data.len() < 4 {
        return Err(NetlinkError::Truncated(data.len()));
    }
    match data.get_i32_ne() {
        0 => Ok(()),
        code => Err(NetlinkError::Kernel(Errno::from_i32(-code))),
    }
}

fn align(len: usize) -> usize {
    (len + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let buf = encode(1000, NLM_F_REQUEST | NLM_F_ACK, 7, b"abcde");
        assert_eq!(buf.len(), 24);
        let messages = decode(&buf).unwrap();
        assert_eq!(messages.len(), 1);
        let Message { header, data } = &messages[0];
        assert_eq!(header.len, 21);
        assert_eq!(header.msg_type, 1000);
        assert_eq!(header.flags, NLM_F_REQUEST | NLM_F_ACK);
        assert_eq!(header.seq, 7);
        assert_eq!(data, b"abcde");
    }

    #[test]
    fn several_messages_in_one_datagram() {
        let mut buf = encode(NLMSG_ERROR, 0, 1, &0i32.to_ne_bytes());
        buf.extend_from_slice(&encode(NLMSG_DONE, 0, 1, &[]));
        let messages = decode(&buf).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(check_ack(&messages[0].data).is_ok());
        assert_eq!(messages[1].header.msg_type, NLMSG_DONE);
    }

    #[test]
    fn kernel_errors() {
        let err = check_ack(&(-1i32).to_ne_bytes()).unwrap_err();
        assert!(matches!(err, NetlinkError::Kernel(Errno::EPERM)));
        assert!(check_ack(&[0, 0]).is_err());
    }

    #[test]
    fn truncated_message() {
        let mut buf = encode(1000, 0, 1, b"abcdefgh").to_vec();
        buf.truncate(20);
        assert!(matches!(decode(&buf), Err(NetlinkError::Truncated(20))));
    }

    #[test]
    fn record_ignores_header_length() {
        let mut buf = encode(1300, 0, 0, b"audit(1.2:3): pid=1\0\0").to_vec();
        // Kernel records may carry a bogus length.
        buf[..4].copy_from_slice(&3u32.to_ne_bytes());
        let record = decode_record(&buf).unwrap();
        assert_eq!(record.header.msg_type, 1300);
        assert_eq!(record.data, b"audit(1.2:3): pid=1");
    }

    #[test]
    fn closed_errors() {
        assert!(NetlinkError::Socket(Errno::EBADF).is_closed());
        assert!(!NetlinkError::Socket(Errno::ENOBUFS).is_closed());
        assert!(!NetlinkError::Truncated(0).is_closed());
    }
}
