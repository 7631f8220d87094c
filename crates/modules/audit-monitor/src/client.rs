//! Audit clients: one for rule management, one for listening to events.

use std::{
    os::fd::{AsRawFd, OwnedFd},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use nix::{
    errno::Errno,
    sys::socket::{MsgFlags, recv},
};
use tokio::io::unix::AsyncFd;

use crate::netlink::{Message, NetlinkError, NetlinkSocket, decode_record};

const AUDIT_GET: u16 = 1000;
const AUDIT_SET: u16 = 1001;
const AUDIT_ADD_RULE: u16 = 1011;
const AUDIT_DEL_RULE: u16 = 1012;
const AUDIT_LIST_RULES: u16 = 1013;

const AUDIT_STATUS_ENABLED: u32 = 0x0001;

/// Value of `enabled` when the rule set is immutable until reboot.
const AUDIT_LOCKED: u32 = 2;

const RECORD_BUFFER_SIZE: usize = 10 * 1024;
const DRAIN_IDLE: Duration = Duration::from_millis(50);
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Subset of the kernel `audit_status` structure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditStatus {
    pub mask: u32,
    pub enabled: u32,
    pub failure: u32,
    pub pid: u32,
    pub rate_limit: u32,
    pub backlog_limit: u32,
    pub lost: u32,
    pub backlog: u32,
}

impl AuditStatus {
    fn parse(mut data: &[u8]) -> Result<Self, NetlinkError> {
        if data.len() < 32 {
            return Err(NetlinkError::Truncated(data.len()));
        }
        Ok(Self {
            mask: data.get_u32_ne(),
            enabled: data.get_u32_ne(),
            failure: data.get_u32_ne(),
            pid: data.get_u32_ne(),
            rate_limit: data.get_u32_ne(),
            backlog_limit: data.get_u32_ne(),
            lost: data.get_u32_ne(),
            backlog: data.get_u32_ne(),
        })
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(40);
        for value in [
            self.mask,
            self.enabled,
            self.failure,
            self.pid,
            self.rate_limit,
            self.backlog_limit,
            self.lost,
            self.backlog,
            0,
            0,
        ] {
            buf.put_u32_ne(value);
        }
        buf
    }

    pub fn is_locked(&self) -> bool {
        self.enabled == AUDIT_LOCKED
    }
}

/// Request/reply client used to inspect and change the kernel rule set.
#[derive(Debug)]
pub struct RuleClient {
    socket: NetlinkSocket,
}

impl RuleClient {
    pub fn new() -> Result<Self, NetlinkError> {
        Ok(Self {
            socket: NetlinkSocket::unicast()?,
        })
    }

    pub fn status(&self) -> Result<AuditStatus, NetlinkError> {
        let reply = self.socket.request_reply(AUDIT_GET, AUDIT_GET, &[])?;
        AuditStatus::parse(&reply)
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), NetlinkError> {
        let status = AuditStatus {
            mask: AUDIT_STATUS_ENABLED,
            enabled: enabled as u32,
            ..Default::default()
        };
        self.socket.request_ack(AUDIT_SET, &status.encode())
    }

    /// Raw `audit_rule_data` of every installed rule.
    pub fn rules(&self) -> Result<Vec<Vec<u8>>, NetlinkError> {
        self.socket
            .request_dump(AUDIT_LIST_RULES, AUDIT_LIST_RULES, &[])
    }

    /// Remove every installed rule, returning how many were removed.
    pub fn delete_all_rules(&self) -> Result<usize, NetlinkError> {
        let rules = self.rules()?;
        for rule in &rules {
            self.delete_rule(rule)?;
        }
        Ok(rules.len())
    }

    pub fn delete_rule(&self, rule: &[u8]) -> Result<(), NetlinkError> {
        self.socket.request_ack(AUDIT_DEL_RULE, rule)
    }

    pub fn add_rule(&self, rule: &[u8]) -> Result<(), NetlinkError> {
        self.socket.request_ack(AUDIT_ADD_RULE, rule)
    }

    pub fn close(self) {
        close(self.socket.into_fd());
    }
}

/// Listener on the audit multicast group.
#[derive(Debug)]
pub struct EventClient {
    fd: AsyncFd<OwnedFd>,
}

impl EventClient {
    /// Subscribe to audit records. Must be called inside a tokio runtime.
    pub fn new() -> Result<Self, NetlinkError> {
        let socket = NetlinkSocket::multicast()?;
        let fd = AsyncFd::new(socket.into_fd()).map_err(errno_of)?;
        Ok(Self { fd })
    }

    /// Wait for the next audit record.
    pub async fn receive(&self) -> Result<Message, NetlinkError> {
        let mut buf = vec![0; RECORD_BUFFER_SIZE];
        loop {
            let mut guard = self.fd.readable().await.map_err(errno_of)?;
            match guard.try_io(|fd| {
                recv(fd.get_ref().as_raw_fd(), &mut buf, MsgFlags::empty()).map_err(Into::into)
            }) {
                Ok(Ok(len)) => return decode_record(&buf[..len]),
                Ok(Err(err)) => return Err(errno_of(err)),
                Err(_would_block) => continue,
            }
        }
    }

    pub fn close(self) {
        close(self.fd.into_inner());
    }
}

fn errno_of(err: std::io::Error) -> NetlinkError {
    NetlinkError::Socket(Errno::from_i32(err.raw_os_error().unwrap_or(0)))
}

/// Close an audit socket while draining it.
///
/// The kernel keeps queueing records on the socket until it is gone; a full
/// receive buffer can stall the release. A helper thread empties the socket
/// through a duplicate descriptor while ours is closed, then stops once the
/// queue is empty, dropping the last reference.
fn close(fd: OwnedFd) {
    let duplicate = match fd.try_clone() {
        Ok(duplicate) => duplicate,
        Err(err) => {
            log::warn!("Closing audit socket without draining: {err}");
            return;
        }
    };
    let closing = Arc::new(AtomicBool::new(false));
    let drain = {
        let closing = closing.clone();
        thread::spawn(move || drain(duplicate, &closing))
    };
    drop(fd);
    closing.store(true, Ordering::SeqCst);
    if drain.join().is_err() {
        log::warn!("Audit drain thread panicked");
    }
}

/// Discard records until `closing` is set and nothing is left to read, or
/// [`DRAIN_DEADLINE`] has passed since `closing` was seen.
fn drain(fd: OwnedFd, closing: &AtomicBool) {
    let mut buf = vec![0; RECORD_BUFFER_SIZE];
    let mut closed_at = None;
    loop {
        if closing.load(Ordering::SeqCst) {
            let since = *closed_at.get_or_insert_with(Instant::now);
            if since.elapsed() > DRAIN_DEADLINE {
                log::warn!("Audit socket still busy, closing it anyway");
                return;
            }
        }
        match recv(fd.as_raw_fd(), &mut buf, MsgFlags::MSG_DONTWAIT) {
            Ok(_) | Err(Errno::EINTR) => {}
            Err(Errno::EAGAIN) if closed_at.is_some() => return,
            Err(Errno::EAGAIN) => thread::sleep(DRAIN_IDLE),
            Err(err) => {
                log::debug!("Stop draining audit socket: {err}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixDatagram;

    use super::*;

    #[test]
    fn status_layout() {
        let status = AuditStatus {
            mask: AUDIT_STATUS_ENABLED,
            enabled: 1,
            pid: 99,
            ..Default::default()
        };
        let buf = status.encode();
        assert_eq!(buf.len(), 40);
        assert_eq!(AuditStatus::parse(&buf).unwrap(), status);
        assert!(AuditStatus::parse(&buf[..20]).is_err());
    }

    #[test]
    fn locked_status() {
        let mut status = AuditStatus::default();
        assert!(!status.is_locked());
        status.enabled = 1;
        assert!(!status.is_locked());
        status.enabled = AUDIT_LOCKED;
        assert!(status.is_locked());
    }

    fn pending(socket: &UnixDatagram) -> usize {
        socket.set_nonblocking(true).unwrap();
        let mut buf = [0; 64];
        let mut count = 0;
        while socket.recv(&mut buf).is_ok() {
            count += 1;
        }
        count
    }

    #[test]
    fn close_drains_pending_records() {
        let (reader, writer) = UnixDatagram::pair().unwrap();
        for _ in 0..64 {
            writer.send(b"pending record").unwrap();
        }
        // Same queue, still readable after our descriptor is gone.
        let observer = reader.try_clone().unwrap();
        close(OwnedFd::from(reader));
        assert_eq!(pending(&observer), 0);
    }

    #[test]
    fn drain_runs_until_closing() {
        let (reader, writer) = UnixDatagram::pair().unwrap();
        let observer = reader.try_clone().unwrap();
        let closing = Arc::new(AtomicBool::new(false));
        let handle = {
            let closing = closing.clone();
            thread::spawn(move || drain(OwnedFd::from(reader), &closing))
        };
        for _ in 0..16 {
            writer.send(b"late record").unwrap();
        }
        thread::sleep(DRAIN_IDLE * 4);
        assert!(!handle.is_finished());
        closing.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert_eq!(pending(&observer), 0);
    }

    #[test]
    fn drain_stops_on_socket_errors() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let closing = AtomicBool::new(false);
        // recv on a regular file fails with ENOTSOCK.
        drain(OwnedFd::from(file), &closing);
    }
}
