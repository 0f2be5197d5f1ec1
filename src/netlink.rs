//! Netlink ingestor: translates kernel link and route events into
//! conditions.
//!
//! A `NETLINK_ROUTE` socket subscribed to the link and IPv4 route multicast
//! groups feeds `net/<ifname>/{exist,up,running}` and `net/route/default`.
//! Linux does not emit route messages when an interface goes down, so the
//! ingestor remembers the default route's interface index and re-dumps the
//! route table when that link drops. `ENOBUFS` from the kernel means events
//! were lost; the whole `net/` namespace is then deasserted silently and
//! rebuilt from fresh link and route dumps before services step again.
//!
//! All operations use a raw netlink socket with hand-declared rtnetlink
//! constants; there is no dependency beyond `libc` and `nix`.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::{
    errno::Errno,
    sys::socket::{
        AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, bind,
        recv, send, socket,
    },
};
use tracing::{debug, warn};

use crate::{ctx::InitCtx, error::NetlinkError};

// Netlink constants (from linux/netlink.h, linux/rtnetlink.h, net/if.h).
const RTMGRP_LINK: u32 = 0x1;
const RTMGRP_IPV4_ROUTE: u32 = 0x40;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_GETLINK: u16 = 18;
const RTM_NEWROUTE: u16 = 24;
const RTM_DELROUTE: u16 = 25;
const RTM_GETROUTE: u16 = 26;

const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_DUMP: u16 = 0x0300;

const IFLA_IFNAME: u16 = 3;
const IFF_UP: u32 = 0x1;
const IFF_RUNNING: u32 = 0x40;

const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;

const AF_INET: u8 = 2;
const AF_UNSPEC: u8 = 0;
const RT_TABLE_MAIN: u8 = 254;

const NLMSG_HDRLEN: usize = 16;
const IFINFOMSG_LEN: usize = 16;
const RTMSG_LEN: usize = 12;
const NL_BUFSZ: usize = 8192;

/// One decoded kernel event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NlEvent {
    /// Link appeared or its flags changed; `exist` is false on deletion.
    Link {
        /// Interface name.
        name: String,
        /// Interface index.
        index: i32,
        /// Present in the system at all.
        exist: bool,
        /// Administratively up.
        up: bool,
        /// Carrier present.
        running: bool,
    },
    /// The default route (dst and prefix both zero) was added or removed.
    DefaultRoute {
        /// True on RTM_NEWROUTE.
        present: bool,
        /// Outgoing interface index.
        oif: i32,
    },
    /// End of a dump.
    Done,
    /// In-band kernel error report.
    KernelError(i32),
}

fn read_u16(buf: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_ne_bytes(buf.get(off..off + 2)?.try_into().ok()?))
}

fn read_u32(buf: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_ne_bytes(buf.get(off..off + 4)?.try_into().ok()?))
}

fn read_i32(buf: &[u8], off: usize) -> Option<i32> {
    Some(i32::from_ne_bytes(buf.get(off..off + 4)?.try_into().ok()?))
}

/// Iterator over routing attributes in a message payload.
struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let len = read_u16(self.data, 0)? as usize;
        let ty = read_u16(self.data, 2)?;
        if len < 4 || len > self.data.len() {
            return None;
        }
        let value = &self.data[4..len];
        let advance = (len + 3) & !3;
        self.data = if advance >= self.data.len() {
            &[]
        } else {
            &self.data[advance..]
        };
        Some((ty, value))
    }
}

fn valid_ifname(name: &str) -> bool {
    !name.is_empty()
        && name.len() < 16
        && name != "."
        && name != ".."
        && !name
            .chars()
            .any(|c| c == '/' || c == ':' || c.is_whitespace())
}

fn parse_link(msg_type: u16, payload: &[u8]) -> Option<NlEvent> {
    if payload.len() < IFINFOMSG_LEN {
        warn!("netlink: link message too small, skipping");
        return None;
    }
    let index = read_i32(payload, 4)?;
    let flags = read_u32(payload, 8)?;

    let mut name = None;
    for (ty, value) in (AttrIter {
        data: &payload[IFINFOMSG_LEN..],
    }) {
        if ty == IFLA_IFNAME {
            let raw = value.split(|b| *b == 0).next().unwrap_or(value);
            name = String::from_utf8(raw.to_vec()).ok();
        }
    }

    let name = name.filter(|n| valid_ifname(n))?;
    if msg_type == RTM_DELLINK {
        Some(NlEvent::Link {
            name,
            index,
            exist: false,
            up: false,
            running: false,
        })
    } else {
        Some(NlEvent::Link {
            name,
            index,
            exist: true,
            up: (flags & IFF_UP) != 0,
            running: (flags & IFF_RUNNING) != 0,
        })
    }
}

fn parse_route(msg_type: u16, payload: &[u8]) -> Option<NlEvent> {
    if payload.len() < RTMSG_LEN {
        warn!("netlink: route message too small, skipping");
        return None;
    }
    let dst_len = payload[1];

    let mut dst = 0u32;
    let mut gateway = 0u32;
    let mut oif = 0i32;
    for (ty, value) in (AttrIter {
        data: &payload[RTMSG_LEN..],
    }) {
        match ty {
            RTA_DST => dst = read_u32(value, 0).unwrap_or(0),
            RTA_GATEWAY => gateway = read_u32(value, 0).unwrap_or(0),
            RTA_OIF => oif = read_i32(value, 0).unwrap_or(0),
            _ => {}
        }
    }

    // Only the default route matters here: zero destination, zero prefix.
    if dst == 0 && dst_len == 0 && (gateway != 0 || oif != 0) {
        Some(NlEvent::DefaultRoute {
            present: msg_type == RTM_NEWROUTE,
            oif,
        })
    } else {
        None
    }
}

/// Walks a receive buffer of netlink messages and decodes the interesting
/// ones.
pub fn parse_events(buf: &[u8]) -> Vec<NlEvent> {
    let mut events = Vec::new();
    let mut off = 0usize;

    while off + NLMSG_HDRLEN <= buf.len() {
        let Some(len) = read_u32(buf, off).map(|l| l as usize) else {
            break;
        };
        let Some(msg_type) = read_u16(buf, off + 4) else {
            break;
        };
        if len < NLMSG_HDRLEN || off + len > buf.len() {
            warn!("netlink: truncated message, dropping rest of buffer");
            break;
        }
        let payload = &buf[off + NLMSG_HDRLEN..off + len];

        match msg_type {
            NLMSG_DONE => {
                events.push(NlEvent::Done);
                break;
            }
            NLMSG_ERROR => {
                let errno = read_i32(payload, 0).unwrap_or(0);
                events.push(NlEvent::KernelError(-errno));
            }
            RTM_NEWLINK | RTM_DELLINK => events.extend(parse_link(msg_type, payload)),
            RTM_NEWROUTE | RTM_DELROUTE => events.extend(parse_route(msg_type, payload)),
            other => debug!("netlink: unhandled message type {other}"),
        }

        off += (len + 3) & !3;
    }

    events
}

/// The resident netlink listener.
#[derive(Debug)]
pub struct Netlink {
    fd: OwnedFd,
    default_idx: i32,
    ifdown_pending: bool,
}

impl Netlink {
    /// Opens and subscribes the multicast socket.
    pub fn open() -> Result<Self, NetlinkError> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )
        .map_err(NetlinkError::Socket)?;
        let addr = NetlinkAddr::new(0, RTMGRP_LINK | RTMGRP_IPV4_ROUTE);
        bind(fd.as_raw_fd(), &addr).map_err(NetlinkError::Socket)?;

        Ok(Self {
            fd,
            default_idx: 0,
            ifdown_pending: false,
        })
    }

    /// Poll registration handle.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    fn apply(&mut self, ctx: &mut InitCtx, event: NlEvent) {
        match event {
            NlEvent::Link {
                name,
                index,
                exist,
                up,
                running,
            } => {
                debug!("netlink: {name} exist:{exist} up:{up} running:{running}");
                let set_or_clear = |ctx: &mut InitCtx, cond: String, on: bool| {
                    if on {
                        ctx.cond.set(&cond);
                    } else {
                        ctx.cond.clear(&cond);
                    }
                };
                set_or_clear(ctx, format!("net/{name}/exist"), exist);
                set_or_clear(ctx, format!("net/{name}/up"), up);
                set_or_clear(ctx, format!("net/{name}/running"), running);
                ctx.schedule_step();

                if (!exist || !up || !running)
                    && self.default_idx > 0
                    && (self.default_idx == index || !exist)
                {
                    self.ifdown_pending = true;
                }
            }
            NlEvent::DefaultRoute { present, oif } => {
                if present {
                    debug!("netlink: default route via ifindex {oif}");
                    ctx.cond.set("net/route/default");
                    self.default_idx = oif;
                } else {
                    debug!("netlink: default route removed");
                    ctx.cond.clear("net/route/default");
                    self.default_idx = 0;
                }
                ctx.schedule_step();
            }
            NlEvent::KernelError(errno) => {
                warn!("netlink: kernel error {}", Errno::from_raw(errno));
            }
            NlEvent::Done => {}
        }
    }

    fn drain(&mut self, ctx: &mut InitCtx) -> Result<(), Errno> {
        let mut buf = [0u8; NL_BUFSZ];
        loop {
            match recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                Ok(0) => return Ok(()),
                Ok(len) => {
                    for event in parse_events(&buf[..len]) {
                        self.apply(ctx, event);
                    }
                }
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Handles read-readiness on the multicast socket.
    pub fn handle_ready(&mut self, ctx: &mut InitCtx) {
        match self.drain(ctx) {
            Ok(()) => {}
            Err(Errno::ENOBUFS) => {
                warn!("netlink: busy system, resynchronizing with kernel");
                self.resync(ctx, true);
                return;
            }
            Err(err) => {
                warn!("netlink: recv failed: {err}");
                return;
            }
        }

        // Route messages are not sent when links drop; recheck ourselves.
        if self.ifdown_pending {
            self.ifdown_pending = false;
            if self.default_idx > 0 {
                debug!("netlink: default-route interface down, rechecking");
                self.default_idx = 0;
                self.resync(ctx, false);
                if self.default_idx <= 0 {
                    ctx.cond.clear("net/route/default");
                    ctx.schedule_step();
                }
            }
        }
    }

    /// Re-dumps kernel state. A full resync deasserts every `net/`
    /// condition without notifying dependents first, so no false OFF is
    /// delivered while the dumps rebuild ground truth.
    pub fn resync(&mut self, ctx: &mut InitCtx, all: bool) {
        if all {
            ctx.cond.deassert("net/");
            self.default_idx = 0;
            if let Err(err) = self.dump(ctx, RTM_GETLINK) {
                warn!("netlink: link dump failed: {err}");
            }
        }
        if let Err(err) = self.dump(ctx, RTM_GETROUTE) {
            warn!("netlink: route dump failed: {err}");
        }
        if all {
            ctx.schedule_step();
        }
    }

    fn dump(&mut self, ctx: &mut InitCtx, msg_type: u16) -> Result<(), NetlinkError> {
        // A fresh blocking socket keeps the dump separate from the
        // multicast stream.
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )
        .map_err(NetlinkError::Socket)?;

        let request = build_dump_request(msg_type);
        send(fd.as_raw_fd(), &request, MsgFlags::empty()).map_err(NetlinkError::Resync)?;

        let mut buf = [0u8; NL_BUFSZ];
        loop {
            let len = match recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                Ok(0) => break,
                Ok(len) => len,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(NetlinkError::Resync(err)),
            };

            let events = parse_events(&buf[..len]);
            let done = events.contains(&NlEvent::Done);
            for event in events {
                if let NlEvent::KernelError(errno) = event {
                    return Err(NetlinkError::Kernel(Errno::from_raw(errno)));
                }
                self.apply(ctx, event);
            }
            if done {
                break;
            }
        }
        Ok(())
    }
}

fn build_dump_request(msg_type: u16) -> Vec<u8> {
    let payload_len = match msg_type {
        RTM_GETROUTE => RTMSG_LEN,
        _ => IFINFOMSG_LEN,
    };
    let total = NLMSG_HDRLEN + payload_len;

    let mut buf = vec![0u8; total];
    buf[0..4].copy_from_slice(&(total as u32).to_ne_bytes());
    buf[4..6].copy_from_slice(&msg_type.to_ne_bytes());
    buf[6..8].copy_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
    // seq and pid stay zero; the kernel echoes whatever we pick.

    match msg_type {
        RTM_GETROUTE => {
            buf[NLMSG_HDRLEN] = AF_INET;
            buf[NLMSG_HDRLEN + 4] = RT_TABLE_MAIN;
        }
        _ => {
            buf[NLMSG_HDRLEN] = AF_UNSPEC;
            // ifi_change = 0xffffffff
            buf[NLMSG_HDRLEN + 12..NLMSG_HDRLEN + 16]
                .copy_from_slice(&u32::MAX.to_ne_bytes());
        }
    }
    buf
}
