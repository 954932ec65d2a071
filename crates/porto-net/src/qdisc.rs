//! Qdisc, class and filter binding.
//!
//! The shapes mirror the kernel's htb objects: one root qdisc per link,
//! one class per container, one cgroup classifier per parent class.
//! Creation treats an already-existing object as success and removal
//! treats an absent one as success, so rebinding after a daemon restart
//! needs no existence probes.

use std::mem;

use porto_error::{PortoError, Result};

use crate::netlink::{
    NetlinkSocket, TcMsg, TcRequest, NLM_F_CREATE, NLM_F_EXCL, RTM_DELQDISC, RTM_DELTCLASS,
    RTM_DELTFILTER, RTM_NEWQDISC, RTM_NEWTCLASS, RTM_NEWTFILTER, TCA_HTB_INIT, TCA_HTB_PARMS,
    TCA_HTB_CTAB, TCA_HTB_RTAB, TCA_KIND, TCA_OPTIONS, TC_H_ROOT,
};
use crate::{root_handle, tc_handle, TC_DEFAULT_MINOR};

/// ETH_P_ALL in network byte order, as tcm_info expects for filters.
const ETH_P_ALL_BE: u32 = 0x0300;
/// Priority of the cgroup classifier filter.
const FILTER_PRIO: u32 = 10;

/// MTU assumed when sizing htb rate tables.
const RATE_TABLE_MTU: u32 = 1600;
/// Microseconds per second, the time unit of htb rate tables.
const TIME_UNITS_PER_SEC: u64 = 1_000_000;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct TcRateSpec {
    cell_log: u8,
    linklayer: u8,
    overhead: u16,
    cell_align: i16,
    mpu: u16,
    rate: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct TcHtbOpt {
    rate: TcRateSpec,
    ceil: TcRateSpec,
    buffer: u32,
    cbuffer: u32,
    quantum: u32,
    level: u32,
    prio: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct TcHtbGlob {
    version: u32,
    rate2quantum: u32,
    defcls: u32,
    debug: u32,
    direct_pkts: u32,
}

fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>()) }
}

/// Time to transmit `size` bytes at `rate` bytes/sec, in usec ticks.
fn xmit_time(rate: u64, size: u64) -> u32 {
    let t = TIME_UNITS_PER_SEC.saturating_mul(size) / rate.max(1);
    u32::try_from(t).unwrap_or(u32::MAX)
}

/// Computes the 256-slot transmission-time table the kernel expects for
/// an htb rate.
fn rate_table(spec: &mut TcRateSpec) -> Vec<u8> {
    let mut cell_log = 0u8;
    while (RATE_TABLE_MTU >> cell_log) >= 256 {
        cell_log += 1;
    }
    spec.cell_log = cell_log;

    let mut table = Vec::with_capacity(256 * 4);
    for i in 0u64..256 {
        let size = (i + 1) << cell_log;
        table.extend_from_slice(&xmit_time(u64::from(spec.rate), size).to_ne_bytes());
    }
    table
}

/// A resolved network link.
#[derive(Debug, Clone)]
pub struct Link {
    pub name: String,
    pub index: u32,
}

/// The set of links traffic control is bound to.
///
/// A disabled network carries no links and turns every binder operation
/// into a successful no-op.
pub struct Network {
    links: Vec<Link>,
    enabled: bool,
}

impl Network {
    /// A network with traffic control disabled.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            links: Vec::new(),
            enabled: false,
        }
    }

    /// Resolves the configured devices.
    ///
    /// # Errors
    ///
    /// Returns an error if any configured device does not exist.
    pub fn open(devices: &[String]) -> Result<Self> {
        let mut links = Vec::with_capacity(devices.len());
        for name in devices {
            let index = NetlinkSocket::ifindex(name)?;
            links.push(Link {
                name: name.clone(),
                index,
            });
        }
        Ok(Self {
            links,
            enabled: true,
        })
    }

    /// Whether traffic control is active.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Links under management.
    #[must_use]
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    fn for_each_link(
        &self,
        op: impl Fn(&mut NetlinkSocket, &Link) -> Result<()>,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut sock = NetlinkSocket::new()?;
        for link in &self.links {
            op(&mut sock, link)?;
        }
        Ok(())
    }
}

fn accept_errno(
    outcome: std::result::Result<(), i32>,
    accepted: &[i32],
    what: &str,
    link: &Link,
) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(errno) if accepted.contains(&errno) => Ok(()),
        Err(errno) => Err(PortoError::unknown(format!(
            "{what} on {}: {}",
            link.name,
            std::io::Error::from_raw_os_error(errno)
        ))),
    }
}

/// Root htb qdisc of a link.
#[derive(Debug, Clone, Copy)]
pub struct Qdisc {
    handle: u32,
    default_minor: u32,
}

impl Qdisc {
    /// The daemon's root qdisc with the standard default class.
    #[must_use]
    pub const fn root() -> Self {
        Self {
            handle: root_handle(),
            default_minor: TC_DEFAULT_MINOR,
        }
    }

    /// Qdisc handle.
    #[must_use]
    pub const fn handle(&self) -> u32 {
        self.handle
    }

    /// Installs the qdisc on every link. Existing qdiscs are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the qdisc.
    pub fn create(&self, net: &Network) -> Result<()> {
        net.for_each_link(|sock, link| {
            tracing::debug!(link = %link.name, handle = self.handle, "create htb qdisc");
            let mut req = TcRequest::new(TcMsg::new(
                link.index as i32,
                self.handle,
                TC_H_ROOT,
                0,
            ));
            req.attr_string(TCA_KIND, "htb");
            let nest = req.nest_open(TCA_OPTIONS);
            let glob = TcHtbGlob {
                version: 3,
                rate2quantum: 10,
                defcls: self.default_minor,
                debug: 0,
                direct_pkts: 0,
            };
            req.attr_bytes(TCA_HTB_INIT, as_bytes(&glob));
            req.nest_close(nest);

            let outcome = sock.request(RTM_NEWQDISC, NLM_F_CREATE | NLM_F_EXCL, req)?;
            accept_errno(outcome, &[libc::EEXIST], "can't create qdisc", link)
        })
    }

    /// Removes the qdisc from every link. An absent qdisc is a success.
    ///
    /// # Errors
    ///
    /// Returns an error on unexpected kernel refusals.
    pub fn remove(&self, net: &Network) -> Result<()> {
        net.for_each_link(|sock, link| {
            tracing::debug!(link = %link.name, handle = self.handle, "remove htb qdisc");
            let req = TcRequest::new(TcMsg::new(link.index as i32, self.handle, TC_H_ROOT, 0));
            let outcome = sock.request(RTM_DELQDISC, 0, req)?;
            accept_errno(
                outcome,
                &[libc::ENOENT, libc::EINVAL],
                "can't remove qdisc",
                link,
            )
        })
    }
}

/// One htb class, rate-limited per the owning container's properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcClass {
    parent: u32,
    handle: u32,
}

impl TcClass {
    /// A class under `parent` with the given handle.
    #[must_use]
    pub const fn new(parent: u32, handle: u32) -> Self {
        Self { parent, handle }
    }

    /// The default class of the root qdisc.
    #[must_use]
    pub const fn default_class() -> Self {
        Self {
            parent: root_handle(),
            handle: tc_handle(crate::TC_ROOT_MAJOR, TC_DEFAULT_MINOR),
        }
    }

    /// Class handle.
    #[must_use]
    pub const fn handle(&self) -> u32 {
        self.handle
    }

    /// Creates or updates the class on every link.
    ///
    /// `rate` is the guaranteed bytes/sec, `ceil` the borrowing limit;
    /// zero means an effectively unlimited ceiling.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the class.
    pub fn create(&self, net: &Network, prio: u32, rate: u64, ceil: u64) -> Result<()> {
        let rate = rate.max(1);
        let ceil = if ceil == 0 { u64::from(u32::MAX) } else { ceil };

        net.for_each_link(|sock, link| {
            tracing::debug!(
                link = %link.name,
                handle = self.handle,
                rate,
                ceil,
                "create htb class"
            );
            let mut req = TcRequest::new(TcMsg::new(
                link.index as i32,
                self.handle,
                self.parent,
                0,
            ));
            req.attr_string(TCA_KIND, "htb");

            let mut rate_spec = TcRateSpec {
                rate: u32::try_from(rate).unwrap_or(u32::MAX),
                ..Default::default()
            };
            let mut ceil_spec = TcRateSpec {
                rate: u32::try_from(ceil).unwrap_or(u32::MAX),
                ..Default::default()
            };
            let rtab = rate_table(&mut rate_spec);
            let ctab = rate_table(&mut ceil_spec);

            let opt = TcHtbOpt {
                rate: rate_spec,
                ceil: ceil_spec,
                buffer: xmit_time(rate, u64::from(RATE_TABLE_MTU)),
                cbuffer: xmit_time(ceil, u64::from(RATE_TABLE_MTU)),
                quantum: 0,
                level: 0,
                prio,
            };

            let nest = req.nest_open(TCA_OPTIONS);
            req.attr_bytes(TCA_HTB_PARMS, as_bytes(&opt));
            req.attr_bytes(TCA_HTB_RTAB, &rtab);
            req.attr_bytes(TCA_HTB_CTAB, &ctab);
            req.nest_close(nest);

            let outcome = sock.request(RTM_NEWTCLASS, NLM_F_CREATE, req)?;
            accept_errno(outcome, &[], "can't create class", link)
        })
    }

    /// Removes the class from every link. An absent class is a success.
    ///
    /// # Errors
    ///
    /// Returns an error on unexpected kernel refusals.
    pub fn remove(&self, net: &Network) -> Result<()> {
        net.for_each_link(|sock, link| {
            tracing::debug!(link = %link.name, handle = self.handle, "remove htb class");
            let req = TcRequest::new(TcMsg::new(link.index as i32, self.handle, self.parent, 0));
            let outcome = sock.request(RTM_DELTCLASS, 0, req)?;
            accept_errno(
                outcome,
                &[libc::ENOENT, libc::EINVAL],
                "can't remove class",
                link,
            )
        })
    }
}

/// Cgroup classifier filter directing tagged traffic into classes.
#[derive(Debug, Clone, Copy)]
pub struct CgFilter {
    parent: u32,
}

impl CgFilter {
    /// A filter attached under `parent`.
    #[must_use]
    pub const fn new(parent: u32) -> Self {
        Self { parent }
    }

    /// Installs the filter on every link.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the filter.
    pub fn create(&self, net: &Network) -> Result<()> {
        net.for_each_link(|sock, link| {
            tracing::debug!(link = %link.name, parent = self.parent, "create cgroup filter");
            let mut req = TcRequest::new(TcMsg::new(
                link.index as i32,
                1,
                self.parent,
                (FILTER_PRIO << 16) | ETH_P_ALL_BE,
            ));
            req.attr_string(TCA_KIND, "cgroup");

            let outcome = sock.request(RTM_NEWTFILTER, NLM_F_CREATE | NLM_F_EXCL, req)?;
            accept_errno(outcome, &[libc::EEXIST], "can't create filter", link)
        })
    }

    /// Removes the filter from every link. An absent filter is a success.
    ///
    /// # Errors
    ///
    /// Returns an error on unexpected kernel refusals.
    pub fn remove(&self, net: &Network) -> Result<()> {
        net.for_each_link(|sock, link| {
            tracing::debug!(link = %link.name, parent = self.parent, "remove cgroup filter");
            let req = TcRequest::new(TcMsg::new(
                link.index as i32,
                1,
                self.parent,
                (FILTER_PRIO << 16) | ETH_P_ALL_BE,
            ));
            let outcome = sock.request(RTM_DELTFILTER, 0, req)?;
            accept_errno(
                outcome,
                &[libc::ENOENT, libc::EINVAL],
                "can't remove filter",
                link,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_network_is_noop() {
        let net = Network::disabled();
        assert!(!net.enabled());

        Qdisc::root().create(&net).unwrap();
        TcClass::default_class().create(&net, 3, 0, 0).unwrap();
        CgFilter::new(root_handle()).create(&net).unwrap();
        TcClass::default_class().remove(&net).unwrap();
        Qdisc::root().remove(&net).unwrap();
    }

    #[test]
    fn rate_table_has_256_slots() {
        let mut spec = TcRateSpec {
            rate: 125_000, // 1 mbit
            ..Default::default()
        };
        let table = rate_table(&mut spec);
        assert_eq!(table.len(), 256 * 4);
        // 1600-byte MTU needs cells of 8 bytes to fit 256 slots.
        assert_eq!(spec.cell_log, 3);
    }

    #[test]
    fn xmit_time_is_monotonic_in_size() {
        let fast = xmit_time(1_000_000, 1500);
        let slow = xmit_time(1_000_000, 3000);
        assert!(slow > fast);
        // Zero rate must not divide by zero.
        assert_eq!(xmit_time(0, 1500), u32::MAX.min(xmit_time(1, 1500)));
    }

    #[test]
    fn default_class_sits_under_root() {
        let class = TcClass::default_class();
        assert_eq!(class.handle(), tc_handle(1, 2));
    }
}
