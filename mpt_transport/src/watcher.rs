//! Network interface enumeration and UP/DOWN watching.
//!
//! The engine consumes addresses through the [`AddressEnumerator`]
//! contract; the [`InterfaceWatcher`] polls it periodically and publishes
//! the usable address set, from which UP/DOWN events are diffed and fanned
//! out to every connection.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::error;

/// One address as reported by the interface layer, with the scope bits the
/// filtering policy needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedAddr {
    pub addr: IpAddr,
    pub loopback: bool,
    pub link_local: bool,
}

/// An address appeared or disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressEvent {
    Up(IpAddr),
    Down(IpAddr),
}

impl AddressEvent {
    pub fn addr(&self) -> IpAddr {
        match self {
            AddressEvent::Up(a) | AddressEvent::Down(a) => *a,
        }
    }
}

/// Contract of the interface layer.
pub trait AddressEnumerator: Send + Sync {
    fn enumerate(&self) -> Vec<ScannedAddr>;
}

/// Enumerates the host's interfaces.
pub struct SystemEnumerator;

impl AddressEnumerator for SystemEnumerator {
    fn enumerate(&self) -> Vec<ScannedAddr> {
        match if_addrs::get_if_addrs() {
            Ok(ifaces) => ifaces
                .into_iter()
                .map(|iface| {
                    let addr = iface.addr.ip();
                    ScannedAddr {
                        addr,
                        loopback: iface.is_loopback(),
                        link_local: is_link_local(addr),
                    }
                })
                .collect(),
            Err(err) => {
                error!(%err, "failed to scan interfaces");
                Vec::new()
            }
        }
    }
}

fn is_link_local(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Addresses a subflow may actually run over: no loopback, no link-local
/// or host-scope entries.
pub fn usable(addrs: impl IntoIterator<Item = ScannedAddr>) -> Vec<IpAddr> {
    addrs
        .into_iter()
        .filter(|a| !a.loopback && !a.link_local)
        .map(|a| a.addr)
        .collect()
}

/// Diffs two published address sets into UP/DOWN events.
pub fn diff_events(old: &[IpAddr], new: &[IpAddr]) -> Vec<AddressEvent> {
    let mut events = Vec::new();
    for addr in new {
        if !old.contains(addr) {
            events.push(AddressEvent::Up(*addr));
        }
    }
    for addr in old {
        if !new.contains(addr) {
            events.push(AddressEvent::Down(*addr));
        }
    }
    events
}

/// Periodically rescans the interfaces and publishes the usable address
/// set on a watch channel.
pub struct InterfaceWatcher {
    #[allow(dead_code)]
    stop_tx: watch::Sender<bool>,
    addresses: watch::Receiver<Vec<IpAddr>>,
}

impl InterfaceWatcher {
    pub fn spawn(enumerator: Arc<dyn AddressEnumerator>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (addr_tx, addr_rx) = watch::channel(Vec::new());

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let scanned = usable(enumerator.enumerate());
                        if *addr_tx.borrow() != scanned {
                            let _ = addr_tx.send(scanned);
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });

        Self { stop_tx, addresses: addr_rx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<IpAddr>> {
        self.addresses.clone()
    }
}
