//! The path table.
//!
//! A path names one (local address, remote address) pair a subflow can run
//! over. Path index 1 is reserved for the master subflow; all other indices
//! are handed out monotonically and never reused for the lifetime of the
//! connection, so a path mask bit always means the same pair.

use std::net::SocketAddr;

use tracing::debug;

use mpt_core::{pi_flag, AddressEntry};

use crate::addr_set::AddressSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub loc: AddressEntry,
    pub rem: AddressEntry,
    pub path_index: u32,
}

fn ports_compatible(a: u16, b: u16) -> bool {
    a == 0 || b == 0 || a == b
}

#[derive(Debug, Default)]
pub struct PathTable {
    paths: Vec<Path>,
}

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter()
    }

    pub fn by_index(&self, path_index: u32) -> Option<&Path> {
        self.paths.iter().find(|p| p.path_index == path_index)
    }

    /// Finds a path by address ids, treating port 0 as a wildcard on either
    /// side.
    pub fn find(&self, loc_id: u8, rem_id: u8, loc_port: u16, rem_port: u16) -> Option<&Path> {
        self.paths.iter().find(|p| {
            p.loc.id == loc_id
                && p.rem.id == rem_id
                && ports_compatible(p.loc.port, loc_port)
                && ports_compatible(p.rem.port, rem_port)
        })
    }

    fn find_mut(
        &mut self,
        loc_id: u8,
        rem_id: u8,
        loc_port: u16,
        rem_port: u16,
    ) -> Option<&mut Path> {
        self.paths.iter_mut().find(|p| {
            p.loc.id == loc_id
                && p.rem.id == rem_id
                && ports_compatible(p.loc.port, loc_port)
                && ports_compatible(p.rem.port, rem_port)
        })
    }

    /// Writes the ports a subflow actually bound and connected to back
    /// into its path, so later rebuilds keep matching it.
    pub fn commit_ports(&mut self, path_index: u32, loc_port: u16, rem_port: u16) {
        if let Some(p) = self.paths.iter_mut().find(|p| p.path_index == path_index) {
            p.loc.port = loc_port;
            p.rem.port = rem_port;
        }
    }

    /// Bitmask over every path index in the table, plus index 1 for the
    /// master.
    pub fn indices_mask(&self) -> u32 {
        self.paths.iter().fold(pi_flag(1), |mask, p| mask | pi_flag(p.path_index))
    }

    /// Port-diversity construction: `ndiffports - 1` paths over the master
    /// address pair with kernel-chosen local ports. Seeded once; later
    /// calls are no-ops.
    pub fn seed_ndiffports(
        &mut self,
        master_local: SocketAddr,
        master_remote: SocketAddr,
        ndiffports: u32,
        next_unused_pi: &mut u32,
    ) {
        if !self.paths.is_empty() {
            return;
        }
        for _ in 1..ndiffports {
            let path_index = *next_unused_pi;
            *next_unused_pi += 1;
            self.paths.push(Path {
                loc: AddressEntry::new(0, master_local.ip(), 0),
                rem: AddressEntry::new(0, master_remote.ip(), master_remote.port()),
                path_index,
            });
        }
        debug!(paths = self.paths.len(), "seeded port-diversity path set");
    }

    /// Multi-address construction: the cartesian product of the two
    /// inventories (each extended with its ULID), minus the master pair
    /// itself. A recomputed path reuses the index of a matching existing
    /// path; everything else gets a fresh index.
    pub fn rebuild(
        &mut self,
        local: &AddressSet,
        remote: &AddressSet,
        master_local: SocketAddr,
        master_remote: SocketAddr,
        next_unused_pi: &mut u32,
    ) {
        let loc_ulid = AddressEntry::new(0, master_local.ip(), 0);
        let rem_ulid = AddressEntry::new(0, master_remote.ip(), master_remote.port());

        let mut fresh = Vec::new();

        // ULID source with every advertised destination.
        for rem in remote.iter() {
            self.push_pair(&mut fresh, loc_ulid, *rem, master_remote, next_unused_pi);
        }
        // Every local address toward the ULID destination.
        for loc in local.iter() {
            self.push_pair(&mut fresh, *loc, rem_ulid, master_remote, next_unused_pi);
        }
        // All remaining combinations.
        for loc in local.iter() {
            for rem in remote.iter() {
                self.push_pair(&mut fresh, *loc, *rem, master_remote, next_unused_pi);
            }
        }

        debug!(paths = fresh.len(), next_pi = *next_unused_pi, "path table rebuilt");
        self.paths = fresh;
    }

    fn push_pair(
        &mut self,
        fresh: &mut Vec<Path>,
        loc: AddressEntry,
        rem: AddressEntry,
        master_remote: SocketAddr,
        next_unused_pi: &mut u32,
    ) {
        // Subflows cannot cross address families.
        if loc.addr.is_ipv4() != rem.addr.is_ipv4() {
            return;
        }
        if let Some(existing) = self.find_mut(loc.id, rem.id, loc.port, rem.port) {
            // Keep the index and any committed ports, but refresh the
            // addresses from the inventories: a NAT update may have
            // rewritten the entry behind an unchanged id.
            fresh.push(Path {
                loc: AddressEntry::new(loc.id, loc.addr, existing.loc.port),
                rem: AddressEntry::new(rem.id, rem.addr, existing.rem.port),
                path_index: existing.path_index,
            });
            return;
        }
        let rem_port = if rem.port != 0 { rem.port } else { master_remote.port() };
        let path_index = *next_unused_pi;
        *next_unused_pi += 1;
        fresh.push(Path {
            loc: AddressEntry::new(loc.id, loc.addr, 0),
            rem: AddressEntry::new(rem.id, rem.addr, rem_port),
            path_index,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn sets(local: &[&str], remote: &[&str]) -> (AddressSet, AddressSet) {
        let mut loc = AddressSet::new();
        loc.commit_scan(local.iter().map(|s| ip(s)));
        let mut rem = AddressSet::new();
        for (i, s) in remote.iter().enumerate() {
            rem.add_received(ip(s), 0, (i + 1) as u8);
        }
        (loc, rem)
    }

    #[test]
    fn test_cartesian_product_counts() {
        let (loc, rem) = sets(&["10.0.1.2"], &["192.0.2.8"]);
        let mut table = PathTable::new();
        let mut next_pi = 2;
        table.rebuild(&loc, &rem, "10.0.1.1:33000".parse().unwrap(), "192.0.2.1:80".parse().unwrap(), &mut next_pi);
        // (1 local + ulid) x (1 remote + ulid) - master pair = 3.
        assert_eq!(table.len(), 3);
        assert_eq!(next_pi, 5);
    }

    #[test]
    fn test_rebuild_preserves_indices() {
        let (loc, rem) = sets(&["10.0.1.2"], &["192.0.2.8"]);
        let master_local = "10.0.1.1:33000".parse().unwrap();
        let master_remote = "192.0.2.1:80".parse().unwrap();
        let mut table = PathTable::new();
        let mut next_pi = 2;
        table.rebuild(&loc, &rem, master_local, master_remote, &mut next_pi);
        let before: Vec<(u8, u8, u32)> =
            table.iter().map(|p| (p.loc.id, p.rem.id, p.path_index)).collect();

        // A second remote address appears; old pairs keep their indices.
        let mut rem2 = AddressSet::new();
        rem2.add_received(ip("192.0.2.8"), 0, 1);
        rem2.add_received(ip("192.0.2.9"), 0, 2);
        table.rebuild(&loc, &rem2, master_local, master_remote, &mut next_pi);

        for (loc_id, rem_id, pi) in before {
            let p = table.find(loc_id, rem_id, 0, 0).unwrap();
            assert_eq!(p.path_index, pi);
        }
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_remote_port_defaults_to_master() {
        let (loc, rem) = sets(&[], &["192.0.2.8"]);
        let mut table = PathTable::new();
        let mut next_pi = 2;
        table.rebuild(&loc, &rem, "10.0.1.1:33000".parse().unwrap(), "192.0.2.1:8080".parse().unwrap(), &mut next_pi);
        assert_eq!(table.iter().next().unwrap().rem.port, 8080);
    }

    #[test]
    fn test_ndiffports_seeded_once() {
        let mut table = PathTable::new();
        let mut next_pi = 2;
        let local = "10.0.0.1:33000".parse().unwrap();
        let remote = "192.0.2.1:80".parse().unwrap();
        table.seed_ndiffports(local, remote, 3, &mut next_pi);
        assert_eq!(table.len(), 2);
        assert_eq!(next_pi, 4);
        for p in table.iter() {
            assert_eq!(p.loc.port, 0);
            assert_eq!(p.rem.port, 80);
        }
        // Second call must not regenerate.
        table.seed_ndiffports(local, remote, 5, &mut next_pi);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_indices_mask_includes_master() {
        let mut table = PathTable::new();
        let mut next_pi = 2;
        table.seed_ndiffports(
            "10.0.0.1:33000".parse().unwrap(),
            "192.0.2.1:80".parse().unwrap(),
            2,
            &mut next_pi,
        );
        assert_eq!(table.indices_mask(), 0b11);
    }

    #[test]
    fn test_wildcard_port_match() {
        let (loc, rem) = sets(&["10.0.1.2"], &["192.0.2.8"]);
        let mut table = PathTable::new();
        let mut next_pi = 2;
        table.rebuild(&loc, &rem, "10.0.1.1:33000".parse().unwrap(), "192.0.2.1:80".parse().unwrap(), &mut next_pi);
        let pi = table.find(1, 1, 0, 0).unwrap().path_index;
        // A concrete local port still matches the wildcard path.
        assert_eq!(table.find(1, 1, 40000, 80).unwrap().path_index, pi);
        table.commit_ports(pi, 40000, 80);
        // But a different local port no longer does.
        assert!(table.find(1, 1, 40001, 80).is_none());
    }
}
