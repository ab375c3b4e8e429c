use std::time::Duration;

/// Engine configuration.
///
/// The knobs mirror the classic sysctl surface: `enabled`, `ndiffports`,
/// `checksum`, `mss` and the scheduler selector.
#[derive(Debug, Clone)]
pub struct MptcpConfig {
    /// When false, every new connection falls back to plain TCP at SYN
    /// time.
    pub enabled: bool,
    /// When greater than 1, paths are built over the master address pair
    /// with this many distinct local ports instead of over the address
    /// inventories.
    pub ndiffports: u32,
    /// Require DSS checksums.
    pub checksum: bool,
    /// Default MSS for meta-sends. Subflows with a lower MSS are simply
    /// not used.
    pub mss: u16,
    /// Index into the scheduler table (1-based, as the sysctl was).
    pub scheduler: usize,
    /// How long a pending JOIN may stay half-open.
    pub join_timeout: Duration,
    /// Initial meta receive buffer, before subflow contributions are
    /// summed in.
    pub rcvbuf: usize,
    /// Initial meta send buffer.
    pub sndbuf: usize,
}

impl Default for MptcpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ndiffports: 1,
            checksum: true,
            mss: 1400,
            scheduler: 1,
            join_timeout: Duration::from_secs(3),
            rcvbuf: 256 * 1024,
            sndbuf: 256 * 1024,
        }
    }
}

impl MptcpConfig {
    pub fn builder() -> MptcpConfigBuilder {
        MptcpConfigBuilder::default()
    }
}

/// Builder for [`MptcpConfig`].
#[derive(Debug, Default)]
pub struct MptcpConfigBuilder {
    enabled: Option<bool>,
    ndiffports: Option<u32>,
    checksum: Option<bool>,
    mss: Option<u16>,
    scheduler: Option<usize>,
    join_timeout: Option<Duration>,
    rcvbuf: Option<usize>,
    sndbuf: Option<usize>,
}

impl MptcpConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn ndiffports(mut self, n: u32) -> Self {
        self.ndiffports = Some(n.max(1));
        self
    }

    pub fn checksum(mut self, checksum: bool) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn mss(mut self, mss: u16) -> Self {
        self.mss = Some(mss);
        self
    }

    pub fn scheduler(mut self, index: usize) -> Self {
        self.scheduler = Some(index);
        self
    }

    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = Some(timeout);
        self
    }

    pub fn rcvbuf(mut self, bytes: usize) -> Self {
        self.rcvbuf = Some(bytes);
        self
    }

    pub fn sndbuf(mut self, bytes: usize) -> Self {
        self.sndbuf = Some(bytes);
        self
    }

    pub fn build(self) -> MptcpConfig {
        let default = MptcpConfig::default();
        MptcpConfig {
            enabled: self.enabled.unwrap_or(default.enabled),
            ndiffports: self.ndiffports.unwrap_or(default.ndiffports),
            checksum: self.checksum.unwrap_or(default.checksum),
            mss: self.mss.unwrap_or(default.mss),
            scheduler: self.scheduler.unwrap_or(default.scheduler),
            join_timeout: self.join_timeout.unwrap_or(default.join_timeout),
            rcvbuf: self.rcvbuf.unwrap_or(default.rcvbuf),
            sndbuf: self.sndbuf.unwrap_or(default.sndbuf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MptcpConfig::default();
        assert!(config.enabled);
        assert_eq!(config.ndiffports, 1);
        assert!(config.checksum);
        assert_eq!(config.mss, 1400);
        assert_eq!(config.scheduler, 1);
    }

    #[test]
    fn test_builder_overrides() {
        let config = MptcpConfig::builder()
            .ndiffports(4)
            .checksum(false)
            .mss(1200)
            .build();
        assert_eq!(config.ndiffports, 4);
        assert!(!config.checksum);
        assert_eq!(config.mss, 1200);
        // Untouched fields keep their defaults.
        assert!(config.enabled);
    }

    #[test]
    fn test_ndiffports_floor() {
        let config = MptcpConfig::builder().ndiffports(0).build();
        assert_eq!(config.ndiffports, 1);
    }
}
