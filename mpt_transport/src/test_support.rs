//! In-memory subflow double used by unit tests across the crate.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::subflow::{SubflowIo, SubflowMetrics, TcpState, WireSegment};

/// A scripted subflow: records everything sent, with adjustable metrics.
pub(crate) struct FakeIo {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub sent: Mutex<Vec<WireSegment>>,
    pub metrics: Mutex<SubflowMetrics>,
    pub reset_called: Mutex<bool>,
    pub close_called: Mutex<bool>,
}

impl FakeIo {
    pub fn new(local: &str, remote: &str) -> Arc<Self> {
        Arc::new(Self {
            local: local.parse().unwrap(),
            remote: remote.parse().unwrap(),
            sent: Mutex::new(Vec::new()),
            metrics: Mutex::new(SubflowMetrics {
                srtt: Duration::from_millis(20),
                snd_cwnd: 64 * 1400,
                in_flight: 0,
                state: TcpState::Established,
                rcv_mss: 1400,
                in_loss_recovery: false,
                sndbuf: 128 * 1024,
                rcvbuf: 128 * 1024,
                window_clamp: 64 * 1024,
                rcv_ssthresh: 64 * 1024,
            }),
            reset_called: Mutex::new(false),
            close_called: Mutex::new(false),
        })
    }

    pub fn with_srtt(local: &str, remote: &str, srtt: Duration) -> Arc<Self> {
        let io = Self::new(local, remote);
        io.metrics.lock().unwrap().srtt = srtt;
        io
    }

    pub fn sent_segments(&self) -> Vec<WireSegment> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_payload_len(&self) -> usize {
        self.sent.lock().unwrap().iter().map(|w| w.payload.len()).sum()
    }

    pub fn was_reset(&self) -> bool {
        *self.reset_called.lock().unwrap()
    }
}

impl SubflowIo for FakeIo {
    fn send_segment(&self, segment: WireSegment) -> std::io::Result<()> {
        self.sent.lock().unwrap().push(segment);
        Ok(())
    }

    fn close(&self) {
        *self.close_called.lock().unwrap() = true;
    }

    fn reset(&self) {
        *self.reset_called.lock().unwrap() = true;
    }

    fn metrics(&self) -> SubflowMetrics {
        *self.metrics.lock().unwrap()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}
