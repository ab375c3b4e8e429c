//! Shared harness for the end-to-end scenarios: a scripted subflow double
//! and a two-endpoint network that shuttles wire segments between the
//! client and server control blocks.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;

use mpt_core::{Dss, MptcpOption};
use mpt_transport::config::MptcpConfig;
use mpt_transport::mpcb::Mpcb;
use mpt_transport::stack::MptcpStack;
use mpt_transport::subflow::{SubflowDelivery, SubflowIo, SubflowMetrics, TcpState, WireSegment};

/// In-memory subflow double. Sent segments accumulate until the harness
/// takes them; `in_flight` grows with every send and clears when taken,
/// standing in for subflow-level acknowledgment.
pub struct ScriptIo {
    local: SocketAddr,
    remote: SocketAddr,
    sent: Mutex<Vec<WireSegment>>,
    total_payload: Mutex<usize>,
    metrics: Mutex<SubflowMetrics>,
    reset_called: Mutex<bool>,
    close_called: Mutex<bool>,
}

impl ScriptIo {
    pub fn new(local: &str, remote: &str) -> Arc<Self> {
        Arc::new(Self {
            local: local.parse().unwrap(),
            remote: remote.parse().unwrap(),
            sent: Mutex::new(Vec::new()),
            total_payload: Mutex::new(0),
            metrics: Mutex::new(SubflowMetrics {
                srtt: Duration::from_millis(20),
                snd_cwnd: 256 * 1400,
                in_flight: 0,
                state: TcpState::Established,
                rcv_mss: 1400,
                in_loss_recovery: false,
                sndbuf: 128 * 1024,
                rcvbuf: 512 * 1024,
                window_clamp: 256 * 1024,
                rcv_ssthresh: 256 * 1024,
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

    /// Drains the recorded segments, clearing in-flight accounting.
    pub fn take_sent(&self) -> Vec<WireSegment> {
        let mut metrics = self.metrics.lock().unwrap();
        metrics.in_flight = 0;
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn sent_payload_len(&self) -> usize {
        self.sent.lock().unwrap().iter().map(|w| w.payload.len()).sum()
    }

    /// Payload bytes ever sent over this subflow.
    pub fn total_payload(&self) -> usize {
        *self.total_payload.lock().unwrap()
    }

    pub fn set_state(&self, state: TcpState) {
        self.metrics.lock().unwrap().state = state;
    }

    pub fn set_srtt(&self, srtt: Duration) {
        self.metrics.lock().unwrap().srtt = srtt;
    }

    pub fn set_cwnd(&self, cwnd: u32) {
        self.metrics.lock().unwrap().snd_cwnd = cwnd;
    }

    pub fn was_reset(&self) -> bool {
        *self.reset_called.lock().unwrap()
    }

    pub fn was_closed(&self) -> bool {
        *self.close_called.lock().unwrap()
    }
}

impl SubflowIo for ScriptIo {
    fn send_segment(&self, segment: WireSegment) -> std::io::Result<()> {
        self.metrics.lock().unwrap().in_flight += segment.payload.len() as u32;
        *self.total_payload.lock().unwrap() += segment.payload.len();
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

/// Converts a sent segment into a delivery, pushing the options through
/// their wire encoding on the way: the real subflow layer hands us bytes
/// out of the TCP header, not structs.
pub fn delivery(w: &WireSegment) -> SubflowDelivery {
    let mut raw = bytes::BytesMut::new();
    for opt in &w.options {
        opt.encode(&mut raw);
    }
    SubflowDelivery {
        seq: w.seq,
        payload: w.payload.clone(),
        fin: w.fin,
        options: mpt_core::options::parse_run(&raw),
    }
}

/// One subflow pair between the endpoints.
pub struct Link {
    pub a_io: Arc<ScriptIo>,
    pub b_io: Arc<ScriptIo>,
    pub a_pi: u32,
    pub b_pi: u32,
}

/// A client/server pair wired through scripted subflows.
pub struct TestNet {
    pub client: Arc<MptcpStack>,
    pub server: Arc<MptcpStack>,
    pub a: Arc<Mpcb>,
    pub b: Arc<Mpcb>,
    pub links: Vec<Link>,
}

pub const CLIENT_ADDR1: &str = "10.0.0.1:40001";
pub const CLIENT_ADDR2: &str = "10.0.1.1:40002";
pub const SERVER_ADDR: &str = "192.0.2.1:80";

/// Runs the full CAPABLE handshake over the master pair.
pub fn establish(config: MptcpConfig) -> Result<TestNet> {
    let client = MptcpStack::new(config.clone());
    let server = MptcpStack::new(config);

    let a_io = ScriptIo::with_srtt(CLIENT_ADDR1, SERVER_ADDR, Duration::from_millis(10));
    let b_io = ScriptIo::new(SERVER_ADDR, CLIENT_ADDR1);

    let a = client.connect(a_io.clone()).context("client connect")?;
    let syn = a.capable_syn();
    let b = server.accept(b_io.clone(), &[syn]).context("server accept")?;
    let synack = b.capable_synack();
    let ack = a.on_master_synack(&[synack]).context("SYN-ACK carries CAPABLE")?;
    b.on_master_ack(&[ack]).context("ACK carries CAPABLE")?;

    a.on_master_established();
    b.on_master_established();

    Ok(TestNet {
        client,
        server,
        a,
        b,
        links: vec![Link { a_io, b_io, a_pi: 1, b_pi: 1 }],
    })
}

/// Opens one JOIN subflow from `a_local` to the server and attaches it on
/// both sides.
pub fn add_join_path(net: &mut TestNet, a_local: &str) -> Result<usize> {
    let a_io = ScriptIo::with_srtt(a_local, SERVER_ADDR, Duration::from_millis(40));
    let b_io = ScriptIo::new(SERVER_ADDR, a_local);

    let a_sockaddr: SocketAddr = a_local.parse()?;
    let (syn, init) = net.a.initiate_join(a_sockaddr.ip())?;
    let synack = net
        .server
        .on_join_syn(SERVER_ADDR.parse()?, a_sockaddr, &[syn])
        .context("join SYN accepted")?
        .context("a JOIN was present")?;
    let MptcpOption::Join(synack_join) = &synack else {
        bail!("expected a JOIN SYN-ACK, got {synack:?}");
    };
    let ack = net.a.complete_join(&init, synack_join).context("SYN-ACK authenticates")?;

    let a_pi = net
        .a
        .attach_subflow(a_io.clone(), 0, 0, Vec::new())
        .context("client attach")?;
    let (_, b_pi) = net
        .server
        .on_join_ack(b_io.clone(), &[ack], 0, 0, Vec::new())
        .context("server attach")?;

    net.links.push(Link { a_io, b_io, a_pi, b_pi });
    Ok(net.links.len() - 1)
}

/// Shuttles queued wire segments in both directions until the network is
/// quiescent.
pub fn pump(net: &TestNet) {
    loop {
        let mut moved = false;
        for idx in 0..net.links.len() {
            moved |= pump_link(net, idx);
        }
        if !moved {
            break;
        }
    }
}

/// Shuttles one subflow pair only; the others keep their segments "on the
/// wire". Returns whether anything moved.
pub fn pump_link(net: &TestNet, idx: usize) -> bool {
    let link = &net.links[idx];
    let mut moved = false;
    for w in link.a_io.take_sent() {
        moved = true;
        let _ = net.b.on_subflow_delivery(link.b_pi, delivery(&w));
    }
    for w in link.b_io.take_sent() {
        moved = true;
        let _ = net.a.on_subflow_delivery(link.a_pi, delivery(&w));
    }
    if moved {
        net.a.push_pending_frames();
        net.b.push_pending_frames();
    }
    moved
}

/// Hands the client an explicit DATA_ACK for everything the server has
/// reassembled so far.
pub fn ack_from_server(net: &TestNet) {
    let ack = MptcpOption::Dss(Dss {
        data_ack: Some(net.b.rcv_nxt()),
        mapping: None,
        data_fin: false,
    });
    let _ = net.a.on_subflow_delivery(
        net.links[0].a_pi,
        SubflowDelivery { seq: 0, payload: Bytes::new(), fin: false, options: vec![ack] },
    );
    net.a.push_pending_frames();
}

/// Non-blocking read: returns what is currently available.
pub async fn try_read(mpcb: &Arc<Mpcb>, buf: &mut [u8]) -> usize {
    match tokio::time::timeout(Duration::from_millis(50), mpcb.recv(buf)).await {
        Ok(Ok(n)) => n,
        _ => 0,
    }
}

/// A deterministic payload pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
