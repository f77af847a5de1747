//! Network traffic capture and connection-policy assertions.
//!
//! The harness never decodes packets. A [`CaptureBackend`] turns frames on
//! the VM's link into [`Flow`] records; this module keeps them in an
//! append-only, time-ordered [`CapturedTraffic`] log and answers one
//! question about it: did the guest only talk to endpoints it was allowed
//! to talk to?
//!
//! A *connection* is the first frame seen for a destination
//! `(address, port)` pair. Policy assertions are exhaustive over
//! connections and report the first offender.

use crate::errors::{HarnessError, HarnessResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::io::BufRead;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other,
}

/// A destination address and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub const fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::new(self.address, self.port))
    }
}

impl FromStr for Endpoint {
    type Err = HarnessError;

    /// `1.2.3.4:443` or `[2001:db8::1]:443`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = s
            .trim()
            .parse()
            .map_err(|_| HarnessError::usage(format!("invalid endpoint '{s}', expected address:port")))?;
        Ok(Self::new(addr.ip(), addr.port()))
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl TryFrom<String> for Endpoint {
    type Error = HarnessError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One captured frame, reduced to what policy checks need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub source: IpAddr,
    pub daddr: IpAddr,
    pub dport: u16,
}

impl Flow {
    pub fn destination(&self) -> Endpoint {
        Endpoint::new(self.daddr, self.dport)
    }
}

/// First frame seen towards one destination endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub destination: Endpoint,
    pub protocol: Protocol,
    pub source: IpAddr,
    pub first_seen: DateTime<Utc>,
}

impl Connection {
    pub fn daddr(&self) -> IpAddr {
        self.destination.address
    }

    pub fn dport(&self) -> u16 {
        self.destination.port
    }
}

/// Time-ordered flow log. Sealed once the capture stops.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CapturedTraffic {
    flows: Vec<Flow>,
    sealed: bool,
}

impl CapturedTraffic {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sealed log holding `flows`, sorted by timestamp.
    pub fn from_flows(flows: impl IntoIterator<Item = Flow>) -> Self {
        let mut traffic = Self::new();
        for flow in flows {
            traffic.insert(flow);
        }
        traffic.sealed = true;
        traffic
    }

    fn insert(&mut self, flow: Flow) {
        // equal timestamps keep arrival order
        let at = self.flows.partition_point(|f| f.timestamp <= flow.timestamp);
        self.flows.insert(at, flow);
    }

    /// Append a flow. Appending to a sealed log is a usage error.
    pub fn push(&mut self, flow: Flow) -> HarnessResult<()> {
        if self.sealed {
            return Err(HarnessError::usage("cannot append to a sealed capture"));
        }
        self.insert(flow);
        Ok(())
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// One entry per destination endpoint, in order of first appearance.
    pub fn connections(&self) -> Vec<Connection> {
        let mut seen = HashSet::new();
        self.flows
            .iter()
            .filter(|flow| seen.insert(flow.destination()))
            .map(|flow| Connection {
                destination: flow.destination(),
                protocol: flow.protocol,
                source: flow.source,
                first_seen: flow.timestamp,
            })
            .collect()
    }
}

/// Read flows from JSON lines, one [`Flow`] object per line.
pub fn read_flows_jsonl(reader: impl BufRead) -> HarnessResult<CapturedTraffic> {
    let mut flows = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let flow: Flow = serde_json::from_str(&line)
            .map_err(|e| HarnessError::usage(format!("flow line {}: {e}", index + 1)))?;
        flows.push(flow);
    }
    Ok(CapturedTraffic::from_flows(flows))
}

/// Endpoints the guest may connect to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllowedHostSet {
    hosts: BTreeSet<Endpoint>,
}

impl AllowedHostSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one `address:port` per line. Blank lines and `#` comments are
    /// skipped.
    pub fn from_lines(text: &str) -> HarnessResult<Self> {
        let mut set = Self::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let endpoint = line
                .parse::<Endpoint>()
                .map_err(|_| HarnessError::usage(format!("allow-list line {}: invalid endpoint '{line}'", index + 1)))?;
            set.insert(endpoint);
        }
        Ok(set)
    }

    pub fn insert(&mut self, endpoint: Endpoint) -> bool {
        self.hosts.insert(endpoint)
    }

    pub fn remove(&mut self, endpoint: &Endpoint) -> bool {
        self.hosts.remove(endpoint)
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.hosts.contains(endpoint)
    }

    pub fn allows(&self, connection: &Connection) -> bool {
        self.contains(&connection.destination)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.hosts.iter()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl FromIterator<Endpoint> for AllowedHostSet {
    fn from_iter<I: IntoIterator<Item = Endpoint>>(iter: I) -> Self {
        Self {
            hosts: iter.into_iter().collect(),
        }
    }
}

impl Extend<Endpoint> for AllowedHostSet {
    fn extend<I: IntoIterator<Item = Endpoint>>(&mut self, iter: I) {
        self.hosts.extend(iter);
    }
}

/// Allow-lists over time.
///
/// Each entry is in force from its instant until the next one. The first
/// entry is in force since the beginning of the capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyTimeline {
    initial: AllowedHostSet,
    changes: Vec<(DateTime<Utc>, AllowedHostSet)>,
}

impl PolicyTimeline {
    pub fn new(initial: AllowedHostSet) -> Self {
        Self {
            initial,
            changes: Vec::new(),
        }
    }

    /// Record that `set` is in force from `at` on. Instants must not go
    /// backwards.
    pub fn update(&mut self, at: DateTime<Utc>, set: AllowedHostSet) -> HarnessResult<()> {
        if let Some((last, _)) = self.changes.last() {
            if at < *last {
                return Err(HarnessError::usage(format!(
                    "policy change at {at} precedes the previous change at {last}"
                )));
            }
        }
        debug!(at = %at, hosts = set.len(), "allow-list updated");
        self.changes.push((at, set));
        Ok(())
    }

    /// The policy in force at `at`.
    pub fn policy_at(&self, at: DateTime<Utc>) -> &AllowedHostSet {
        let idx = self.changes.partition_point(|(since, _)| *since <= at);
        match idx {
            0 => &self.initial,
            n => &self.changes[n - 1].1,
        }
    }

    /// The most recent policy.
    pub fn current(&self) -> &AllowedHostSet {
        self.changes.last().map_or(&self.initial, |(_, set)| set)
    }
}

fn violation(destination: Endpoint) -> HarnessError {
    HarnessError::PolicyViolation {
        address: destination.address.to_string(),
        port: destination.port,
    }
}

/// Check every connection against `allowed`; name the first offender.
pub fn assert_all_connections<P>(traffic: &CapturedTraffic, allowed: P) -> HarnessResult<()>
where
    P: Fn(&Connection) -> bool,
{
    let connections = traffic.connections();
    let offenders: Vec<&Connection> = connections.iter().filter(|c| !allowed(c)).collect();
    if let Some(first) = offenders.first() {
        warn!(
            offenders = offenders.len(),
            connections = connections.len(),
            first = %first.destination,
            "traffic policy violated"
        );
        return Err(violation(first.destination));
    }
    info!(connections = connections.len(), flows = traffic.len(), "all connections allowed");
    Ok(())
}

/// Judge each connection by the policy in force at its first frame.
pub fn assert_connections_against(traffic: &CapturedTraffic, timeline: &PolicyTimeline) -> HarnessResult<()> {
    assert_all_connections(traffic, |c| timeline.policy_at(c.first_seen).allows(c))
}

/// Judge every frame by the policy in force at its own timestamp.
///
/// Stricter than [`assert_connections_against`]: it also catches traffic to
/// an endpoint that was allowed at first contact but removed later.
pub fn assert_all_flows_against(traffic: &CapturedTraffic, timeline: &PolicyTimeline) -> HarnessResult<()> {
    match traffic
        .flows()
        .iter()
        .find(|flow| !timeline.policy_at(flow.timestamp).contains(&flow.destination()))
    {
        Some(flow) => {
            warn!(destination = %flow.destination(), at = %flow.timestamp, "frame outside the policy in force");
            Err(violation(flow.destination()))
        }
        None => Ok(()),
    }
}

/// Live capture on one link.
pub trait CaptureSession: Send {
    /// Flows captured since the previous call.
    fn drain(&mut self) -> HarnessResult<Vec<Flow>>;
    fn stop(&mut self) -> HarnessResult<()>;
}

/// Starts captures on host network links.
pub trait CaptureBackend: Send + Sync {
    fn start(&self, link: &str) -> HarnessResult<Box<dyn CaptureSession>>;
}

struct CaptureInner {
    session: Option<Box<dyn CaptureSession>>,
    traffic: CapturedTraffic,
}

impl CaptureInner {
    fn pull(&mut self) -> HarnessResult<()> {
        if let Some(session) = self.session.as_mut() {
            for flow in session.drain()? {
                self.traffic.push(flow)?;
            }
        }
        Ok(())
    }
}

/// Shared handle on one capture. Clones refer to the same capture, so the
/// scenario and its cleanup hook can both hold one.
#[derive(Clone)]
pub struct TrafficCapture {
    link: Arc<str>,
    inner: Arc<Mutex<CaptureInner>>,
}

impl fmt::Debug for TrafficCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrafficCapture")
            .field("link", &self.link)
            .field("sealed", &self.is_sealed())
            .finish_non_exhaustive()
    }
}

impl TrafficCapture {
    pub fn start(backend: &dyn CaptureBackend, link: &str) -> HarnessResult<Self> {
        let session = backend.start(link)?;
        info!(link, "traffic capture started");
        Ok(Self {
            link: Arc::from(link),
            inner: Arc::new(Mutex::new(CaptureInner {
                session: Some(session),
                traffic: CapturedTraffic::new(),
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CaptureInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().traffic.is_sealed()
    }

    /// Stop capturing and seal the log. Stopping twice is a no-op.
    ///
    /// The log is sealed even when the backend fails to hand over its last
    /// flows; that failure is still returned.
    pub fn stop(&self) -> HarnessResult<()> {
        let mut inner = self.lock();
        let Some(mut session) = inner.session.take() else {
            return Ok(());
        };
        let drained = session.drain().map(|flows| {
            for flow in flows {
                inner.traffic.insert(flow);
            }
        });
        let stopped = session.stop();
        inner.traffic.seal();
        match &drained {
            Ok(()) => info!(link = %self.link, flows = inner.traffic.len(), "traffic capture stopped"),
            Err(err) => warn!(link = %self.link, error = %err, "traffic capture stopped without its last flows"),
        }
        drained.and(stopped)
    }

    /// Drop all captured flows.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let sealed = inner.traffic.is_sealed();
        inner.traffic = CapturedTraffic::new();
        if sealed {
            inner.traffic.seal();
        }
    }

    /// Current log, including anything the backend has buffered.
    pub fn snapshot(&self) -> HarnessResult<CapturedTraffic> {
        let mut inner = self.lock();
        inner.pull()?;
        Ok(inner.traffic.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCapture;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn flow(secs: i64, daddr: [u8; 4], dport: u16) -> Flow {
        Flow {
            timestamp: at(secs),
            protocol: Protocol::Tcp,
            source: IpAddr::V4(Ipv4Addr::new(10, 2, 1, 2)),
            daddr: IpAddr::V4(Ipv4Addr::from(daddr)),
            dport,
        }
    }

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    #[test]
    fn test_connections_are_first_frame_per_endpoint() {
        let traffic = CapturedTraffic::from_flows([
            flow(3, [1, 1, 1, 1], 443),
            flow(1, [1, 1, 1, 1], 443),
            flow(2, [8, 8, 8, 8], 53),
            flow(4, [1, 1, 1, 1], 80),
        ]);
        let connections = traffic.connections();
        assert_eq!(connections.len(), 3);
        assert_eq!(connections[0].destination, ep("1.1.1.1:443"));
        assert_eq!(connections[0].first_seen, at(1));
        assert_eq!(connections[1].destination, ep("8.8.8.8:53"));
    }

    #[test]
    fn test_assert_names_first_offender() {
        let traffic = CapturedTraffic::from_flows([
            flow(1, [10, 2, 1, 1], 9050),
            flow(2, [93, 184, 216, 34], 80),
            flow(3, [1, 2, 3, 4], 443),
        ]);
        let allowed: AllowedHostSet = [ep("10.2.1.1:9050")].into_iter().collect();
        match assert_all_connections(&traffic, |c| allowed.allows(c)).unwrap_err() {
            HarnessError::PolicyViolation { address, port } => {
                assert_eq!(address, "93.184.216.34");
                assert_eq!(port, 80);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_capture_passes() {
        assert!(assert_all_connections(&CapturedTraffic::new(), |_| false).is_ok());
    }

    #[test]
    fn test_allowed_hosts_from_lines() {
        let set = AllowedHostSet::from_lines("# relays\n10.2.1.1:9050\n\n[2001:db8::1]:443 # v6\n").unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&ep("[2001:db8::1]:443")));
        let err = AllowedHostSet::from_lines("10.0.0.1\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_policy_timeline_judges_by_first_frame() {
        let mut timeline = PolicyTimeline::new(AllowedHostSet::new());
        timeline
            .update(at(10), [ep("1.1.1.1:443")].into_iter().collect())
            .unwrap();
        timeline.update(at(20), AllowedHostSet::new()).unwrap();
        assert!(timeline.update(at(15), AllowedHostSet::new()).is_err());

        // first contact while allowed, later frames after removal
        let traffic = CapturedTraffic::from_flows([flow(12, [1, 1, 1, 1], 443), flow(25, [1, 1, 1, 1], 443)]);
        assert!(assert_connections_against(&traffic, &timeline).is_ok());
        assert!(matches!(
            assert_all_flows_against(&traffic, &timeline),
            Err(HarnessError::PolicyViolation { .. })
        ));

        // first contact before the endpoint was allowed
        let early = CapturedTraffic::from_flows([flow(5, [1, 1, 1, 1], 443)]);
        assert!(assert_connections_against(&early, &timeline).is_err());
        assert!(timeline.current().is_empty());
    }

    #[test]
    fn test_sealed_log_rejects_appends() {
        let mut traffic = CapturedTraffic::new();
        traffic.push(flow(1, [1, 1, 1, 1], 1)).unwrap();
        traffic.seal();
        assert!(traffic.push(flow(2, [1, 1, 1, 1], 1)).is_err());
    }

    #[test]
    fn test_capture_stop_is_idempotent() {
        let backend = MockCapture::new();
        let capture = TrafficCapture::start(&backend, "vnet0").unwrap();
        backend.emit("vnet0", flow(1, [1, 1, 1, 1], 443));
        capture.stop().unwrap();
        capture.stop().unwrap();
        backend.emit("vnet0", flow(2, [2, 2, 2, 2], 443));
        let traffic = capture.snapshot().unwrap();
        assert!(traffic.is_sealed());
        assert_eq!(traffic.len(), 1);

        capture.clear();
        assert!(capture.snapshot().unwrap().is_empty());
    }

    /// Session whose final read fails.
    struct FailingDrain;

    impl CaptureSession for FailingDrain {
        fn drain(&mut self) -> HarnessResult<Vec<Flow>> {
            Err(HarnessError::Backend {
                backend: "capture",
                message: "pcap read error".to_string(),
            })
        }

        fn stop(&mut self) -> HarnessResult<()> {
            Ok(())
        }
    }

    struct FailingBackend;

    impl CaptureBackend for FailingBackend {
        fn start(&self, _: &str) -> HarnessResult<Box<dyn CaptureSession>> {
            Ok(Box::new(FailingDrain))
        }
    }

    #[test]
    fn test_capture_stop_seals_when_drain_fails() {
        let capture = TrafficCapture::start(&FailingBackend, "vnet0").unwrap();
        let err = capture.stop().unwrap_err();
        assert!(err.to_string().contains("pcap read error"));
        assert!(capture.is_sealed());
        capture.stop().unwrap();
        assert!(capture.is_sealed());
    }

    #[test]
    fn test_read_flows_jsonl() {
        let text = r#"{"timestamp":"2023-11-14T22:13:20Z","protocol":"tcp","source":"10.2.1.2","daddr":"1.1.1.1","dport":443}

{"timestamp":"2023-11-14T22:13:21Z","protocol":"udp","source":"10.2.1.2","daddr":"8.8.8.8","dport":53}
"#;
        let traffic = read_flows_jsonl(text.as_bytes()).unwrap();
        assert_eq!(traffic.len(), 2);
        assert_eq!(traffic.flows()[1].protocol, Protocol::Udp);
        assert!(read_flows_jsonl("{not json}\n".as_bytes()).is_err());
    }

    proptest! {
        #[test]
        fn prop_connections_unique_and_cover_all_destinations(
            raw in proptest::collection::vec((0i64..100, 0u8..4, 0u16..3), 0..40)
        ) {
            let traffic = CapturedTraffic::from_flows(
                raw.iter().map(|(t, a, p)| flow(*t, [10, 0, 0, *a], *p)),
            );
            let connections = traffic.connections();
            let unique: HashSet<Endpoint> = connections.iter().map(|c| c.destination).collect();
            prop_assert_eq!(unique.len(), connections.len());
            let all: HashSet<Endpoint> = traffic.flows().iter().map(Flow::destination).collect();
            prop_assert_eq!(unique, all);
            for c in &connections {
                let earliest = traffic
                    .flows()
                    .iter()
                    .filter(|f| f.destination() == c.destination)
                    .map(|f| f.timestamp)
                    .min();
                prop_assert_eq!(Some(c.first_seen), earliest);
            }
        }
    }
}
