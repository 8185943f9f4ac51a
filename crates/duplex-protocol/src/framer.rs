//! Incremental packet framer.
//!
//! Wire format per packet: `[version][kind][JSON body]\n`. Input may arrive
//! in chunks of any size; partial lines are kept until their line feed shows
//! up.
//!
//! ```text
//! AwaitingVersion --byte--> AwaitingKind --byte--> AwaitingLine --'\n'--> AwaitingVersion
//!        |                        |                       |
//!        +-- bad version ---------+-- bad kind (fatal) ---+-- bad JSON / too long --> Faulted
//! ```

use crate::error::FrameError;

/// The single supported protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

pub const LINE_FEED: u8 = b'\n';

/// Default upper bound for one packet line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// How a kind namespace treats kind bytes it does not define.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownKindPolicy {
    /// Fault the stream.
    Fatal,
    /// Report the kind, drop the rest of the line, keep going.
    SkipLine,
}

/// A packet kind namespace.
pub trait PacketKind: Copy + std::fmt::Debug + Send + Sync + 'static {
    const UNKNOWN_POLICY: UnknownKindPolicy;

    fn from_byte(byte: u8) -> Option<Self>;

    fn as_byte(self) -> u8;
}

/// One decoded packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet<K> {
    pub kind: K,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent<K> {
    Packet(Packet<K>),
    /// A line with an unknown kind byte was skipped.
    SkippedKind(u8),
}

/// Result of feeding one chunk.
#[derive(Debug)]
pub struct Feed<K> {
    /// Everything decoded before the end of the chunk (or the fault).
    pub events: Vec<FrameEvent<K>>,
    pub fault: Option<FrameError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerState {
    AwaitingVersion,
    AwaitingKind,
    AwaitingLine,
    Faulted,
    Closed,
}

pub struct Framer<K: PacketKind> {
    state: FramerState,
    kind: Option<K>,
    buffer: Vec<u8>,
    max_line_bytes: usize,
}

impl<K: PacketKind> Default for Framer<K> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl<K: PacketKind> Framer<K> {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            state: FramerState::AwaitingVersion,
            kind: None,
            buffer: Vec::new(),
            max_line_bytes,
        }
    }

    pub fn state(&self) -> FramerState {
        self.state
    }

    /// Bytes of the current, still unterminated, line.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Stop accepting input. Later chunks are ignored.
    pub fn close(&mut self) {
        self.state = FramerState::Closed;
        self.buffer = Vec::new();
    }

    /// Consume `chunk` completely, returning every packet it finished.
    pub fn feed(&mut self, chunk: &[u8]) -> Feed<K> {
        let mut events = Vec::new();
        let mut pos = 0;

        while pos < chunk.len() {
            match self.state {
                FramerState::Faulted | FramerState::Closed => break,
                FramerState::AwaitingVersion => {
                    let byte = chunk[pos];
                    pos += 1;
                    if byte != PROTOCOL_VERSION {
                        return self.fault(events, FrameError::UnsupportedVersion(byte));
                    }
                    self.state = FramerState::AwaitingKind;
                }
                FramerState::AwaitingKind => {
                    let byte = chunk[pos];
                    pos += 1;
                    self.kind = K::from_byte(byte);
                    if self.kind.is_none() {
                        match K::UNKNOWN_POLICY {
                            UnknownKindPolicy::Fatal => {
                                return self.fault(events, FrameError::UnsupportedKind(byte));
                            }
                            UnknownKindPolicy::SkipLine => {
                                events.push(FrameEvent::SkippedKind(byte));
                            }
                        }
                    }
                    self.state = FramerState::AwaitingLine;
                }
                FramerState::AwaitingLine => {
                    let rest = &chunk[pos..];
                    match rest.iter().position(|&b| b == LINE_FEED) {
                        Some(end) => {
                            pos += end + 1;
                            if let Some(kind) = self.kind.take() {
                                if let Err(err) = self.append(&rest[..end]) {
                                    return self.fault(events, err);
                                }
                                match self.finish_line() {
                                    Ok(body) => events.push(FrameEvent::Packet(Packet { kind, body })),
                                    Err(err) => return self.fault(events, err),
                                }
                            }
                            self.buffer.clear();
                            self.state = FramerState::AwaitingVersion;
                        }
                        None => {
                            pos = chunk.len();
                            if self.kind.is_some() {
                                if let Err(err) = self.append(rest) {
                                    return self.fault(events, err);
                                }
                            }
                        }
                    }
                }
            }
        }

        Feed {
            events,
            fault: None,
        }
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        if self.buffer.len() + bytes.len() > self.max_line_bytes {
            return Err(FrameError::LineTooLong {
                limit: self.max_line_bytes,
            });
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn finish_line(&mut self) -> Result<serde_json::Value, FrameError> {
        // Multi-byte characters may have been split across chunks; the line
        // is only decoded once it is complete.
        let text = String::from_utf8_lossy(&self.buffer);
        serde_json::from_str(&text).map_err(|e| FrameError::MalformedJson(e.to_string()))
    }

    fn fault(&mut self, events: Vec<FrameEvent<K>>, err: FrameError) -> Feed<K> {
        self.state = FramerState::Faulted;
        self.buffer = Vec::new();
        Feed {
            events,
            fault: Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PubSubKind, RpcKind};

    fn packet_bytes(kind: u8, body: &str) -> Vec<u8> {
        let mut bytes = vec![PROTOCOL_VERSION, kind];
        bytes.extend_from_slice(body.as_bytes());
        bytes.push(LINE_FEED);
        bytes
    }

    fn packets<K: PacketKind>(events: Vec<FrameEvent<K>>) -> Vec<Packet<K>> {
        events
            .into_iter()
            .filter_map(|event| match event {
                FrameEvent::Packet(packet) => Some(packet),
                FrameEvent::SkippedKind(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_single_packet() {
        let mut framer = Framer::<RpcKind>::default();
        let feed = framer.feed(&packet_bytes(0x03, r#"[0,"foo"]"#));
        assert!(feed.fault.is_none());
        let packets = packets(feed.events);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind, RpcKind::CallNoSer);
        assert_eq!(packets[0].body, serde_json::json!([0, "foo"]));
        assert_eq!(framer.state(), FramerState::AwaitingVersion);
    }

    #[test]
    fn test_every_split_point_yields_one_packet() {
        let bytes = packet_bytes(0x01, r#"["héllo wörld ✓",[1,"ünïcode 🎉",null]]"#);
        let mut whole = Framer::<PubSubKind>::default();
        let expected = packets(whole.feed(&bytes).events);
        assert_eq!(expected.len(), 1);

        for split in 1..bytes.len() {
            let mut framer = Framer::<PubSubKind>::default();
            let mut events = framer.feed(&bytes[..split]).events;
            assert!(events.is_empty(), "split {}", split);
            events.extend(framer.feed(&bytes[split..]).events);
            assert_eq!(packets(events), expected, "split {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut bytes = packet_bytes(0x02, r#"[1,"add",[1.2],[{"k":1}]]"#);
        bytes.extend(packet_bytes(0x05, "7"));
        let mut framer = Framer::<RpcKind>::default();
        let mut events = Vec::new();
        for byte in &bytes {
            let feed = framer.feed(std::slice::from_ref(byte));
            assert!(feed.fault.is_none());
            events.extend(feed.events);
        }
        let packets = packets(events);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1].kind, RpcKind::RespNoSer);
        assert_eq!(packets[1].body, serde_json::json!(7));
    }

    #[test]
    fn test_many_packets_in_one_chunk() {
        let mut bytes = Vec::new();
        for i in 0..5 {
            bytes.extend(packet_bytes(0x01, &format!(r#"["ev{}"]"#, i)));
        }
        let mut framer = Framer::<PubSubKind>::default();
        assert_eq!(packets(framer.feed(&bytes).events).len(), 5);
    }

    #[test]
    fn test_bad_version_faults() {
        let mut framer = Framer::<RpcKind>::default();
        let feed = framer.feed(&[0x02, 0x03]);
        assert_eq!(feed.fault, Some(FrameError::UnsupportedVersion(2)));
        assert_eq!(framer.state(), FramerState::Faulted);
        // Nothing is parsed after a fault.
        let feed = framer.feed(&packet_bytes(0x03, r#"[0,"foo"]"#));
        assert!(feed.events.is_empty());
        assert!(feed.fault.is_none());
    }

    #[test]
    fn test_unknown_rpc_kind_is_fatal() {
        let mut framer = Framer::<RpcKind>::default();
        let feed = framer.feed(&packet_bytes(0x09, "1"));
        assert_eq!(feed.fault, Some(FrameError::UnsupportedKind(9)));
    }

    #[test]
    fn test_unknown_pubsub_kind_skips_line() {
        let mut bytes = packet_bytes(0x07, "{not json at all");
        bytes.extend(packet_bytes(0x01, r#"["after"]"#));
        let mut framer = Framer::<PubSubKind>::default();
        let feed = framer.feed(&bytes);
        assert!(feed.fault.is_none());
        assert_eq!(feed.events[0], FrameEvent::SkippedKind(7));
        let packets = packets(feed.events);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].body, serde_json::json!(["after"]));
    }

    #[test]
    fn test_malformed_json_faults_after_earlier_packets() {
        let mut bytes = packet_bytes(0x01, r#"["ok"]"#);
        bytes.extend(packet_bytes(0x01, "[oops"));
        let mut framer = Framer::<PubSubKind>::default();
        let feed = framer.feed(&bytes);
        assert_eq!(packets(feed.events).len(), 1);
        assert!(matches!(feed.fault, Some(FrameError::MalformedJson(_))));
    }

    #[test]
    fn test_line_limit() {
        let mut framer = Framer::<PubSubKind>::new(8);
        let feed = framer.feed(&packet_bytes(0x01, r#"["far too long"]"#));
        assert_eq!(feed.fault, Some(FrameError::LineTooLong { limit: 8 }));
    }

    #[test]
    fn test_closed_framer_ignores_input() {
        let mut framer = Framer::<PubSubKind>::default();
        framer.close();
        let feed = framer.feed(&packet_bytes(0x01, r#"["x"]"#));
        assert!(feed.events.is_empty());
        assert_eq!(framer.state(), FramerState::Closed);
    }
}
