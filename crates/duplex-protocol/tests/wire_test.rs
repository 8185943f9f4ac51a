//! Integration tests for duplex-protocol.
//!
//! Encode packets the way an engine would, push the bytes through a framer
//! in awkward chunks, and decode the bodies on the other side.

use chrono::{TimeZone, Utc};
use duplex_protocol::{
    encode_call, encode_publish, encode_response, CallBody, Codec, ErrorKind, ErrorValue,
    FrameEvent, Framer, FunctionPolicy, FunctionSource, Packet, PubSubKind, PublishBody,
    RegExp, ResponseBody, RpcKind, Value,
};

fn collect<K: duplex_protocol::PacketKind>(framer: &mut Framer<K>, bytes: &[u8], chunk: usize) -> Vec<Packet<K>> {
    let mut packets = Vec::new();
    for piece in bytes.chunks(chunk) {
        let feed = framer.feed(piece);
        assert!(feed.fault.is_none(), "unexpected fault: {:?}", feed.fault);
        for event in feed.events {
            if let FrameEvent::Packet(packet) = event {
                packets.push(packet);
            }
        }
    }
    packets
}

fn mixed_args() -> Vec<Value> {
    let date = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
    vec![
        Value::from("plain"),
        Value::from(date),
        Value::from(RegExp::new("a+b", "gi").with_last_index(3)),
        Value::from(vec![0u8, 1, 254, 255]),
        Value::Number(f64::NAN),
        Value::Number(f64::NEG_INFINITY),
        Value::from(
            ErrorValue::new(ErrorKind::RangeError, "out of range").with_property("code", 42),
        ),
        Value::object([
            ("when", Value::from(date)),
            ("nested", Value::Array(vec![Value::Number(f64::INFINITY), Value::Null])),
        ]),
    ]
}

#[test]
fn test_call_round_trip_through_framer() {
    let codec = Codec::default();
    let mut bytes = encode_call(1, "store", mixed_args(), Some(&codec)).unwrap();
    bytes.extend(encode_call(0, "ping", vec![], Some(&codec)).unwrap());

    for chunk in [1, 2, 7, 64, bytes.len()] {
        let mut framer = Framer::<RpcKind>::default();
        let packets = collect(&mut framer, &bytes, chunk);
        assert_eq!(packets.len(), 2);

        assert_eq!(packets[0].kind, RpcKind::Call);
        let call = CallBody::parse(packets[0].body.clone()).unwrap();
        assert_eq!(call.id, 1);
        assert_eq!(call.method, "store");
        let args = call.args.decode(Some(&codec), true);
        assert_eq!(args, mixed_args());

        assert_eq!(packets[1].kind, RpcKind::CallNoSer);
        let ping = CallBody::parse(packets[1].body.clone()).unwrap();
        assert!(!ping.wants_response());
        assert_eq!(ping.method, "ping");
    }
}

#[test]
fn test_plain_values_stay_untagged() {
    let codec = Codec::default();
    let args = vec![
        Value::from(1),
        Value::from("two"),
        Value::Bool(false),
        Value::Null,
        Value::object([("k", Value::Array(vec![Value::from(1.5)]))]),
    ];
    let bytes = encode_response(4, args.clone(), Some(&codec)).unwrap();
    let mut framer = Framer::<RpcKind>::default();
    let packets = collect(&mut framer, &bytes, 3);
    assert_eq!(packets[0].kind, RpcKind::RespNoSer);
    let resp = ResponseBody::parse(packets[0].body.clone()).unwrap();
    assert!(resp.args.typeinfo.is_none());
    assert_eq!(resp.args.decode(Some(&codec), false), args);
}

#[test]
fn test_publish_with_opaque_function() {
    let codec = Codec::new(FunctionPolicy::Opaque);
    let source = FunctionSource::parse("function (a, b) { return a + b; }");
    let bytes = encode_publish("fn", vec![Value::from(source.clone())], Some(&codec)).unwrap();

    let mut framer = Framer::<PubSubKind>::default();
    let packets = collect(&mut framer, &bytes, 5);
    assert_eq!(packets[0].kind, PubSubKind::Pub);
    let publish = PublishBody::parse(packets[0].body.clone()).unwrap();
    assert_eq!(publish.event, "fn");
    let args = publish.args.decode(Some(&codec), true);
    assert_eq!(args, vec![Value::Function(source)]);
}

#[test]
fn test_rejected_function_fails_before_encoding() {
    let codec = Codec::default();
    let source = FunctionSource::parse("function () { return 1; }");
    let err = encode_publish("fn", vec![Value::from(source)], Some(&codec)).unwrap_err();
    assert_eq!(err, duplex_protocol::CodecError::FunctionRejected);
}
