use bytes::{Bytes, BytesMut};
use kunzitedb::core::protocol::resp_frame::parse_frame;
use kunzitedb::core::protocol::{RespFrame, RespFrameCodec};
use tokio_util::codec::Decoder;

fn roundtrip(frame: RespFrame) {
    let encoded = frame.encode_to_vec().expect("encode");
    let (parsed, consumed) = parse_frame(&encoded).expect("parse");
    assert_eq!(parsed, frame);
    assert_eq!(consumed, encoded.len());
}

#[test]
fn test_roundtrip_of_every_frame_shape() {
    roundtrip(RespFrame::SimpleString("OK".into()));
    roundtrip(RespFrame::Error("ERR something went wrong".into()));
    roundtrip(RespFrame::Integer(0));
    roundtrip(RespFrame::Integer(-42));
    roundtrip(RespFrame::BulkString(Bytes::from_static(b"hello")));
    roundtrip(RespFrame::BulkString(Bytes::new()));
    roundtrip(RespFrame::Null);
    roundtrip(RespFrame::NullArray);
    roundtrip(RespFrame::Array(vec![]));
    roundtrip(RespFrame::Array(vec![
        RespFrame::BulkString(Bytes::from_static(b"SET")),
        RespFrame::BulkString(Bytes::from_static(b"k")),
        RespFrame::BulkString(Bytes::from_static(b"v")),
    ]));
    roundtrip(RespFrame::Array(vec![
        RespFrame::Integer(7),
        RespFrame::Array(vec![RespFrame::SimpleString("nested".into())]),
        RespFrame::Null,
    ]));
}

#[test]
fn test_command_helper_builds_bulk_arrays() {
    let frame = RespFrame::command(&[Bytes::from_static(b"SET"), Bytes::from_static(b"key")]);
    let encoded = frame.encode_to_vec().expect("encode");
    assert_eq!(&encoded, b"*2\r\n$3\r\nSET\r\n$3\r\nkey\r\n");
    roundtrip(frame);
}

#[test]
fn test_binary_safe_bulk_strings() {
    roundtrip(RespFrame::BulkString(Bytes::from_static(
        b"\x00\x01\xff\r\npayload\r\n",
    )));
}

#[test]
fn test_decoder_waits_for_complete_frames() {
    let mut codec = RespFrameCodec;
    let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$1"[..]);
    // Incomplete: no frame yet, no error.
    assert!(codec.decode(&mut buf).expect("no error").is_none());

    buf.extend_from_slice(b"\r\nk\r\n");
    let frame = codec.decode(&mut buf).expect("no error").expect("frame");
    assert_eq!(
        frame,
        RespFrame::Array(vec![
            RespFrame::BulkString(Bytes::from_static(b"GET")),
            RespFrame::BulkString(Bytes::from_static(b"k")),
        ])
    );
    assert!(buf.is_empty());
}

#[test]
fn test_parse_reports_consumed_length_for_pipelined_input() {
    let first = RespFrame::command(&[Bytes::from_static(b"PING")])
        .encode_to_vec()
        .expect("encode");
    let second = RespFrame::command(&[Bytes::from_static(b"SET"), Bytes::from_static(b"a"), Bytes::from_static(b"b")])
        .encode_to_vec()
        .expect("encode");
    let mut stream = first.clone();
    stream.extend_from_slice(&second);

    let (frame_one, len_one) = parse_frame(&stream).expect("first");
    assert_eq!(len_one, first.len());
    assert_eq!(frame_one.encode_to_vec().expect("encode"), first);
    let (frame_two, len_two) = parse_frame(&stream[len_one..]).expect("second");
    assert_eq!(len_two, second.len());
    assert_eq!(frame_two.encode_to_vec().expect("encode"), second);
}

#[test]
fn test_garbage_prefix_is_a_syntax_error() {
    assert!(parse_frame(b"!bogus\r\n").is_err());
}
