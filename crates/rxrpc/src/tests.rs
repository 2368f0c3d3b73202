use crate::*;
use crate::codec::Reader;
use crate::codec::Writer;

// ============================================================================
//  FRAMES
// ============================================================================

#[test]
fn frame_layout_is_little_endian() {
    let frame = Frame::next(StreamId(0x0102_0304), vec![0xAA, 0xBB]);
    let bytes = frame.encode().unwrap();
    assert_eq!(bytes, vec![0x04, 0x03, 0x02, 0x01, 0x02, 0x02, 0x00, 0x00, 0x00, 0xAA, 0xBB]);
}

#[test]
fn request_n_carries_count_before_payload() {
    let frame = Frame::request_n(StreamId(7), 3);
    let bytes = frame.encode().unwrap();
    assert_eq!(bytes, vec![7, 0, 0, 0, 0x03, 3, 0, 0, 0, 0, 0, 0, 0]);

    let decoded = Frame::decode(&bytes).unwrap();
    assert_eq!(decoded.kind, FrameKind::RequestN);
    assert_eq!(decoded.requested, Some(3));
}

#[test]
fn request_n_zero_is_rejected_both_ways() {
    let frame = Frame::request_n(StreamId(1), 0);
    assert!(matches!(frame.encode(), Err(FrameError::InvalidValue(_))));

    let bytes = vec![1, 0, 0, 0, 0x03, 0, 0, 0, 0, 0, 0, 0, 0];
    assert!(matches!(Frame::decode(&bytes), Err(FrameError::InvalidValue(_))));
}

#[test]
fn every_kind_survives_the_wire() {
    let open = OpenRequest::new("iota.testing/EmptyVoid", 1, vec![]);
    let frames = vec![
        Frame::open(StreamId(1), &open),
        Frame::next(StreamId(2), vec![1, 2, 3]),
        Frame::request_n(StreamId(3), u32::MAX),
        Frame::complete(StreamId(4)),
        Frame::error(StreamId(5), &Error::unimplemented()),
        Frame::cancel(StreamId(6)),
    ];

    for frame in frames {
        let bytes = frame.encode().unwrap();
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }
}

#[test]
fn unknown_kind_is_reported() {
    let bytes = vec![1, 0, 0, 0, 0x7F, 0, 0, 0, 0];
    assert_eq!(Frame::decode(&bytes), Err(FrameError::InvalidKind(0x7F)));
}

#[test]
fn truncated_frames_never_panic() {
    let bytes = Frame::next(StreamId(9), vec![1, 2, 3, 4]).encode().unwrap();
    for cut in 0..bytes.len() {
        assert!(Frame::decode(&bytes[..cut]).is_err(), "prefix of {} bytes decoded", cut);
    }
}

#[test]
fn trailing_bytes_are_rejected() {
    let mut bytes = Frame::complete(StreamId(1)).encode().unwrap();
    bytes.push(0);
    assert_eq!(Frame::decode(&bytes), Err(FrameError::TrailingBytes(1)));
}

#[test]
fn payload_limit_applies_before_reading() {
    let bytes = Frame::next(StreamId(1), vec![0; 64]).encode().unwrap();
    assert_eq!(Frame::decode_with_limit(&bytes, 16), Err(FrameError::PayloadTooLarge(64)));
    assert!(Frame::decode_with_limit(&bytes, 64).is_ok());
}

#[test]
fn stream_id_is_recoverable_from_garbage() {
    let bytes = vec![42, 0, 0, 0, 0xFF, 0xFF];
    assert!(Frame::decode(&bytes).is_err());
    assert_eq!(peek_stream_id(&bytes).unwrap(), StreamId(42));
    assert!(peek_stream_id(&bytes[..3]).is_err());
}

#[test]
fn terminal_kinds() {
    assert!(FrameKind::Complete.is_terminal());
    assert!(FrameKind::Error.is_terminal());
    assert!(FrameKind::Cancel.is_terminal());
    assert!(!FrameKind::Open.is_terminal());
    assert!(!FrameKind::Next.is_terminal());
    assert!(!FrameKind::RequestN.is_terminal());
}

// ============================================================================
//  OPEN PAYLOAD
// ============================================================================

#[test]
fn open_request_layout() {
    let open = OpenRequest::new("ab", 5, vec![9]);
    assert_eq!(open.encode(), vec![2, 0, b'a', b'b', 5, 0, 0, 0, 9]);
    assert_eq!(OpenRequest::decode(&open.encode()).unwrap(), open);
}

#[test]
fn open_request_rejects_empty_name() {
    let bytes = vec![0, 0, 1, 0, 0, 0];
    assert!(matches!(OpenRequest::decode(&bytes), Err(FrameError::InvalidValue(_))));
}

#[test]
fn open_request_rejects_bad_utf8() {
    let bytes = vec![1, 0, 0xFF, 1, 0, 0, 0];
    assert_eq!(OpenRequest::decode(&bytes), Err(FrameError::InvalidUtf8));
}

#[test]
fn open_accessor_checks_kind() {
    let frame = Frame::complete(StreamId(1));
    assert!(frame.open_request().is_err());

    let open = OpenRequest::new("svc/op", 0, vec![]);
    let frame = Frame::open(StreamId(1), &open);
    assert_eq!(frame.open_request().unwrap(), open);
}

// ============================================================================
//  ERRORS
// ============================================================================

#[test]
fn error_payload_preserves_kind_message_and_data() {
    let err = Error::application("bad input").with_data(vec![1, 2, 3]);
    let frame = Frame::error(StreamId(3), &err);
    let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
    let back = decoded.error_payload().unwrap();

    assert_eq!(back, err);
    assert!(back.is(ErrorKind::Application));
    assert_eq!(back.to_string(), "application: bad input");
}

#[test]
fn unimplemented_error_uses_stub_message() {
    let err = Error::unimplemented();
    assert_eq!(err.kind, ErrorKind::Unimplemented);
    assert_eq!(err.message, "not_implemented");
}

#[test]
fn error_kind_tags_are_stable() {
    for tag in 0x01..=0x07u8 {
        let kind = ErrorKind::from_u8(tag).unwrap();
        assert_eq!(kind as u8, tag);
    }
    assert_eq!(ErrorKind::from_u8(0), None);
    assert_eq!(Error::decode(&[0x09, 0, 0, 0, 0]), Err(FrameError::InvalidErrorKind(0x09)));
}

#[test]
fn frame_errors_become_protocol_violations() {
    let err: Error = FrameError::UnexpectedEnd.into();
    assert!(err.is(ErrorKind::ProtocolViolation));
}

// ============================================================================
//  CURSORS & VALUES
// ============================================================================

#[test]
fn cursor_reads_what_writer_wrote() {
    let mut w = Writer::new();
    w.u8(1);
    w.u16(0x0203);
    w.u64(u64::MAX);
    w.str32("héllo");
    let bytes = w.into_bytes();

    let mut r = Reader::new(&bytes);
    assert_eq!(r.u8().unwrap(), 1);
    assert_eq!(r.u16().unwrap(), 0x0203);
    assert_eq!(r.u64().unwrap(), u64::MAX);
    assert_eq!(r.str32().unwrap(), "héllo");
    assert!(r.finish().is_ok());
    assert_eq!(r.u8(), Err(FrameError::UnexpectedEnd));
}

#[test]
fn scalar_values() {
    assert_eq!(42i64.encode(), 42i64.to_le_bytes().to_vec());
    assert_eq!(i64::decode(&(-7i64).encode()).unwrap(), -7);
    assert_eq!(i32::decode(&(-1i32).encode()).unwrap(), -1);
    assert_eq!(u32::decode(&7u32.encode()).unwrap(), 7);
    assert_eq!(f64::decode(&1.5f64.encode()).unwrap(), 1.5);
    assert_eq!(String::decode(&"hi".to_string().encode()).unwrap(), "hi");
    assert!(bool::decode(&true.encode()).unwrap());
    assert_eq!(<()>::decode(&[]).unwrap(), ());
}

#[test]
fn scalar_values_reject_wrong_width() {
    assert_eq!(i64::decode(&[1, 2, 3]), Err(FrameError::UnexpectedEnd));
    assert_eq!(i32::decode(&[0; 5]), Err(FrameError::TrailingBytes(1)));
    assert_eq!(<()>::decode(&[0]), Err(FrameError::TrailingBytes(1)));
    assert!(bool::decode(&[2]).is_err());
    assert_eq!(String::decode(&[0xFF]), Err(FrameError::InvalidUtf8));
}
