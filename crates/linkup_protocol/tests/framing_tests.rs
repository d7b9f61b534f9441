use bytes::BytesMut;
use linkup_protocol::{
	ClientFrame, DEFAULT_MAX_FRAME_SIZE, FramingError, ServerFrame, decode_frame, encode_frame, encode_frame_default,
	encode_frame_into, frame_len_from_payload_len, try_decode_frame_from_buffer,
};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TestMsg {
	s: String,
	n: u32,
}

#[test]
fn encode_decode_roundtrip_slice() {
	let msg = TestMsg {
		s: "hello".to_string(),
		n: 42,
	};

	let frame = encode_frame(&msg, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");
	let (decoded, consumed) = decode_frame::<TestMsg>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode_frame");

	assert_eq!(consumed, frame.len());
	assert_eq!(decoded, msg);
}

#[test]
fn encode_frame_default_matches_explicit_default_limit() {
	let msg = TestMsg {
		s: "abc".to_string(),
		n: 7,
	};

	let a = encode_frame_default(&msg).expect("encode_frame_default");
	let b = encode_frame(&msg, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");

	assert_eq!(a, b);
}

#[test]
fn encode_into_appends_and_respects_existing_data() {
	let msg1 = TestMsg {
		s: "one".to_string(),
		n: 1,
	};
	let msg2 = TestMsg {
		s: "two".to_string(),
		n: 2,
	};

	let mut buf = BytesMut::new();
	buf.extend_from_slice(b"prefix-");

	encode_frame_into(&mut buf, &msg1, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame_into msg1");
	encode_frame_into(&mut buf, &msg2, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame_into msg2");

	let total = buf.to_vec();
	let framed = &total[b"prefix-".len()..];

	let (d1, used1) = decode_frame::<TestMsg>(framed, DEFAULT_MAX_FRAME_SIZE).expect("decode msg1");
	assert_eq!(d1, msg1);

	let (d2, used2) = decode_frame::<TestMsg>(&framed[used1..], DEFAULT_MAX_FRAME_SIZE).expect("decode msg2");
	assert_eq!(d2, msg2);

	assert_eq!(used1 + used2, framed.len());
}

#[test]
fn frame_len_helper_is_correct() {
	let msg = TestMsg {
		s: "hello".to_string(),
		n: 123,
	};

	let payload_len = serde_json::to_vec(&msg).expect("serialize").len();
	let frame = encode_frame_default(&msg).expect("encode");

	assert_eq!(frame_len_from_payload_len(payload_len), frame.len());
}

#[test]
fn client_and_server_frames_survive_framing() {
	let client = ClientFrame::SendMessage {
		content: "hello there".to_string(),
		send_to: linkup_domain::UserId::new_v4(),
	};
	let frame = encode_frame_default(&client).expect("encode client frame");
	let (back, _) = decode_frame::<ClientFrame>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode client frame");
	assert_eq!(back, client);

	let server = ServerFrame::SuccessMessage {
		content: "hello there".to_string(),
	};
	let frame = encode_frame_default(&server).expect("encode server frame");
	let (back, _) = decode_frame::<ServerFrame>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode server frame");
	assert_eq!(back, server);
}

#[test]
fn oversized_frame_is_rejected_before_decode() {
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&(DEFAULT_MAX_FRAME_SIZE as u32 + 1).to_be_bytes());

	let err = try_decode_frame_from_buffer::<TestMsg>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	match err {
		FramingError::FrameTooLarge { .. } => {}
		other => panic!("unexpected error: {other:?}"),
	}
}

proptest! {
	#[test]
	fn roundtrip_arbitrary_payloads(s in ".{0,256}", n in any::<u32>()) {
		let msg = TestMsg { s, n };
		let frame = encode_frame_default(&msg).expect("encode");
		let (decoded, consumed) = decode_frame::<TestMsg>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");
		prop_assert_eq!(consumed, frame.len());
		prop_assert_eq!(decoded, msg);
	}

	#[test]
	fn split_at_any_point_decodes_incrementally(s in ".{0,64}", split in 0usize..80) {
		let msg = TestMsg { s, n: 5 };
		let frame = encode_frame_default(&msg).expect("encode");
		let split = split.min(frame.len());

		let mut buf = BytesMut::new();
		buf.extend_from_slice(&frame[..split]);
		let first = try_decode_frame_from_buffer::<TestMsg>(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("ok");
		if split < frame.len() {
			prop_assert!(first.is_none());
			buf.extend_from_slice(&frame[split..]);
			let second = try_decode_frame_from_buffer::<TestMsg>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
				.expect("ok")
				.expect("some");
			prop_assert_eq!(second, msg);
		} else {
			prop_assert_eq!(first.expect("some"), msg);
		}
	}
}
