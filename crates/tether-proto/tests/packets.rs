// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tether_proto::wire::{decode_message, encode_message, encode_segmented, Packet, Reassembler};
use tether_proto::{
    decode_response, ErrorPayload, FeatureValue, FrameError, Message, NodeChange, ServerMessage,
    SpliceItems,
};

fn big_update() -> Message {
    let changes = (0..200)
        .map(|i| NodeChange::Put {
            node: 1,
            feature: 0,
            key: format!("key{i}"),
            value: FeatureValue::Value(json!(format!("value number {i}"))),
        })
        .collect();
    Message::Update {
        text: ServerMessage::delta(0, changes).encode_wrapped(),
    }
}

#[test]
fn segmented_update_reassembles_across_reads() {
    let msg = big_update();
    let packets = encode_segmented(&msg, 9, 256).unwrap();
    assert!(packets.len() > 1);
    let stream: Vec<u8> = packets.concat();

    let mut reassembler = Reassembler::new(1 << 20);
    let mut buf = Vec::new();
    let mut decoded = Vec::new();
    for chunk in stream.chunks(100) {
        buf.extend_from_slice(chunk);
        decoded.extend(reassembler.drain(&mut buf).unwrap());
    }
    assert!(buf.is_empty());
    assert!(!reassembler.is_partial());
    assert_eq!(decoded, vec![(msg.clone(), 9)]);

    if let (Message::Update { text }, _) = &decoded[0] {
        assert_eq!(decode_response(text).unwrap()[0].changes.len(), 200);
    }
}

#[test]
fn reassembly_respects_the_payload_limit() {
    let packets = encode_segmented(&big_update(), 0, 256).unwrap();
    let mut reassembler = Reassembler::new(512);
    let mut result = Ok(None);
    for bytes in &packets {
        let (packet, _) = Packet::decode(bytes).unwrap();
        result = reassembler.push(packet);
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    assert!(!reassembler.is_partial());
    assert_eq!(encode_segmented(&big_update(), 0, 0), Err(FrameError::ZeroSegment));
}

#[test]
fn random_bit_flips_never_decode() {
    let msg = Message::Error(ErrorPayload::new(3, "E_BAD_PAYLOAD", "invalid payload"));
    let bytes = encode_message(&msg, 1).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    for _ in 0..64 {
        let mut corrupted = bytes.clone();
        let at = rng.gen_range(0..corrupted.len());
        corrupted[at] ^= 1 << rng.gen_range(0..8);
        assert!(decode_message(&corrupted).is_err(), "flip at byte {at} decoded");
    }
}

fn change_strategy() -> impl Strategy<Value = NodeChange> {
    prop_oneof![
        (1u64..50).prop_map(|node| NodeChange::Attach { node }),
        (1u64..50, 0u16..4, "[a-z]{1,6}", any::<i64>()).prop_map(|(node, feature, key, v)| {
            NodeChange::Put {
                node,
                feature,
                key,
                value: FeatureValue::Value(json!(v)),
            }
        }),
        (1u64..50, 0u16..4, "[a-z]{1,6}", 1u64..50).prop_map(|(node, feature, key, child)| {
            NodeChange::Put {
                node,
                feature,
                key,
                value: FeatureValue::Node(child),
            }
        }),
        (1u64..50, 0u16..4, 0usize..10, 0usize..3, proptest::collection::vec(1u64..50, 0..4))
            .prop_map(|(node, feature, index, remove, ids)| NodeChange::Splice {
                node,
                feature,
                index,
                remove,
                add: if ids.is_empty() {
                    SpliceItems::None
                } else {
                    SpliceItems::Nodes(ids)
                },
            }),
    ]
}

proptest! {
    #[test]
    fn encoding_is_deterministic_and_decodable(
        sync_id in 0u64..1000,
        changes in proptest::collection::vec(change_strategy(), 0..16),
    ) {
        let msg = ServerMessage::delta(sync_id, changes);
        let first = msg.encode_wrapped();
        prop_assert_eq!(&first, &msg.clone().encode_wrapped());
        prop_assert_eq!(decode_response(&first).unwrap(), vec![msg]);
    }
}
