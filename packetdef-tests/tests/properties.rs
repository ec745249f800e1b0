// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use googletest::prelude::{assert_that, eq};
use packetdef_compiler::{Builder, Value, View};
use packetdef_tests::test_packets;

fn four_bits(value: u64) -> Value {
    match value {
        1 => Value::tag("ONE"),
        2 => Value::tag("TWO"),
        3 => Value::tag("THREE"),
        5 => Value::tag("FIVE"),
        10 => Value::tag("TEN"),
        15 => Value::tag("LAZY_ME"),
        _ => Value::Integer(value),
    }
}

fn two_related_numbers(id: u64, count: u64) -> Value {
    Value::record([("id", id), ("count", count)])
}

/// Serialize the builder, then view the bytes as `root` and specialize
/// through `children`.
fn round_trip(builder: Builder, root: &str, children: &[&str]) -> View {
    let size = builder.size().unwrap();
    let bytes = builder.to_vec().unwrap();
    assert_eq!(bytes.len(), size);
    children
        .iter()
        .fold(test_packets().view(root, bytes), |view, child| view.specialize(child))
}

#[test]
fn builder_values_are_decoded() {
    let codec = test_packets();
    for field_name in [0u16, 1, 0x1234, 0xffff] {
        for footer in [0u8, 0x7f, 0xff] {
            let view = round_trip(
                codec.builder("Child").with("field_name", field_name).with("footer", footer),
                "Parent",
                &["Child"],
            );
            assert!(view.is_valid());
            assert_eq!(view.get("field_name"), Value::from(field_name));
            assert_eq!(view.get("footer"), Value::from(footer));
        }
    }

    let array: Vec<Value> = (0..10).map(|i| two_related_numbers(i, 0xffff - i)).collect();
    let view = round_trip(
        codec
            .builder("ArrayOfStructAndAnother")
            .with("array", array.clone())
            .with("another", two_related_numbers(0xff, 0)),
        "ArrayOfStructAndAnother",
        &[],
    );
    assert!(view.is_valid());
    assert_eq!(view.get("array"), Value::Array(array));
    assert_eq!(view.get("another"), two_related_numbers(0xff, 0));
}

#[test]
fn straddling_enum_values() {
    let codec = test_packets();
    for value in 0..16 {
        let builder = codec
            .builder("MiddleFourBits")
            .with("low_two", Value::tag("THREE"))
            .with("next_four", Value::tag("LAZY_ME"))
            .with("straddle", value)
            .with("four_more", Value::tag("ONE"))
            .with("high_two", Value::tag("ZERO"));
        let bytes = builder.to_vec().unwrap();
        let bits: u64 = 0x3 | 0xf << 2 | value << 6 | 0x1 << 10;
        assert_eq!(bytes, bits.to_le_bytes()[..2]);

        let view = codec.view("MiddleFourBits", bytes);
        assert!(view.is_valid());
        assert_that!(view.get("straddle"), eq(four_bits(value)));
        assert_that!(view.get("next_four"), eq(Value::tag("LAZY_ME")));
        assert_that!(view.get("four_more"), eq(Value::tag("ONE")));
    }
}

#[test]
fn truncated_spans_are_invalid() {
    let codec = test_packets();
    let samples: [(&str, &[&str], Vec<u8>); 4] = [
        ("Parent", &["Child"], vec![0x12, 0x02, 0xa1, 0xa2, 0xb1]),
        (
            "ArrayOfStruct",
            &[],
            vec![0x04, 0x01, 0x01, 0x02, 0x02, 0x02, 0x04, 0x03, 0x03, 0x06, 0x04, 0x04, 0x08],
        ),
        (
            "OneFixedTypesStruct",
            &[],
            vec![0x05, 0xf3, 0x0d, 0x01, 0x02, 0x03, 0x06, 0x01, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6],
        ),
        ("BitFieldArrayPacket", &[], vec![0x06, 0xf7, 0xaa, 0x78, 0xb3, 0xf9, 0xbb]),
    ];

    for (root, children, bytes) in samples {
        let view = |len: usize| {
            children
                .iter()
                .fold(codec.view(root, bytes[..len].to_vec()), |view, child| view.specialize(child))
        };
        assert!(view(bytes.len()).is_valid(), "{root} is not valid");
        for len in 0..bytes.len() {
            assert!(!view(len).is_valid(), "{root} is valid with {len} bytes");
        }
    }
}

#[test]
fn checksum_detects_bit_flips() {
    let codec = test_packets();
    let bytes = [0x11, 0x12, 0x21, 0x22, 0x43, 0x00];
    for byte in 0..bytes.len() {
        for bit in 0..8 {
            let mut flipped = bytes;
            flipped[byte] ^= 1 << bit;
            // two_bytes is not covered by the checksum.
            let covered = byte >= 2;
            assert_eq!(
                codec.view("ParentWithSum", flipped.to_vec()).is_valid(),
                !covered,
                "flipped bit {bit} of byte {byte}"
            );
        }
    }
}

#[test]
fn appending_to_count_array() {
    let codec = test_packets();
    let strings = ["one", "two", "three"];
    let build = |strings: &[&str]| {
        let values: Vec<Value> = strings.iter().map(|text| Value::text(text)).collect();
        codec.builder("CountArrayVariable").with("variable_array", values).to_vec().unwrap()
    };

    let three = build(&strings);
    let four = build(&[&strings[..], &["four"]].concat());
    assert_eq!(three[0], 3);
    assert_eq!(four[0], 4);
    assert_eq!(three[1..], four[1..three.len()]);
    assert_eq!(&four[three.len()..], b"\x04four");
}

#[test]
fn child_constraints_select_children() {
    let codec = test_packets();
    for value in 0u8..16 {
        let bytes = vec![value << 4, 0x01, 0x34, 0x12];
        let parent = codec.view("ParentTwo", bytes);
        assert!(parent.is_valid());
        assert_that!(parent.get("four_bits"), eq(four_bits(value.into())));
        assert_eq!(
            parent.clone().specialize("ChildTwoThree").is_valid(),
            value == 3,
            "four_bits = {value}"
        );
        // ChildTwoTwoThree also requires more_bits = THREE.
        assert!(!parent.specialize("ChildTwoTwo").specialize("ChildTwoTwoThree").is_valid());
    }
}

#[test]
fn views_share_across_threads() {
    let codec = test_packets();
    let view = codec.view("Parent", vec![0x12, 0x02, 0xa1, 0xa2, 0xb1]).specialize("Child");
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let view = view.clone();
            std::thread::spawn(move || view.is_valid() && view.get("field_name") == Value::from(0xa2a1u16))
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }
}

#[test]
fn oversized_lengths_are_invalid() {
    let codec = test_packets();
    let mut sized = vec![0xff; 8];
    sized.extend([0x01, 0x02]);
    assert!(!codec.view("LongSizedPayload", sized).is_valid());

    let mut counted = vec![0xfe];
    counted.extend([0xff; 7]);
    counted.extend([0x01, 0x02]);
    assert!(!codec.view("LongCountArray", counted).is_valid());

    // A sane length on the same layout is accepted.
    let view = codec.view("LongSizedPayload", vec![1, 0, 0, 0, 0, 0, 0, 0, 0xaa, 0xbb]);
    assert!(view.is_valid());
    assert_eq!(&view.payload()[..], &[0xaa]);
    assert_eq!(view.get("tail"), Value::Integer(0xbb));
}
