use super::{
    as_bytes, to_hash, to_vec, to_writer,
    types::{Address, Hash, U256},
    Error, Writer,
};
use serde::Serialize;
use uint::hex::FromHex;

use core::fmt::Debug;

struct AssertWriter<'a, I>
where
    I: Iterator<Item = (&'a str, &'a str)>,
{
    expected_iter: I,
}

struct Slot<'a>(&'a [u8]);

impl<'a> Debug for Slot<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for b in self.0 {
            f.write_fmt(format_args!("{:02x}", b))?;
        }
        Ok(())
    }
}

impl<'a> PartialEq for Slot<'a> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<'a, I> Writer for AssertWriter<'a, I>
where
    I: Iterator<Item = (&'a str, &'a str)>,
{
    fn write(&mut self, slot: &[u8]) {
        match self.expected_iter.next() {
            Some((expected, line)) => {
                assert_eq!(slot.len(), 32, "Each slot should have 32 bytes.");
                println!("{}", line);

                let expected = <[u8; 32]>::from_hex(expected).unwrap();
                assert_eq!(
                    Slot(slot),
                    Slot(expected.as_slice()),
                    "slot did not match the expected value"
                );
            }
            None => panic!("Expected end of data, got {:?}", Slot(slot)),
        }
    }
}

/// Compare the encoding of `value` slot by slot. Each non-empty line of
/// `expected` starts with a 32 byte hex word, anything after it is a comment.
fn serialize_and_compare<T: Serialize>(value: &T, expected: &str) {
    let mut expected_iter = expected
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .map(|line| (&line.trim()[..64], line));
    let mut writer = AssertWriter {
        expected_iter: expected_iter.by_ref(),
    };
    to_writer(value, &mut writer).unwrap();
    assert!(
        expected_iter.next().is_none(),
        "serializer wrote less data than expected"
    );
}

#[test]
fn u64_word() {
    let d: u64 = 0x1337000012341111;
    serialize_and_compare(
        &d,
        "
        0000000000000000000000000000000000000000000000001337000012341111
        ",
    );
}

#[test]
fn negative_integers_are_sign_extended() {
    let d: (i16, i64) = (-2, 5);
    serialize_and_compare(
        &d,
        "
        fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffe // -2
        0000000000000000000000000000000000000000000000000000000000000005 // 5
        ",
    );
}

#[test]
fn address_is_right_aligned() {
    let mut addr = Address::default();
    addr.0[0] = 0xaa;
    addr.0[19] = 0xbb;
    serialize_and_compare(
        &addr,
        "
        000000000000000000000000aa000000000000000000000000000000000000bb
        ",
    );
}

#[test]
fn hash_is_left_aligned() {
    let mut hash = Hash::default();
    hash.0[0] = 0x12;
    serialize_and_compare(
        &hash,
        "
        1200000000000000000000000000000000000000000000000000000000000000
        ",
    );
}

#[derive(Serialize)]
struct Mixed {
    version: u64,
    is_final: bool,
    #[serde(with = "as_bytes")]
    data: Vec<u8>,
    list: Vec<u16>,
    amount: U256,
}

#[test]
fn struct_fields_in_declaration_order() {
    let d = Mixed {
        version: 0x2222,
        is_final: true,
        data: vec![0xa1, 0xa2, 0xa3, 0xa4],
        list: vec![1, 2],
        amount: U256::from(0xffu64),
    };
    serialize_and_compare(
        &d,
        "
        0000000000000000000000000000000000000000000000000000000000002222 // version
        0000000000000000000000000000000000000000000000000000000000000001 // is_final
        0000000000000000000000000000000000000000000000000000000000000004 // data length
        a1a2a3a400000000000000000000000000000000000000000000000000000000 // data
        0000000000000000000000000000000000000000000000000000000000000002 // list length
        0000000000000000000000000000000000000000000000000000000000000001 // list[0]
        0000000000000000000000000000000000000000000000000000000000000002 // list[1]
        00000000000000000000000000000000000000000000000000000000000000ff // amount
        ",
    );
}

#[test]
fn empty_bytes_write_only_length() {
    #[derive(Serialize)]
    struct Empty {
        #[serde(with = "as_bytes")]
        data: Vec<u8>,
    }
    serialize_and_compare(
        &Empty { data: vec![] },
        "
        0000000000000000000000000000000000000000000000000000000000000000
        ",
    );
}

#[test]
fn bytes_spanning_two_words() {
    #[derive(Serialize)]
    struct Long {
        #[serde(with = "as_bytes")]
        data: Vec<u8>,
    }
    let data: Vec<u8> = (1..=33).collect();
    serialize_and_compare(
        &Long { data },
        "
        0000000000000000000000000000000000000000000000000000000000000021 // 33 bytes
        0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20
        2100000000000000000000000000000000000000000000000000000000000000
        ",
    );
}

#[test]
fn nested_sequences() {
    let d: Vec<Vec<u8>> = vec![vec![7], vec![]];
    serialize_and_compare(
        &d,
        "
        0000000000000000000000000000000000000000000000000000000000000002 // outer length
        0000000000000000000000000000000000000000000000000000000000000001 // [0] length
        0000000000000000000000000000000000000000000000000000000000000007 // [0][0]
        0000000000000000000000000000000000000000000000000000000000000000 // [1] length
        ",
    );
}

#[test]
fn string_is_length_prefixed() {
    serialize_and_compare(
        &"abc",
        "
        0000000000000000000000000000000000000000000000000000000000000003
        6162630000000000000000000000000000000000000000000000000000000000
        ",
    );
}

#[test]
fn unrepresentable_types_are_rejected() {
    assert_eq!(to_vec(&1.5f64), Err(Error::TypeNotRepresentable("f64")));
    assert_eq!(
        to_vec(&Some(1u8)),
        Err(Error::TypeNotRepresentable("Option"))
    );
    let map: std::collections::BTreeMap<u8, u8> = [(1, 2)].into_iter().collect();
    assert_eq!(to_vec(&map), Err(Error::TypeNotRepresentable("map")));
}

#[test]
fn hash_of_empty_encoding_is_keccak_of_nothing() {
    let expected =
        <[u8; 32]>::from_hex("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470")
            .unwrap();
    assert_eq!(to_hash(&[0u8; 0]).unwrap(), Hash(expected));
}

#[test]
fn hash_matches_hash_of_bytes() {
    use sha3::{Digest, Keccak256};

    let d = Mixed {
        version: 3,
        is_final: false,
        data: vec![1, 2, 3],
        list: vec![],
        amount: U256::from(10u64),
    };
    let bytes = to_vec(&d).unwrap();
    assert_eq!(bytes.len(), 6 * 32);
    let expected: [u8; 32] = Keccak256::digest(&bytes).into();
    assert_eq!(to_hash(&d).unwrap(), Hash(expected));
}
