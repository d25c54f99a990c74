//! Canonical encoding serializer.
//!
//! Every value is written as a sequence of 32 byte words:
//! - Integers and booleans: one big-endian word, signed integers are sign
//!   extended.
//! - `serialize_bytes` (fixed-size byte arrays like [Hash][super::types::Hash]
//!   or [U256][super::types::U256]): the bytes left aligned, zero padded to a
//!   multiple of [SLOT_SIZE]. Types that need a different alignment (like
//!   [Address][super::types::Address]) pre-pad themselves.
//! - Strings: length word followed by the padded UTF-8 bytes.
//! - Sequences: length word followed by the elements.
//! - Structs and tuples: their fields in declaration order, no header.
//!
//! Dynamic byte strings use [as_bytes][super::as_bytes]. Values without a
//! canonical representation (floats, maps, options, enums) are rejected.

use super::error::{Error, Result};
use serde::{
    ser::{self, Impossible, SerializeSeq, SerializeStruct, SerializeTuple, SerializeTupleStruct},
    Serialize,
};

pub const SLOT_SIZE: usize = 32;

/// Sink for the encoded words.
pub trait Writer {
    fn write(&mut self, slot: &[u8]);
}

impl Writer for Vec<u8> {
    fn write(&mut self, slot: &[u8]) {
        self.extend_from_slice(slot);
    }
}

#[derive(Debug)]
pub struct Serializer<'a, W: Writer> {
    writer: &'a mut W,
}

impl<'a, W: Writer> Serializer<'a, W> {
    pub fn new(writer: &'a mut W) -> Self {
        Self { writer }
    }

    fn write_right_aligned(&mut self, bytes: &[u8], fill: u8) {
        debug_assert!(bytes.len() <= SLOT_SIZE);
        let mut slot = [fill; SLOT_SIZE];
        slot[SLOT_SIZE - bytes.len()..].copy_from_slice(bytes);
        self.writer.write(&slot);
    }

    fn write_unsigned(&mut self, bytes: &[u8]) {
        self.write_right_aligned(bytes, 0);
    }

    fn write_signed(&mut self, bytes: &[u8], negative: bool) {
        self.write_right_aligned(bytes, if negative { 0xff } else { 0 });
    }

    fn write_len(&mut self, len: usize) {
        self.write_unsigned(&(len as u64).to_be_bytes());
    }

    /// Writes `bytes` left aligned, padding the last slot with zeros.
    fn write_padded(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(SLOT_SIZE) {
            if chunk.len() == SLOT_SIZE {
                self.writer.write(chunk);
            } else {
                let mut slot = [0u8; SLOT_SIZE];
                slot[..chunk.len()].copy_from_slice(chunk);
                self.writer.write(&slot);
            }
        }
    }
}

/// Encode `value` into `writer`.
pub fn to_writer<T, W>(value: &T, writer: &mut W) -> Result<()>
where
    T: Serialize + ?Sized,
    W: Writer,
{
    let mut serializer = Serializer::new(writer);
    value.serialize(&mut serializer)
}

/// Encode `value` into a freshly allocated byte vector.
pub fn to_vec<T>(value: &T) -> Result<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    let mut buf = Vec::new();
    to_writer(value, &mut buf)?;
    Ok(buf)
}

impl<'a, 'w, W: Writer> ser::Serializer for &'a mut Serializer<'w, W> {
    type Ok = ();
    type Error = Error;

    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Impossible<(), Error>;
    type SerializeMap = Impossible<(), Error>;
    type SerializeStruct = Self;
    type SerializeStructVariant = Impossible<(), Error>;

    fn serialize_bool(self, v: bool) -> Result<()> {
        self.write_unsigned(&[v as u8]);
        Ok(())
    }

    fn serialize_i8(self, v: i8) -> Result<()> {
        self.write_signed(&v.to_be_bytes(), v < 0);
        Ok(())
    }

    fn serialize_i16(self, v: i16) -> Result<()> {
        self.write_signed(&v.to_be_bytes(), v < 0);
        Ok(())
    }

    fn serialize_i32(self, v: i32) -> Result<()> {
        self.write_signed(&v.to_be_bytes(), v < 0);
        Ok(())
    }

    fn serialize_i64(self, v: i64) -> Result<()> {
        self.write_signed(&v.to_be_bytes(), v < 0);
        Ok(())
    }

    fn serialize_i128(self, v: i128) -> Result<()> {
        self.write_signed(&v.to_be_bytes(), v < 0);
        Ok(())
    }

    fn serialize_u8(self, v: u8) -> Result<()> {
        self.write_unsigned(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_u16(self, v: u16) -> Result<()> {
        self.write_unsigned(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_u32(self, v: u32) -> Result<()> {
        self.write_unsigned(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_u64(self, v: u64) -> Result<()> {
        self.write_unsigned(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_u128(self, v: u128) -> Result<()> {
        self.write_unsigned(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_f32(self, _: f32) -> Result<()> {
        Err(Error::TypeNotRepresentable("f32"))
    }

    fn serialize_f64(self, _: f64) -> Result<()> {
        Err(Error::TypeNotRepresentable("f64"))
    }

    fn serialize_char(self, _: char) -> Result<()> {
        Err(Error::TypeNotRepresentable("char"))
    }

    fn serialize_str(self, v: &str) -> Result<()> {
        self.write_len(v.len());
        self.write_padded(v.as_bytes());
        Ok(())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<()> {
        self.write_padded(v);
        Ok(())
    }

    fn serialize_none(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("Option"))
    }

    fn serialize_some<T: ?Sized>(self, _: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("Option"))
    }

    fn serialize_unit(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("()"))
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<()> {
        Err(Error::TypeNotRepresentable(name))
    }

    fn serialize_unit_variant(self, name: &'static str, _: u32, _: &'static str) -> Result<()> {
        Err(Error::TypeNotRepresentable(name))
    }

    fn serialize_newtype_struct<T: ?Sized>(self, _: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized>(
        self,
        name: &'static str,
        _: u32,
        _: &'static str,
        _: &T,
    ) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable(name))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq> {
        let len = len.ok_or(Error::UnknownLength)?;
        self.write_len(len);
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        name: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(Error::TypeNotRepresentable(name))
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap> {
        Err(Error::TypeNotRepresentable("map"))
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeStruct> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(Error::TypeNotRepresentable(name))
    }
}

impl<'a, 'w, W: Writer> SerializeSeq for &'a mut Serializer<'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'w, W: Writer> SerializeTuple for &'a mut Serializer<'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'w, W: Writer> SerializeTupleStruct for &'a mut Serializer<'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'w, W: Writer> SerializeStruct for &'a mut Serializer<'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, _: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}
