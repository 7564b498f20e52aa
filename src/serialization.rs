//! Append/read byte buffer with typed save and load helpers.
//!
//! Everything that crosses a block boundary (queued messages, collective
//! values, blocks swapped out to storage) travels as a [`BinaryBuffer`].
//! Scalars are little endian; collection lengths are unsigned varints.

use std::{
    collections::{BTreeMap, VecDeque},
    hash::Hash,
};

use byteorder::{ByteOrder, LittleEndian};
use hashbrown::{HashMap, HashSet};
use unsigned_varint::{decode, encode};

use crate::error::{Error, Result};

/// A growable byte buffer with a read cursor. Writes always append; reads
/// advance `position` and fail once the buffer runs dry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BinaryBuffer {
    buffer: Vec<u8>,
    position: usize,
}

impl BinaryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Total number of bytes written.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    /// True once every written byte has been read.
    pub fn exhausted(&self) -> bool {
        self.position >= self.buffer.len()
    }

    /// Rewinds the read cursor.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.position = 0;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }

    /// Appends the unread part of `other`.
    pub fn append(&mut self, other: &BinaryBuffer) {
        self.buffer.extend_from_slice(&other.buffer[other.position..]);
    }

    pub fn save_binary(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn load_binary(&mut self, n: usize) -> Result<&[u8]> {
        if self.remaining() < n {
            Err(Error::UnexpectedEnd {
                wanted: n,
                left: self.remaining(),
            })?
        }
        let start = self.position;
        self.position += n;
        Ok(&self.buffer[start..self.position])
    }

    pub fn save_len(&mut self, n: usize) {
        let mut buf = encode::u64_buffer();
        let bytes = encode::u64(n as u64, &mut buf);
        self.buffer.extend_from_slice(bytes);
    }

    pub fn load_len(&mut self) -> Result<usize> {
        let (n, rest) = decode::u64(&self.buffer[self.position..])?;
        self.position = self.buffer.len() - rest.len();
        usize::try_from(n).map_err(|_| Error::InvalidData("length overflows usize"))
    }
}

/// Types that can be written to and read back from a [`BinaryBuffer`].
///
/// `load(save(x))` must be behaviorally equivalent to `x`.
pub trait Serialization: Sized {
    fn save(&self, bb: &mut BinaryBuffer);
    fn load(bb: &mut BinaryBuffer) -> Result<Self>;
}

/// Free-function form, handy as the default for `enqueue_with`.
pub fn save<T: Serialization>(bb: &mut BinaryBuffer, x: &T) {
    x.save(bb)
}

pub fn load<T: Serialization>(bb: &mut BinaryBuffer) -> Result<T> {
    T::load(bb)
}

macro_rules! scalar {
    ($ty:ty, $n:expr, $write:ident, $read:ident) => {
        impl Serialization for $ty {
            fn save(&self, bb: &mut BinaryBuffer) {
                let mut buf = [0u8; $n];
                LittleEndian::$write(&mut buf, *self);
                bb.save_binary(&buf);
            }

            fn load(bb: &mut BinaryBuffer) -> Result<Self> {
                Ok(LittleEndian::$read(bb.load_binary($n)?))
            }
        }
    };
}

scalar!(u16, 2, write_u16, read_u16);
scalar!(u32, 4, write_u32, read_u32);
scalar!(u64, 8, write_u64, read_u64);
scalar!(i16, 2, write_i16, read_i16);
scalar!(i32, 4, write_i32, read_i32);
scalar!(i64, 8, write_i64, read_i64);
scalar!(f32, 4, write_f32, read_f32);
scalar!(f64, 8, write_f64, read_f64);

impl Serialization for u8 {
    fn save(&self, bb: &mut BinaryBuffer) {
        bb.save_binary(&[*self]);
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        Ok(bb.load_binary(1)?[0])
    }
}

impl Serialization for i8 {
    fn save(&self, bb: &mut BinaryBuffer) {
        (*self as u8).save(bb);
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        Ok(u8::load(bb)? as i8)
    }
}

impl Serialization for bool {
    fn save(&self, bb: &mut BinaryBuffer) {
        (*self as u8).save(bb);
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        match u8::load(bb)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::InvalidData("bool out of range")),
        }
    }
}

// usize and isize always travel as 64 bits so buffers are portable across
// workers with different pointer widths.
impl Serialization for usize {
    fn save(&self, bb: &mut BinaryBuffer) {
        (*self as u64).save(bb);
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        usize::try_from(u64::load(bb)?)
            .map_err(|_| Error::InvalidData("usize overflow"))
    }
}

impl Serialization for isize {
    fn save(&self, bb: &mut BinaryBuffer) {
        (*self as i64).save(bb);
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        isize::try_from(i64::load(bb)?)
            .map_err(|_| Error::InvalidData("isize overflow"))
    }
}

impl Serialization for () {
    fn save(&self, _: &mut BinaryBuffer) {}

    fn load(_: &mut BinaryBuffer) -> Result<Self> {
        Ok(())
    }
}

impl Serialization for String {
    fn save(&self, bb: &mut BinaryBuffer) {
        bb.save_len(self.len());
        bb.save_binary(self.as_bytes());
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        let n = bb.load_len()?;
        Ok(String::from_utf8(bb.load_binary(n)?.to_vec())?)
    }
}

impl<T: Serialization> Serialization for Vec<T> {
    fn save(&self, bb: &mut BinaryBuffer) {
        bb.save_len(self.len());
        for x in self {
            x.save(bb);
        }
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        let n = bb.load_len()?;
        let mut v = Vec::with_capacity(n.min(bb.remaining()));
        for _ in 0..n {
            v.push(T::load(bb)?);
        }
        Ok(v)
    }
}

impl<T: Serialization> Serialization for VecDeque<T> {
    fn save(&self, bb: &mut BinaryBuffer) {
        bb.save_len(self.len());
        for x in self {
            x.save(bb);
        }
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        Ok(Vec::<T>::load(bb)?.into())
    }
}

impl<T: Serialization, const N: usize> Serialization for [T; N] {
    fn save(&self, bb: &mut BinaryBuffer) {
        for x in self {
            x.save(bb);
        }
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        let mut v = Vec::with_capacity(N);
        for _ in 0..N {
            v.push(T::load(bb)?);
        }
        v.try_into()
            .map_err(|_| Error::InvalidData("array length"))
    }
}

impl<T: Serialization> Serialization for Option<T> {
    fn save(&self, bb: &mut BinaryBuffer) {
        match self {
            Some(x) => {
                true.save(bb);
                x.save(bb);
            }
            None => false.save(bb),
        }
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        if bool::load(bb)? {
            Ok(Some(T::load(bb)?))
        } else {
            Ok(None)
        }
    }
}

impl<A: Serialization, B: Serialization> Serialization for (A, B) {
    fn save(&self, bb: &mut BinaryBuffer) {
        self.0.save(bb);
        self.1.save(bb);
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        Ok((A::load(bb)?, B::load(bb)?))
    }
}

impl<A: Serialization, B: Serialization, C: Serialization> Serialization
    for (A, B, C)
{
    fn save(&self, bb: &mut BinaryBuffer) {
        self.0.save(bb);
        self.1.save(bb);
        self.2.save(bb);
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        Ok((A::load(bb)?, B::load(bb)?, C::load(bb)?))
    }
}

impl<K, V> Serialization for HashMap<K, V>
where
    K: Serialization + Hash + Eq,
    V: Serialization,
{
    fn save(&self, bb: &mut BinaryBuffer) {
        bb.save_len(self.len());
        for (k, v) in self {
            k.save(bb);
            v.save(bb);
        }
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        let n = bb.load_len()?;
        let mut map = HashMap::with_capacity(n.min(bb.remaining()));
        for _ in 0..n {
            let k = K::load(bb)?;
            map.insert(k, V::load(bb)?);
        }
        Ok(map)
    }
}

impl<T> Serialization for HashSet<T>
where
    T: Serialization + Hash + Eq,
{
    fn save(&self, bb: &mut BinaryBuffer) {
        bb.save_len(self.len());
        for x in self {
            x.save(bb);
        }
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        let n = bb.load_len()?;
        let mut set = HashSet::with_capacity(n.min(bb.remaining()));
        for _ in 0..n {
            set.insert(T::load(bb)?);
        }
        Ok(set)
    }
}

impl<K, V> Serialization for BTreeMap<K, V>
where
    K: Serialization + Ord,
    V: Serialization,
{
    fn save(&self, bb: &mut BinaryBuffer) {
        bb.save_len(self.len());
        for (k, v) in self {
            k.save(bb);
            v.save(bb);
        }
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        let n = bb.load_len()?;
        let mut map = BTreeMap::new();
        for _ in 0..n {
            let k = K::load(bb)?;
            map.insert(k, V::load(bb)?);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Serialization>(x: &T) -> T {
        let mut bb = BinaryBuffer::new();
        x.save(&mut bb);
        let y = T::load(&mut bb).unwrap();
        assert!(bb.exhausted());
        y
    }

    #[test]
    fn scalars_survive() {
        assert_eq!(round_trip(&-7i32), -7);
        assert_eq!(round_trip(&u64::MAX), u64::MAX);
        assert_eq!(round_trip(&1.5f32), 1.5);
        assert_eq!(round_trip(&usize::MAX), usize::MAX);
        assert!(round_trip(&true));
    }

    #[test]
    fn nested_collections_survive() {
        let v = vec![(1u32, "one".to_string()), (2, "two".to_string())];
        assert_eq!(round_trip(&v), v);

        let mut map = HashMap::new();
        map.insert(3usize, vec![Some(1.0f64), None]);
        assert_eq!(round_trip(&map), map);

        assert_eq!(round_trip(&[4u8, 5, 6]), [4, 5, 6]);
    }

    #[test]
    fn sequential_values_read_in_order() {
        let mut bb = BinaryBuffer::new();
        1u16.save(&mut bb);
        "x".to_string().save(&mut bb);
        9i64.save(&mut bb);

        assert_eq!(u16::load(&mut bb).unwrap(), 1);
        assert_eq!(String::load(&mut bb).unwrap(), "x");
        assert_eq!(i64::load(&mut bb).unwrap(), 9);
        assert!(bb.exhausted());
    }

    #[test]
    fn reading_past_the_end_fails() {
        let mut bb = BinaryBuffer::new();
        7u16.save(&mut bb);
        match u32::load(&mut bb) {
            Err(Error::UnexpectedEnd { wanted: 4, left: 2 }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn append_copies_only_unread_bytes() {
        let mut a = BinaryBuffer::new();
        1u8.save(&mut a);
        2u8.save(&mut a);
        u8::load(&mut a).unwrap();

        let mut b = BinaryBuffer::new();
        b.append(&a);
        assert_eq!(b.as_slice(), &[2]);
    }

    #[test]
    fn bad_bool_is_rejected() {
        let mut bb = BinaryBuffer::from_vec(vec![2]);
        assert!(matches!(bool::load(&mut bb), Err(Error::InvalidData(_))));
    }
}
