//! Big-endian fixed width byte codec.
//!
//! Every multi-byte value is written most significant byte first. Doubles are
//! stored as their IEEE-754 bit pattern. Envelopes are written as all minimums
//! followed by all maximums, in axis order.

use smallvec::SmallVec;

use crate::envelope::{Coords, Envelope};
use crate::rtree::rtree_types::{SpatialError, SpatialResult};

/// A value with a fixed encoded width.
pub trait FixedWidth: Sized + Copy {
    const WIDTH: usize;

    /// Writes `self` at `offset`, returning the number of bytes written.
    fn encode(self, buf: &mut [u8], offset: usize) -> SpatialResult<usize>;

    fn decode(buf: &[u8], offset: usize) -> SpatialResult<Self>;
}

#[inline]
pub fn check_bounds(len: usize, offset: usize, needed: usize) -> SpatialResult<()> {
    let available = len.saturating_sub(offset);
    if offset > len || needed > available {
        return Err(SpatialError::MalformedData {
            offset,
            needed,
            available,
        });
    }
    Ok(())
}

macro_rules! impl_fixed_width {
    ($($t:ty),*) => {
        $(
            impl FixedWidth for $t {
                const WIDTH: usize = std::mem::size_of::<$t>();

                fn encode(self, buf: &mut [u8], offset: usize) -> SpatialResult<usize> {
                    check_bounds(buf.len(), offset, Self::WIDTH)?;
                    buf[offset..offset + Self::WIDTH].copy_from_slice(&self.to_be_bytes());
                    Ok(Self::WIDTH)
                }

                fn decode(buf: &[u8], offset: usize) -> SpatialResult<Self> {
                    check_bounds(buf.len(), offset, Self::WIDTH)?;
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&buf[offset..offset + Self::WIDTH]);
                    Ok(<$t>::from_be_bytes(raw))
                }
            }
        )*
    };
}

impl_fixed_width!(i8, u8, i16, u16, i32, u32, i64, u64, f64);

/// Writes `value` at `offset`, returning the number of bytes written.
pub fn encode<T: FixedWidth>(value: T, buf: &mut [u8], offset: usize) -> SpatialResult<usize> {
    value.encode(buf, offset)
}

pub fn decode<T: FixedWidth>(buf: &[u8], offset: usize) -> SpatialResult<T> {
    T::decode(buf, offset)
}

/// Encoded size of an envelope with `dimension` axes.
pub const fn envelope_width(dimension: usize) -> usize {
    2 * dimension * f64::WIDTH
}

pub fn encode_envelope(envelope: &Envelope, buf: &mut [u8], offset: usize) -> SpatialResult<usize> {
    let width = envelope_width(envelope.dimension());
    check_bounds(buf.len(), offset, width)?;
    let mut pos = offset;
    for v in envelope.mins().iter().chain(envelope.maxs()) {
        pos += v.encode(buf, pos)?;
    }
    Ok(width)
}

pub fn decode_envelope(buf: &[u8], offset: usize, dimension: usize) -> SpatialResult<Envelope> {
    check_bounds(buf.len(), offset, envelope_width(dimension))?;
    let mut min: Coords = SmallVec::with_capacity(dimension);
    let mut max: Coords = SmallVec::with_capacity(dimension);
    for axis in 0..dimension {
        min.push(f64::decode(buf, offset + axis * f64::WIDTH)?);
    }
    let maxs = offset + dimension * f64::WIDTH;
    for axis in 0..dimension {
        max.push(f64::decode(buf, maxs + axis * f64::WIDTH)?);
    }
    Ok(Envelope::from_coords(min, max))
}

/// Sequential writer over a page buffer.
pub struct PageWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> PageWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        PageWriter { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn put<T: FixedWidth>(&mut self, value: T) -> SpatialResult<()> {
        self.pos += value.encode(self.buf, self.pos)?;
        Ok(())
    }

    pub fn put_envelope(&mut self, envelope: &Envelope) -> SpatialResult<()> {
        self.pos += encode_envelope(envelope, self.buf, self.pos)?;
        Ok(())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> SpatialResult<()> {
        check_bounds(self.buf.len(), self.pos, bytes.len())?;
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }
}

/// Sequential reader over a page buffer.
pub struct PageReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PageReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        PageReader { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn get<T: FixedWidth>(&mut self) -> SpatialResult<T> {
        let value = T::decode(self.buf, self.pos)?;
        self.pos += T::WIDTH;
        Ok(value)
    }

    pub fn get_envelope(&mut self, dimension: usize) -> SpatialResult<Envelope> {
        let envelope = decode_envelope(self.buf, self.pos, dimension)?;
        self.pos += envelope_width(dimension);
        Ok(envelope)
    }

    pub fn get_bytes(&mut self, len: usize) -> SpatialResult<&'a [u8]> {
        check_bounds(self.buf.len(), self.pos, len)?;
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_layout() {
        let mut buf = [0u8; 8];
        assert_eq!(encode(0x0102_0304u32, &mut buf, 2).unwrap(), 4);
        assert_eq!(buf, [0, 0, 1, 2, 3, 4, 0, 0]);
        assert_eq!(decode::<u32>(&buf, 2).unwrap(), 0x0102_0304);

        encode(-2i16, &mut buf, 0).unwrap();
        assert_eq!(&buf[..2], &[0xff, 0xfe]);
    }

    #[test]
    fn test_f64_bit_pattern() {
        let mut buf = [0u8; 8];
        encode(1.0f64, &mut buf, 0).unwrap();
        assert_eq!(buf, [0x3f, 0xf0, 0, 0, 0, 0, 0, 0]);

        encode(f64::NEG_INFINITY, &mut buf, 0).unwrap();
        assert_eq!(decode::<f64>(&buf, 0).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut buf = [0u8; 6];
        let err = encode(7u64, &mut buf, 0).unwrap_err();
        assert!(matches!(
            err,
            SpatialError::MalformedData {
                offset: 0,
                needed: 8,
                available: 6
            }
        ));

        let err = decode::<u16>(&buf, 10).unwrap_err();
        assert!(matches!(
            err,
            SpatialError::MalformedData {
                offset: 10,
                needed: 2,
                available: 0
            }
        ));
    }

    #[test]
    fn test_envelope_order_is_mins_then_maxs() {
        let env = Envelope::cube([1.0, 2.0, 3.0], [4.0, 5.0, 6.0]);
        let mut buf = vec![0u8; envelope_width(3)];
        encode_envelope(&env, &mut buf, 0).unwrap();
        for (i, expected) in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0].iter().enumerate() {
            assert_eq!(decode::<f64>(&buf, i * 8).unwrap(), *expected);
        }
        assert_eq!(decode_envelope(&buf, 0, 3).unwrap(), env);
        assert!(decode_envelope(&buf, 8, 3).is_err());
    }

    #[test]
    fn test_page_cursor() {
        let mut buf = [0u8; 64];
        let mut writer = PageWriter::new(&mut buf);
        writer.put(1u8).unwrap();
        writer.put(300u16).unwrap();
        writer.put_envelope(&Envelope::rect(0.0, 1.0, 2.0, 3.0)).unwrap();
        writer.put_bytes(b"ab").unwrap();
        assert_eq!(writer.position(), 1 + 2 + 32 + 2);

        let mut reader = PageReader::new(&buf);
        assert_eq!(reader.get::<u8>().unwrap(), 1);
        assert_eq!(reader.get::<u16>().unwrap(), 300);
        assert_eq!(
            reader.get_envelope(2).unwrap(),
            Envelope::rect(0.0, 1.0, 2.0, 3.0)
        );
        assert_eq!(reader.get_bytes(2).unwrap(), b"ab");
    }
}
