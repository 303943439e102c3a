//! A minimal, purpose-built EBML engine: variable-length integer encoding,
//! element construction, and position-tracking read/write over a seekable
//! stream.
//!
//! This crate hand-rolls this layer rather than depending on an external
//! EBML/Matroska crate — see `DESIGN.md` for why nothing in the retrieval
//! pack fit the streaming, back-patched-placeholder API the container engine
//! needs (spec.md §4.2 treats an EBML tree-manipulation *library* as an
//! external collaborator, but the actual file-position bookkeeping is the
//! dominant, must-be-built component).

pub mod ids;

use std::io::{Read, Seek, SeekFrom, Write};

use failure::Error;

use crate::error::{format_error, from_io, invariant};

/// Number of bytes an EBML element ID occupies, derived from the count of
/// leading zero bits in its first byte (1..=4 for any ID this crate reads
/// or writes).
pub fn id_width(first_byte: u8) -> Option<u8> {
    let w = size_width(first_byte)?;
    if w > 4 {
        None
    } else {
        Some(w)
    }
}

/// Number of bytes an EBML vint (size, or generic length descriptor)
/// occupies.
pub fn size_width(first_byte: u8) -> Option<u8> {
    if first_byte == 0 {
        return None;
    }
    Some(first_byte.leading_zeros() as u8 + 1)
}

/// Minimal-width big-endian encoding of an element ID (IDs already carry
/// their class/marker bits, e.g. `0x1A45DFA3`; this just trims leading
/// all-zero bytes).
pub fn encode_id(id: u32) -> Vec<u8> {
    let bytes = id.to_be_bytes();
    let mut i = 0;
    while i < 3 && bytes[i] == 0 {
        i += 1;
    }
    bytes[i..].to_vec()
}

/// The smallest vint width that can hold `value` (1..=8 bytes, 7 data bits
/// per byte).
pub fn minimal_size_width(value: u64) -> u8 {
    let mut w = 1u8;
    while w < 8 && value >= (1u64 << (7 * u32::from(w))) {
        w += 1;
    }
    w
}

/// Encodes `value` as an EBML vint forced to exactly `width` bytes. Used
/// both for natural minimal-width sizes and for the 8-byte-wide
/// Segment/Cluster size fields that get back-patched later.
pub fn encode_size(value: u64, width: u8) -> Vec<u8> {
    let marker = 1u64 << (7 * u32::from(width));
    let combined = marker | value;
    combined.to_be_bytes()[(8 - width as usize)..].to_vec()
}

pub fn encode_size_minimal(value: u64) -> Vec<u8> {
    encode_size(value, minimal_size_width(value))
}

/// Minimal-width big-endian unsigned integer payload (EBML "uinteger"),
/// always at least one byte even for zero.
pub fn uint_min_bytes(value: u64) -> Vec<u8> {
    if value == 0 {
        return vec![0];
    }
    let bytes = value.to_be_bytes();
    let mut i = 0;
    while i < 7 && bytes[i] == 0 {
        i += 1;
    }
    bytes[i..].to_vec()
}

pub fn read_uint(data: &[u8]) -> u64 {
    let mut v = 0u64;
    for b in data {
        v = (v << 8) | u64::from(*b);
    }
    v
}

pub fn read_float(data: &[u8]) -> f64 {
    match data.len() {
        4 => f32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64,
        8 => f64::from_be_bytes([data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7]]),
        _ => 0.0,
    }
}

/// Appends a complete `id { payload }` element to an in-memory buffer, with
/// a minimal-width size field. Most Matroska elements (SeekHead, Tracks,
/// Cues, and Info/SeekHead at finalize time) are built this way: fully
/// assembled in memory, then written in one shot.
pub fn push_element(buf: &mut Vec<u8>, id: u32, payload: &[u8]) {
    buf.extend(encode_id(id));
    buf.extend(encode_size_minimal(payload.len() as u64));
    buf.extend_from_slice(payload);
}

pub fn push_uint(buf: &mut Vec<u8>, id: u32, value: u64) {
    push_element(buf, id, &uint_min_bytes(value));
}

pub fn push_string(buf: &mut Vec<u8>, id: u32, s: &str) {
    push_element(buf, id, s.as_bytes());
}

pub fn push_float(buf: &mut Vec<u8>, id: u32, value: f64) {
    push_element(buf, id, &value.to_be_bytes());
}

/// An EBML element header read back from a stream: its id, its declared
/// payload size, and the file position its payload starts at.
#[derive(Debug, Clone, Copy)]
pub struct ElementHeader {
    pub id: u32,
    pub size: u64,
    pub payload_pos: u64,
}

/// Builds exactly `total_len` bytes of a single Void element: useful both
/// to replace an empty Cluster (its full footprint, head included, becomes
/// one Void) and to fill gaps between Segment children at finalize time.
///
/// A Void element needs at least 1 id byte + 1 size byte, so any gap
/// narrower than 2 bytes cannot be represented — this is exactly
/// `SPEC_FULL.md`'s "sub-2-byte gap" invariant violation.
pub fn void_bytes(total_len: u64) -> Result<Vec<u8>, Error> {
    if total_len == 0 {
        return Ok(Vec::new());
    }
    if total_len < 2 {
        return Err(invariant(format!("{}-byte gap is too small to Void-fill", total_len)));
    }
    for width in 1u8..=8 {
        let overhead = 1 + u64::from(width);
        if total_len < overhead {
            continue;
        }
        let payload_len = total_len - overhead;
        let fits = width == 8 || payload_len < (1u64 << (7 * u32::from(width)));
        if fits {
            let mut out = Vec::with_capacity(total_len as usize);
            out.push(ids::VOID as u8);
            out.extend(encode_size(payload_len, width));
            out.resize(total_len as usize, 0);
            return Ok(out);
        }
    }
    Err(invariant(format!("{}-byte gap is too large to Void-fill", total_len)))
}

/// Position-tracking writer over any seekable sink.
pub struct Writer<W> {
    pub inner: W,
}

impl<W: Write + Seek> Writer<W> {
    pub fn new(inner: W) -> Self {
        Writer { inner }
    }

    pub fn pos(&mut self) -> Result<u64, Error> {
        self.inner.seek(SeekFrom::Current(0)).map_err(from_io)
    }

    pub fn seek_to(&mut self, pos: u64) -> Result<(), Error> {
        self.inner.seek(SeekFrom::Start(pos)).map_err(from_io)?;
        Ok(())
    }

    pub fn seek_end(&mut self) -> Result<u64, Error> {
        self.inner.seek(SeekFrom::End(0)).map_err(from_io)
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        self.inner.write_all(data).map_err(from_io)
    }

    pub fn write_element(&mut self, id: u32, payload: &[u8]) -> Result<(), Error> {
        let mut buf = Vec::with_capacity(payload.len() + 9);
        push_element(&mut buf, id, payload);
        self.write_bytes(&buf)
    }

    /// Writes `id` followed by an 8-byte-wide size field holding
    /// `placeholder_value`, returning the file position of the size field so
    /// it can be overwritten once the real size is known.
    pub fn write_reserved_header(&mut self, id: u32, placeholder_value: u64) -> Result<u64, Error> {
        self.write_bytes(&encode_id(id))?;
        let size_pos = self.pos()?;
        self.write_bytes(&encode_size(placeholder_value, 8))?;
        Ok(size_pos)
    }

    /// Overwrites a previously reserved 8-byte size field in place, then
    /// restores the prior write cursor.
    pub fn backpatch_size8(&mut self, size_pos: u64, value: u64) -> Result<(), Error> {
        let cur = self.pos()?;
        self.seek_to(size_pos)?;
        self.write_bytes(&encode_size(value, 8))?;
        self.seek_to(cur)?;
        Ok(())
    }

    /// Writes `len` raw zero bytes at the current position — a *reserved
    /// region*, not a real Void element — returning its start position.
    /// Used for the fixed-size SeekHead/Info placeholders carved out at
    /// segment creation, which later get overwritten by the real elements
    /// (with any leftover space turned into a real Void by the caller).
    pub fn reserve_raw(&mut self, len: u64) -> Result<u64, Error> {
        let start = self.pos()?;
        self.write_bytes(&vec![0u8; len as usize])?;
        Ok(start)
    }

    pub fn write_void(&mut self, total_len: u64) -> Result<(), Error> {
        let bytes = void_bytes(total_len)?;
        self.write_bytes(&bytes)
    }
}

/// Position-tracking reader over any seekable source.
pub struct Reader<R> {
    pub inner: R,
}

impl<R: Read + Seek> Reader<R> {
    pub fn new(inner: R) -> Self {
        Reader { inner }
    }

    pub fn pos(&mut self) -> Result<u64, Error> {
        self.inner.seek(SeekFrom::Current(0)).map_err(from_io)
    }

    pub fn seek_to(&mut self, pos: u64) -> Result<(), Error> {
        self.inner.seek(SeekFrom::Start(pos)).map_err(from_io)?;
        Ok(())
    }

    pub fn len(&mut self) -> Result<u64, Error> {
        let cur = self.pos()?;
        let end = self.inner.seek(SeekFrom::End(0)).map_err(from_io)?;
        self.seek_to(cur)?;
        Ok(end)
    }

    /// Reads one element ID, or `None` at a clean EOF.
    pub fn read_id(&mut self) -> Result<Option<u32>, Error> {
        let mut first = [0u8; 1];
        let n = self.inner.read(&mut first).map_err(from_io)?;
        if n == 0 {
            return Ok(None);
        }
        let width = id_width(first[0]).ok_or_else(|| format_error("invalid EBML element id"))?;
        let mut buf = [0u8; 4];
        buf[4 - width as usize] = first[0];
        if width > 1 {
            self.inner
                .read_exact(&mut buf[(4 - width as usize + 1)..])
                .map_err(from_io)?;
        }
        Ok(Some(u32::from_be_bytes(buf)))
    }

    pub fn read_size(&mut self) -> Result<u64, Error> {
        let mut first = [0u8; 1];
        self.inner.read_exact(&mut first).map_err(from_io)?;
        let width = size_width(first[0]).ok_or_else(|| format_error("invalid EBML size descriptor"))?;
        let mut buf = [0u8; 8];
        buf[8 - width as usize] = first[0];
        if width > 1 {
            self.inner
                .read_exact(&mut buf[(8 - width as usize + 1)..])
                .map_err(from_io)?;
        }
        let combined = u64::from_be_bytes(buf);
        let marker = 1u64 << (7 * u32::from(width));
        Ok(combined & !marker)
    }

    /// Reads one element header (id + size), leaving the cursor at the
    /// start of its payload.
    pub fn read_header(&mut self) -> Result<Option<ElementHeader>, Error> {
        let id = match self.read_id()? {
            None => return Ok(None),
            Some(id) => id,
        };
        let size = self.read_size()?;
        let payload_pos = self.pos()?;
        Ok(Some(ElementHeader { id, size, payload_pos }))
    }

    pub fn read_payload(&mut self, header: &ElementHeader) -> Result<Vec<u8>, Error> {
        self.seek_to(header.payload_pos)?;
        let mut buf = vec![0u8; header.size as usize];
        self.inner.read_exact(&mut buf).map_err(from_io)?;
        Ok(buf)
    }

    pub fn skip(&mut self, header: &ElementHeader) -> Result<(), Error> {
        self.seek_to(header.payload_pos + header.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn size_vint_round_trips_every_width() {
        for width in 1u8..=8 {
            let max_value = if width == 8 { (1u64 << 56) - 1 } else { (1u64 << (7 * u32::from(width))) - 1 };
            for &value in &[0u64, 1, max_value] {
                let bytes = encode_size(value, width);
                assert_eq!(bytes.len(), width as usize);
                let mut r = Reader::new(Cursor::new(bytes));
                assert_eq!(r.read_size().unwrap(), value);
            }
        }
    }

    #[test]
    fn id_round_trips() {
        for &id in &[ids::EBML_HEADER, ids::SEGMENT, ids::CLUSTER, ids::TRACK_ENTRY, ids::VOID] {
            let bytes = encode_id(id);
            let mut r = Reader::new(Cursor::new(bytes));
            assert_eq!(r.read_id().unwrap(), Some(id));
        }
    }

    #[test]
    fn void_bytes_has_exact_footprint_and_valid_header() {
        for &len in &[2u64, 3, 10, 1024, 12] {
            let bytes = void_bytes(len).unwrap();
            assert_eq!(bytes.len() as u64, len);
            let mut r = Reader::new(Cursor::new(bytes));
            let h = r.read_header().unwrap().unwrap();
            assert_eq!(h.id, ids::VOID);
            assert_eq!(h.payload_pos + h.size, len);
        }
    }

    #[test]
    fn void_bytes_rejects_sub_two_byte_gap() {
        void_bytes(1).unwrap_err();
    }

    #[test]
    fn reserved_header_backpatches_in_place() {
        let mut w = Writer::new(Cursor::new(Vec::new()));
        let size_pos = w.write_reserved_header(ids::CLUSTER, 0).unwrap();
        w.write_bytes(b"hello").unwrap();
        let end = w.pos().unwrap();
        w.backpatch_size8(size_pos, 5).unwrap();
        assert_eq!(w.pos().unwrap(), end, "cursor restored after backpatch");
        let mut r = Reader::new(Cursor::new(w.inner.into_inner()));
        let h = r.read_header().unwrap().unwrap();
        assert_eq!(h.id, ids::CLUSTER);
        assert_eq!(h.size, 5);
        assert_eq!(r.read_payload(&h).unwrap(), b"hello");
    }
}
