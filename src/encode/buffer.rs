//! Byte-level serialization helpers: a growable writer and a checked cursor
//! reader, plus the Bitcoin VarInt convention (1/3/5/9 bytes keyed on the
//! first byte).

use crate::error::{Result, WalletError};

#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        ByteWriter { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        ByteWriter { buf: Vec::with_capacity(cap) }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32_be(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn put_var_int(&mut self, v: u64) {
        match v {
            0..=0xFC => self.put_u8(v as u8),
            0xFD..=0xFFFF => {
                self.put_u8(0xFD);
                self.buf.extend_from_slice(&(v as u16).to_le_bytes());
            }
            0x10000..=0xFFFF_FFFF => {
                self.put_u8(0xFE);
                self.buf.extend_from_slice(&(v as u32).to_le_bytes());
            }
            _ => {
                self.put_u8(0xFF);
                self.buf.extend_from_slice(&v.to_le_bytes());
            }
        }
    }

    /// Length-prefixed blob: `varint(len) ‖ data`.
    pub fn put_var_bytes(&mut self, data: &[u8]) {
        self.put_var_int(data.len() as u64);
        self.put_bytes(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ByteReader { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(WalletError::InvalidArgument(format!(
                "buffer underrun: need {n} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u32_be(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_var_int(&mut self) -> Result<u64> {
        let first = self.get_u8()?;
        Ok(match first {
            0xFD => u16::from_le_bytes(self.take(2)?.try_into().unwrap()) as u64,
            0xFE => u32::from_le_bytes(self.take(4)?.try_into().unwrap()) as u64,
            0xFF => u64::from_le_bytes(self.take(8)?.try_into().unwrap()),
            v => v as u64,
        })
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Read a `varint(len) ‖ data` blob written by
    /// [`ByteWriter::put_var_bytes`].
    pub fn get_var_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_var_int()?;
        if len > self.remaining() as u64 {
            return Err(WalletError::InvalidArgument("length prefix exceeds buffer".into()));
        }
        self.take(len as usize)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_boundaries() {
        let cases: &[(u64, usize)] = &[
            (0, 1),
            (0xFC, 1),
            (0xFD, 3),
            (0xFFFF, 3),
            (0x10000, 5),
            (0xFFFF_FFFF, 5),
            (0x1_0000_0000, 9),
        ];
        for &(value, encoded_len) in cases {
            let mut writer = ByteWriter::new();
            writer.put_var_int(value);
            assert_eq!(writer.len(), encoded_len, "value {value:#x}");

            let buf = writer.into_vec();
            let mut reader = ByteReader::new(&buf);
            assert_eq!(reader.get_var_int().unwrap(), value);
            assert!(reader.is_exhausted());
        }
    }

    #[test]
    fn underrun_is_an_error() {
        let mut reader = ByteReader::new(&[0x01, 0x02]);
        assert!(reader.get_u32_le().is_err());
    }

    #[test]
    fn var_bytes_roundtrip() {
        let mut writer = ByteWriter::new();
        writer.put_var_bytes(b"hello");
        writer.put_u32_be(7);

        let buf = writer.into_vec();
        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.get_var_bytes().unwrap(), b"hello");
        assert_eq!(reader.get_u32_be().unwrap(), 7);
    }

    #[test]
    fn bogus_length_prefix_rejected() {
        let mut writer = ByteWriter::new();
        writer.put_var_int(1000);
        writer.put_bytes(b"short");
        let buf = writer.into_vec();
        assert!(ByteReader::new(&buf).get_var_bytes().is_err());
    }
}
