//! Model I/O stream shared by every stage's `save_load`.
//!
//! The persisted model is a concatenation of per-stage records with no
//! schema of its own. Each stage reads back exactly what it wrote, in the
//! same order, so the helpers here are fixed-size little-endian encodings.
//! In text mode the same calls emit `name value` lines instead; text models
//! are for reading by humans and cannot be loaded.

use std::io;

/// Longest byte string `read_bytes` accepts from a stream of unknown length.
pub const MAX_BYTE_STRING: usize = 1 << 30;

pub trait ModelIo {
    fn text_mode(&self) -> bool;

    fn set_text_mode(&mut self, on: bool);

    fn read_fixed(&mut self, buf: &mut [u8]) -> io::Result<()>;

    fn write_fixed(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Unread bytes, when the stream knows its length.
    fn bytes_left(&self) -> Option<usize> {
        None
    }

    fn write_text(&mut self, text: &str) -> io::Result<()> {
        self.write_fixed(text.as_bytes())
    }

    fn write_u64(&mut self, name: &str, value: u64) -> io::Result<()> {
        if self.text_mode() {
            self.write_text(&format!("{} {}\n", name, value))
        } else {
            self.write_fixed(&value.to_le_bytes())
        }
    }

    fn write_u32(&mut self, name: &str, value: u32) -> io::Result<()> {
        if self.text_mode() {
            self.write_text(&format!("{} {}\n", name, value))
        } else {
            self.write_fixed(&value.to_le_bytes())
        }
    }

    fn write_f32(&mut self, name: &str, value: f32) -> io::Result<()> {
        if self.text_mode() {
            self.write_text(&format!("{} {}\n", name, value))
        } else {
            self.write_fixed(&value.to_le_bytes())
        }
    }

    /// Length-prefixed byte string.
    fn write_bytes(&mut self, name: &str, value: &[u8]) -> io::Result<()> {
        if self.text_mode() {
            self.write_text(&format!("{} {}\n", name, String::from_utf8_lossy(value)))
        } else {
            self.write_fixed(&(value.len() as u64).to_le_bytes())?;
            self.write_fixed(value)
        }
    }

    fn read_u64(&mut self) -> io::Result<u64> {
        ensure_binary(self.text_mode())?;
        let mut buf = [0u8; 8];
        self.read_fixed(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        ensure_binary(self.text_mode())?;
        let mut buf = [0u8; 4];
        self.read_fixed(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_f32(&mut self) -> io::Result<f32> {
        ensure_binary(self.text_mode())?;
        let mut buf = [0u8; 4];
        self.read_fixed(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    fn read_bytes(&mut self) -> io::Result<Vec<u8>> {
        let len = self.read_u64()?;
        let left = self.bytes_left().unwrap_or(MAX_BYTE_STRING);
        let len = match usize::try_from(len) {
            Ok(len) if len <= left && len <= MAX_BYTE_STRING => len,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("byte string of {} bytes, at most {} available", len, left),
                ))
            }
        };
        let mut buf = vec![0u8; len];
        self.read_fixed(&mut buf)?;
        Ok(buf)
    }
}

fn ensure_binary(text_mode: bool) -> io::Result<()> {
    if text_mode {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "text-mode models cannot be loaded",
        ));
    }
    Ok(())
}

/// In-memory model stream. File transport wraps this.
#[derive(Debug, Default, Clone)]
pub struct ModelBuffer {
    bytes: Vec<u8>,
    cursor: usize,
    text: bool,
}

impl ModelBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text() -> Self {
        Self {
            text: true,
            ..Self::default()
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            cursor: 0,
            text: false,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.cursor
    }
}

impl ModelIo for ModelBuffer {
    fn text_mode(&self) -> bool {
        self.text
    }

    fn set_text_mode(&mut self, on: bool) {
        self.text = on;
    }

    fn read_fixed(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let end = self.cursor + buf.len();
        if end > self.bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "needed {} bytes at offset {}, only {} left",
                    buf.len(),
                    self.cursor,
                    self.remaining()
                ),
            ));
        }
        buf.copy_from_slice(&self.bytes[self.cursor..end]);
        self.cursor = end;
        Ok(())
    }

    fn write_fixed(&mut self, buf: &[u8]) -> io::Result<()> {
        self.bytes.extend_from_slice(buf);
        Ok(())
    }

    fn bytes_left(&self) -> Option<usize> {
        Some(self.remaining())
    }
}
