//! Bounds-checked primitives for reading and writing frame bodies.

use bson::Document;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// Minimum encoded size of a document: length (4) + terminator (1).
const MIN_DOCUMENT_SIZE: usize = 5;

pub(crate) struct BodyReader {
    op: &'static str,
    buf: Bytes,
}

impl BodyReader {
    pub(crate) fn new(op: &'static str, buf: Bytes) -> Self {
        Self { op, buf }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub(crate) fn has_remaining(&self) -> bool {
        self.buf.has_remaining()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(WireError::malformed(
                self.op,
                format!("truncated {what} ({} of {n} bytes)", self.buf.remaining()),
            ));
        }
        Ok(())
    }

    pub(crate) fn i32(&mut self, what: &str) -> Result<i32> {
        self.need(4, what)?;
        Ok(self.buf.get_i32_le())
    }

    pub(crate) fn u32(&mut self, what: &str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    pub(crate) fn i64(&mut self, what: &str) -> Result<i64> {
        self.need(8, what)?;
        Ok(self.buf.get_i64_le())
    }

    pub(crate) fn u8(&mut self, what: &str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn cstring(&mut self, what: &str) -> Result<String> {
        let Some(end) = self.buf.iter().position(|b| *b == 0) else {
            return Err(WireError::malformed(self.op, format!("unterminated {what}")));
        };
        let raw = self.buf.split_to(end);
        self.buf.advance(1);
        String::from_utf8(raw.to_vec())
            .map_err(|_| WireError::malformed(self.op, format!("{what} is not valid UTF-8")))
    }

    pub(crate) fn document(&mut self, what: &str) -> Result<Document> {
        self.need(4, what)?;
        let declared = (&self.buf[..4]).get_i32_le();
        if declared < MIN_DOCUMENT_SIZE as i32 {
            return Err(WireError::malformed(
                self.op,
                format!("{what} declares invalid length {declared}"),
            ));
        }
        self.need(declared as usize, what)?;
        let raw = self.buf.split_to(declared as usize);
        Ok(Document::from_reader(&mut std::io::Cursor::new(raw.as_ref()))?)
    }

    /// Read documents until the body is exhausted.
    pub(crate) fn documents(&mut self, what: &str) -> Result<Vec<Document>> {
        let mut docs = Vec::new();
        while self.has_remaining() {
            docs.push(self.document(what)?);
        }
        Ok(docs)
    }

    /// Split off the next `n` bytes as an independent reader.
    pub(crate) fn sub_reader(&mut self, n: usize, what: &str) -> Result<BodyReader> {
        self.need(n, what)?;
        Ok(BodyReader::new(self.op, self.buf.split_to(n)))
    }

    pub(crate) fn truncate_tail(&mut self, n: usize, what: &str) -> Result<()> {
        self.need(n, what)?;
        let keep = self.buf.remaining() - n;
        self.buf.truncate(keep);
        Ok(())
    }

    pub(crate) fn into_bytes(self) -> Bytes {
        self.buf
    }
}

pub(crate) fn put_cstring(dst: &mut BytesMut, value: &str) {
    dst.put_slice(value.as_bytes());
    dst.put_u8(0);
}

pub(crate) fn put_document(dst: &mut BytesMut, doc: &Document) -> Result<()> {
    let mut raw = Vec::new();
    doc.to_writer(&mut raw)?;
    dst.put_slice(&raw);
    Ok(())
}
