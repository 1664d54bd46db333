//! Record codec over byte streams.
//!
//! Reads and writes the generic framed unit, `[version][type][len u16 BE]`
//! followed by the payload, on any tokio `AsyncRead`/`AsyncWrite`. Payload
//! contents are not interpreted here.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use courier_core::{FormatError, Record, RecordHeader, RECORD_HEADER_LENGTH};

use crate::error::Result;

/// Reads records from a stream.
pub struct RecordReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next record. `None` on a clean end of stream at a record
    /// boundary; a stream that ends inside a record is a format error.
    pub async fn read_record(&mut self) -> Result<Option<Record>> {
        let mut header = [0u8; RECORD_HEADER_LENGTH];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.inner.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(FormatError::Truncated("header").into());
            }
            filled += n;
        }
        let header = RecordHeader::decode(&header)?;

        let mut payload = vec![0u8; header.payload_length];
        match self.inner.read_exact(&mut payload).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(FormatError::Truncated("payload").into());
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Some(Record::with_version(
            header.version,
            header.record_type,
            payload,
        )?))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes records to a stream, counting the bytes written.
pub struct RecordWriter<W> {
    inner: W,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_written: 0,
        }
    }

    /// Write one record. Payload size was bounded when the record was built.
    pub async fn write_record(&mut self, record: &Record) -> Result<()> {
        self.inner.write_all(&record.header()).await?;
        self.inner.write_all(record.payload()).await?;
        self.bytes_written += record.encoded_len() as u64;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and shut the stream down, signalling end of stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Total bytes written so far, headers included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{RecordType, MAX_RECORD_PAYLOAD_LENGTH};

    use crate::error::SyncError;

    #[tokio::test]
    async fn test_write_then_read() {
        let mut writer = RecordWriter::new(Vec::new());
        let record = Record::new(RecordType::Offer.as_u8(), vec![9u8; 64]).unwrap();
        writer.write_record(&record).await.unwrap();
        assert_eq!(writer.bytes_written(), 68);

        let bytes = writer.into_inner();
        let mut reader = RecordReader::new(&bytes[..]);
        assert_eq!(reader.read_record().await.unwrap(), Some(record));
        assert_eq!(reader.read_record().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_stream_is_clean_eof() {
        let mut reader = RecordReader::new(&b""[..]);
        assert!(reader.read_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let mut reader = RecordReader::new(&[0u8, 1][..]);
        assert!(matches!(
            reader.read_record().await,
            Err(SyncError::Format(FormatError::Truncated("header")))
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let mut reader = RecordReader::new(&[0u8, 1, 0, 10, 1, 2, 3][..]);
        assert!(matches!(
            reader.read_record().await,
            Err(SyncError::Format(FormatError::Truncated("payload")))
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let len = (MAX_RECORD_PAYLOAD_LENGTH as u16 + 1).to_be_bytes();
        let bytes = [0u8, 0, len[0], len[1]];
        let mut reader = RecordReader::new(&bytes[..]);
        assert!(matches!(
            reader.read_record().await,
            Err(SyncError::Format(FormatError::PayloadTooLong { .. }))
        ));
    }
}
