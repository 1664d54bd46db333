//! Sync record layer: typed sync messages over the record codec.
//!
//! The reader reads one record ahead. Records of an unsupported protocol
//! version are a hard error; records of unknown type are skipped so that
//! newer peers can add record types without breaking older ones.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use courier_core::{
    Ack, FormatError, Message, Offer, Record, RecordType, Request, SyncMessage, Versions,
    PROTOCOL_VERSION,
};

use crate::error::Result;
use crate::transport::{RecordReader, RecordWriter};

/// Reads typed sync messages.
pub struct SyncRecordReader<R> {
    reader: RecordReader<R>,
    next: Option<Record>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> SyncRecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: RecordReader::new(inner),
            next: None,
            eof: false,
        }
    }

    /// Buffer the next record of a known type, unless already buffered or
    /// the stream has ended.
    async fn read_ahead(&mut self) -> Result<()> {
        if self.next.is_some() || self.eof {
            return Ok(());
        }
        loop {
            let Some(record) = self.reader.read_record().await? else {
                self.eof = true;
                return Ok(());
            };
            if record.version() != PROTOCOL_VERSION {
                return Err(FormatError::UnsupportedVersion(record.version()).into());
            }
            if record.known_type().is_none() {
                trace!(
                    record_type = record.record_type(),
                    len = record.payload().len(),
                    "skipping unknown record"
                );
                continue;
            }
            self.next = Some(record);
            return Ok(());
        }
    }

    /// Whether the stream has ended. Once true, stays true without reading.
    pub async fn eof(&mut self) -> Result<bool> {
        self.read_ahead().await?;
        Ok(self.next.is_none())
    }

    async fn next_is(&mut self, kind: RecordType) -> Result<bool> {
        self.read_ahead().await?;
        Ok(self
            .next
            .as_ref()
            .is_some_and(|r| r.known_type() == Some(kind)))
    }

    pub async fn has_ack(&mut self) -> Result<bool> {
        self.next_is(RecordType::Ack).await
    }

    pub async fn has_message(&mut self) -> Result<bool> {
        self.next_is(RecordType::Message).await
    }

    pub async fn has_offer(&mut self) -> Result<bool> {
        self.next_is(RecordType::Offer).await
    }

    pub async fn has_request(&mut self) -> Result<bool> {
        self.next_is(RecordType::Request).await
    }

    pub async fn has_versions(&mut self) -> Result<bool> {
        self.next_is(RecordType::Versions).await
    }

    /// Take the buffered record, which must be of `kind`.
    async fn take(&mut self, kind: RecordType) -> Result<Record> {
        self.read_ahead().await?;
        match self.next.take() {
            Some(record) if record.known_type() == Some(kind) => Ok(record),
            Some(record) => {
                let found = record.known_type().map_or("unknown", RecordType::name);
                self.next = Some(record);
                Err(FormatError::UnexpectedRecord {
                    expected: kind.name(),
                    found,
                }
                .into())
            }
            None => Err(FormatError::UnexpectedRecord {
                expected: kind.name(),
                found: "end of stream",
            }
            .into()),
        }
    }

    pub async fn read_ack(&mut self) -> Result<Ack> {
        let record = self.take(RecordType::Ack).await?;
        Ok(Ack::decode_payload(record.payload())?)
    }

    pub async fn read_message(&mut self) -> Result<Message> {
        let record = self.take(RecordType::Message).await?;
        Ok(Message::from_raw(record.into_payload())?)
    }

    pub async fn read_offer(&mut self) -> Result<Offer> {
        let record = self.take(RecordType::Offer).await?;
        Ok(Offer::decode_payload(record.payload())?)
    }

    pub async fn read_request(&mut self) -> Result<Request> {
        let record = self.take(RecordType::Request).await?;
        Ok(Request::decode_payload(record.payload())?)
    }

    pub async fn read_versions(&mut self) -> Result<Versions> {
        let record = self.take(RecordType::Versions).await?;
        Ok(Versions::decode_payload(record.payload())?)
    }

    /// Read whatever comes next. `None` at end of stream.
    pub async fn read_next(&mut self) -> Result<Option<SyncMessage>> {
        self.read_ahead().await?;
        let Some(record) = self.next.take() else {
            return Ok(None);
        };
        let Some(kind) = record.known_type() else {
            return Ok(None);
        };
        Ok(Some(SyncMessage::from_record(kind, record.into_payload())?))
    }

    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }
}

/// Writes typed sync messages.
pub struct SyncRecordWriter<W> {
    writer: RecordWriter<W>,
}

impl<W: AsyncWrite + Unpin> SyncRecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: RecordWriter::new(inner),
        }
    }

    pub async fn write_ack(&mut self, ack: &Ack) -> Result<()> {
        self.writer.write_record(&ack.to_record()?).await
    }

    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        let record = Record::new(RecordType::Message.as_u8(), message.raw().clone())?;
        self.writer.write_record(&record).await
    }

    pub async fn write_offer(&mut self, offer: &Offer) -> Result<()> {
        self.writer.write_record(&offer.to_record()?).await
    }

    pub async fn write_request(&mut self, request: &Request) -> Result<()> {
        self.writer.write_record(&request.to_record()?).await
    }

    pub async fn write_versions(&mut self, versions: &Versions) -> Result<()> {
        self.writer.write_record(&versions.to_record()?).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await
    }

    /// Flush and close the stream.
    pub async fn send_end_of_stream(&mut self) -> Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await
    }

    pub fn bytes_written(&self) -> u64 {
        self.writer.bytes_written()
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}
