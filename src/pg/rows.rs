//! Result cursor for the simple query protocol.

use bytes::{Buf, Bytes};
use smallvec::SmallVec;

use super::connection::{unexpected, ConnState, PgConnection, QueryStart};
use super::error::{PgError, PgResult};
use super::framing::Context;
use super::protocol::{
    decode_command_complete, ensure, get_i16, get_i32, parse_rows_affected, read_cstring,
    BackendTag,
};
use super::types::{Oid, PgValue};

/// One decoded row. Rows of up to 16 columns stay inline.
pub type Row = SmallVec<[PgValue; 16]>;

// ============================================================================
// Row description
// ============================================================================

/// Column names and type OIDs of a result set.
///
/// Instances are recycled through the owning connection's free list once
/// their cursor is finished.
#[derive(Debug, Clone, Default)]
pub struct RowDescription {
    names: Vec<String>,
    types: Vec<Oid>,
}

impl RowDescription {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn types(&self) -> &[Oid] {
        &self.types
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Parse a RowDescription body into this (reused) instance.
    ///
    /// Per column: name, 6 skipped bytes (table OID, attribute number), type
    /// OID, 8 skipped bytes (type size, modifier, format code).
    pub(crate) fn parse(&mut self, mut body: Bytes) -> PgResult<()> {
        self.names.clear();
        self.types.clear();

        let count = get_i16(&mut body)?;
        if count < 0 {
            return Err(PgError::Protocol(format!("negative column count {}", count)));
        }
        let count = count as usize;
        self.names.reserve(count);
        self.types.reserve(count);

        for _ in 0..count {
            let name = read_cstring(&mut body)?;
            ensure(&body, 18, "column description")?;
            body.advance(6);
            let oid = body.get_u32();
            body.advance(8);

            self.names.push(name);
            self.types.push(Oid(oid));
        }
        Ok(())
    }

    /// Decode a DataRow body against this description.
    pub(crate) fn decode_row(&self, mut body: Bytes) -> PgResult<Row> {
        let count = get_i16(&mut body)?;
        if count < 0 || count as usize != self.types.len() {
            return Err(PgError::Protocol(format!(
                "DataRow has {} columns, RowDescription has {}",
                count,
                self.types.len()
            )));
        }

        let mut row = Row::with_capacity(self.types.len());
        for &oid in &self.types {
            let len = get_i32(&mut body)?;
            let data = if len < 0 {
                None
            } else {
                ensure(&body, len as usize, "column value")?;
                Some(body.split_to(len as usize))
            };
            row.push(PgValue::decode_text(oid, data)?);
        }
        Ok(row)
    }
}

// ============================================================================
// Rows
// ============================================================================

/// A cursor over the rows of a simple query.
///
/// The cursor borrows its connection, so no other operation can run while it
/// is open. Dropping it before the end leaves the remaining messages on the
/// wire; the connection drains them before its next operation.
pub struct Rows<'c> {
    conn: &'c mut PgConnection,
    ctx: Context,
    desc: Option<RowDescription>,
    /// Non-fatal server error seen mid-stream, reported after ReadyForQuery.
    err: Option<PgError>,
    rows_affected: u64,
    closed: bool,
}

impl<'c> Rows<'c> {
    pub(crate) fn new(conn: &'c mut PgConnection, ctx: Context, start: QueryStart) -> Self {
        let (desc, err, closed) = match start {
            QueryStart::Rows(desc, err) => (Some(desc), err, false),
            QueryStart::Done => (None, None, true),
        };
        Self {
            conn,
            ctx,
            desc,
            err,
            rows_affected: 0,
            closed,
        }
    }

    /// Column names of the current result set.
    pub fn columns(&self) -> &[String] {
        self.desc.as_ref().map(|d| d.names()).unwrap_or(&[])
    }

    /// Column type OIDs of the current result set.
    pub fn column_types(&self) -> &[Oid] {
        self.desc.as_ref().map(|d| d.types()).unwrap_or(&[])
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Row count from the last CommandComplete seen so far.
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// Decode the next row. `Ok(None)` once the query is finished.
    ///
    /// When the query holds several statements, rows of later result sets
    /// follow and [`columns`](Self::columns) switches to their description.
    pub async fn next(&mut self) -> PgResult<Option<Row>> {
        let result = self.advance(true).await;
        self.conn.track(result)
    }

    /// Drain the rest of the stream through ReadyForQuery.
    pub async fn close(&mut self) -> PgResult<()> {
        while !self.closed {
            let result = self.advance(false).await;
            self.conn.track(result)?;
        }
        Ok(())
    }

    async fn advance(&mut self, decode: bool) -> PgResult<Option<Row>> {
        if self.closed {
            return Ok(None);
        }

        // Busy while a message may be half-read; a dropped future leaves it so.
        self.conn.state = ConnState::Busy;
        let result = self.read_next(decode).await;
        if !self.closed && self.conn.state == ConnState::Busy {
            self.conn.state = ConnState::Streaming;
        }
        result
    }

    async fn read_next(&mut self, decode: bool) -> PgResult<Option<Row>> {
        let ctx = self.ctx;
        loop {
            let (tag, len) = self.conn.reader.read_message_type(&ctx).await?;
            match tag {
                BackendTag::DataRow => {
                    if !decode {
                        self.conn.reader.discard(&ctx, len).await?;
                        continue;
                    }
                    let body = self.conn.reader.read_payload(&ctx, len).await?;
                    let desc = self
                        .desc
                        .as_ref()
                        .ok_or_else(|| unexpected(tag, "rows without description"))?;
                    return desc.decode_row(body).map(Some);
                }
                BackendTag::RowDescription => {
                    let body = self.conn.reader.read_payload(&ctx, len).await?;
                    self.desc.get_or_insert_with(Default::default).parse(body)?;
                }
                BackendTag::CommandComplete => {
                    let body = self.conn.reader.read_payload(&ctx, len).await?;
                    self.rows_affected = parse_rows_affected(&decode_command_complete(body)?);
                }
                BackendTag::ErrorResponse => {
                    let e = self.conn.read_error(&ctx, len).await?;
                    if e.is_fatal() {
                        self.closed = true;
                        return Err(e.into());
                    }
                    self.err.get_or_insert(PgError::Server(e));
                }
                BackendTag::ReadyForQuery => {
                    self.conn.read_ready(&ctx, len).await?;
                    self.finish();
                    return match self.err.take() {
                        Some(e) => Err(e),
                        None => Ok(None),
                    };
                }
                BackendTag::ParameterStatus => self.conn.read_parameter_status(&ctx, len).await?,
                BackendTag::EmptyQueryResponse
                | BackendTag::NoticeResponse
                | BackendTag::NotificationResponse
                | BackendTag::BackendKeyData => self.conn.reader.discard(&ctx, len).await?,
                other => return Err(unexpected(other, "rows")),
            }
        }
    }

    fn finish(&mut self) {
        self.closed = true;
        if let Some(desc) = self.desc.take() {
            self.conn.release_description(desc);
        }
    }
}

impl Drop for Rows<'_> {
    fn drop(&mut self) {
        if let Some(desc) = self.desc.take() {
            self.conn.release_description(desc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn row_description(cols: &[(&str, u32)]) -> Bytes {
        let mut b = BytesMut::new();
        b.put_i16(cols.len() as i16);
        for (name, oid) in cols {
            b.put_slice(name.as_bytes());
            b.put_u8(0);
            b.put_i32(0);
            b.put_i16(0);
            b.put_u32(*oid);
            b.put_i16(-1);
            b.put_i32(-1);
            b.put_i16(0);
        }
        b.freeze()
    }

    fn data_row(values: &[Option<&[u8]>]) -> Bytes {
        let mut b = BytesMut::new();
        b.put_i16(values.len() as i16);
        for v in values {
            match v {
                Some(v) => {
                    b.put_i32(v.len() as i32);
                    b.put_slice(v);
                }
                None => b.put_i32(-1),
            }
        }
        b.freeze()
    }

    #[test]
    fn test_parse_row_description() {
        let mut desc = RowDescription::default();
        desc.parse(row_description(&[("id", 23), ("name", 25)])).unwrap();
        assert_eq!(desc.names(), &["id".to_string(), "name".to_string()]);
        assert_eq!(desc.types(), &[Oid::INT4, Oid::TEXT]);

        // Reuse keeps nothing from the previous result set.
        desc.parse(row_description(&[("ok", 16)])).unwrap();
        assert_eq!(desc.len(), 1);
        assert_eq!(desc.types(), &[Oid::BOOL]);
    }

    #[test]
    fn test_decode_row() {
        let mut desc = RowDescription::default();
        desc.parse(row_description(&[("id", 23), ("payload", 17), ("flag", 16)]))
            .unwrap();

        let row = desc
            .decode_row(data_row(&[Some(b"42"), Some(b"\\x68656c6c6f"), None]))
            .unwrap();
        assert_eq!(row[0], PgValue::Int4(42));
        assert_eq!(row[1], PgValue::Bytea(b"hello".to_vec()));
        assert_eq!(row[2], PgValue::Null);
        assert!(!row.spilled());
    }

    #[test]
    fn test_column_count_mismatch() {
        let mut desc = RowDescription::default();
        desc.parse(row_description(&[("id", 23)])).unwrap();
        let err = desc.decode_row(data_row(&[Some(b"1"), Some(b"2")])).unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));
    }

    #[test]
    fn test_truncated_description() {
        let mut desc = RowDescription::default();
        let mut body = BytesMut::new();
        body.put_i16(1);
        body.put_slice(b"id\0");
        body.put_i32(0);
        let err = desc.parse(body.freeze()).unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));
    }
}
