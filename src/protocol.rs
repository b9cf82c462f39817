//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::error::{PgError, PgResult, ServerError};
use crate::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Magic code of the SSLRequest message.
pub const SSL_REQUEST_CODE: i32 = 80877103; // (1234 << 16) | 5679

/// Magic code of the CancelRequest message.
pub const CANCEL_REQUEST_CODE: i32 = 80877102; // (1234 << 16) | 5678

/// Upper bound on a single backend message, length field included.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl Format {
    fn from_code(code: i16) -> PgResult<Self> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            other => Err(PgError::Protocol(format!("invalid format code {other}"))),
        }
    }
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    fn from_byte(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(PgError::Protocol(format!(
                "invalid transaction status '{}'",
                other as char
            ))),
        }
    }
}

/// Target of a Describe or Close message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn code(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Messages sent by the client.
///
/// `SslRequest`, `Startup` and `CancelRequest` are the untagged bootstrap
/// messages; every other variant starts with its tag byte.
#[derive(Debug, Clone)]
pub enum FrontendMessage<'a> {
    SslRequest,
    Startup {
        params: &'a [(&'a str, &'a str)],
    },
    CancelRequest {
        process_id: i32,
        secret_key: i32,
    },
    Query {
        query: &'a str,
    },
    Parse {
        name: &'a str,
        query: &'a str,
        param_types: &'a [Oid],
    },
    Bind {
        portal: &'a str,
        statement: &'a str,
        param_formats: &'a [Format],
        /// Pre-encoded parameter values; `None` is SQL NULL.
        params: &'a [Option<Vec<u8>>],
        result_formats: &'a [Format],
    },
    Describe {
        target: Target,
        name: &'a str,
    },
    Execute {
        portal: &'a str,
        /// 0 = no limit
        max_rows: i32,
    },
    Sync,
    Flush,
    Close {
        target: Target,
        name: &'a str,
    },
    Password {
        password: &'a str,
    },
    SaslInitialResponse {
        mechanism: &'a str,
        data: &'a [u8],
    },
    SaslResponse {
        data: &'a [u8],
    },
    CopyData {
        data: &'a [u8],
    },
    CopyDone,
    CopyFail {
        message: &'a str,
    },
    Terminate,
}

impl FrontendMessage<'_> {
    /// Append the encoded message to `buf`.
    pub fn encode(&self, buf: &mut WriteBuffer) -> PgResult<()> {
        match self {
            FrontendMessage::SslRequest => {
                buf.write_length_prefixed(|b| b.write_i32(SSL_REQUEST_CODE))
            }
            FrontendMessage::Startup { params } => buf.write_length_prefixed(|b| {
                b.write_i32(PROTOCOL_VERSION)?;
                for (key, value) in params.iter() {
                    b.write_cstring(key)?;
                    b.write_cstring(value)?;
                }
                // Terminator
                b.write_u8(0)
            }),
            FrontendMessage::CancelRequest {
                process_id,
                secret_key,
            } => buf.write_length_prefixed(|b| {
                b.write_i32(CANCEL_REQUEST_CODE)?;
                b.write_i32(*process_id)?;
                b.write_i32(*secret_key)
            }),
            FrontendMessage::Query { query } => tagged(buf, b'Q', |b| b.write_cstring(query)),
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => tagged(buf, b'P', |b| {
                b.write_cstring(name)?;
                b.write_cstring(query)?;
                b.write_i16(count(param_types.len())?)?;
                for oid in param_types.iter() {
                    b.write_i32(oid.as_i32())?;
                }
                Ok(())
            }),
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => tagged(buf, b'B', |b| {
                b.write_cstring(portal)?;
                b.write_cstring(statement)?;
                b.write_i16(count(param_formats.len())?)?;
                for fmt in param_formats.iter() {
                    b.write_i16(*fmt as i16)?;
                }
                b.write_i16(count(params.len())?)?;
                for param in params.iter() {
                    match param {
                        None => b.write_i32(-1)?,
                        Some(data) => {
                            let len = i32::try_from(data.len()).map_err(|_| {
                                PgError::Usage("parameter value is too large".to_string())
                            })?;
                            b.write_i32(len)?;
                            b.write_bytes(data)?;
                        }
                    }
                }
                b.write_i16(count(result_formats.len())?)?;
                for fmt in result_formats.iter() {
                    b.write_i16(*fmt as i16)?;
                }
                Ok(())
            }),
            FrontendMessage::Describe { target, name } => tagged(buf, b'D', |b| {
                b.write_u8(target.code())?;
                b.write_cstring(name)
            }),
            FrontendMessage::Execute { portal, max_rows } => tagged(buf, b'E', |b| {
                b.write_cstring(portal)?;
                b.write_i32(*max_rows)
            }),
            FrontendMessage::Sync => tagged(buf, b'S', |_| Ok(())),
            FrontendMessage::Flush => tagged(buf, b'H', |_| Ok(())),
            FrontendMessage::Close { target, name } => tagged(buf, b'C', |b| {
                b.write_u8(target.code())?;
                b.write_cstring(name)
            }),
            FrontendMessage::Password { password } => {
                tagged(buf, b'p', |b| b.write_cstring(password))
            }
            FrontendMessage::SaslInitialResponse { mechanism, data } => tagged(buf, b'p', |b| {
                b.write_cstring(mechanism)?;
                let len = i32::try_from(data.len())
                    .map_err(|_| PgError::Usage("SASL payload is too large".to_string()))?;
                b.write_i32(len)?;
                b.write_bytes(data)
            }),
            FrontendMessage::SaslResponse { data } => tagged(buf, b'p', |b| b.write_bytes(data)),
            FrontendMessage::CopyData { data } => tagged(buf, b'd', |b| b.write_bytes(data)),
            FrontendMessage::CopyDone => tagged(buf, b'c', |_| Ok(())),
            FrontendMessage::CopyFail { message } => {
                tagged(buf, b'f', |b| b.write_cstring(message))
            }
            FrontendMessage::Terminate => tagged(buf, b'X', |_| Ok(())),
        }
    }
}

fn tagged<F>(buf: &mut WriteBuffer, tag: u8, f: F) -> PgResult<()>
where
    F: FnOnce(&mut WriteBuffer) -> PgResult<()>,
{
    buf.write_u8(tag)?;
    buf.write_length_prefixed(f)
}

fn count(n: usize) -> PgResult<i16> {
    i16::try_from(n).map_err(|_| PgError::Usage(format!("too many items for one message: {n}")))
}

// ============================================================================
// Framing
// ============================================================================

/// One framed backend message: tag, declared length and body.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub tag: u8,
    /// Declared length, including the 4 length bytes themselves.
    pub len: usize,
    pub body: Bytes,
}

impl RawMessage {
    /// Split one complete message off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Nothing is consumed in
    /// that case, so callers can keep appending to `buf` and retry.
    pub fn parse(buf: &mut BytesMut) -> PgResult<Option<RawMessage>> {
        if buf.len() < 5 {
            return Ok(None);
        }

        let tag = buf[0];
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let len = usize::try_from(len)
            .ok()
            .filter(|len| (4..=MAX_MESSAGE_LEN).contains(len))
            .ok_or_else(|| {
                PgError::Protocol(format!(
                    "invalid length {len} for message '{}'",
                    tag as char
                ))
            })?;

        if buf.len() < len + 1 {
            return Ok(None);
        }

        buf.advance(5);
        let body = buf.split_to(len - 4).freeze();
        Ok(Some(RawMessage { tag, len, body }))
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    AuthenticationSASL {
        mechanisms: Vec<String>,
    },
    AuthenticationSASLContinue {
        data: Bytes,
    },
    AuthenticationSASLFinal {
        data: Bytes,
    },

    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription {
        type_oids: Vec<Oid>,
    },

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Errors and notices
    ErrorResponse(ServerError),
    NoticeResponse {
        fields: HashMap<u8, String>,
    },

    // Asynchronous
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },

    // COPY sub-protocol
    CopyInResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyOutResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyBothResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyData(Bytes),
    CopyDone,
}

impl BackendMessage {
    /// Decode the body of a framed message.
    pub fn decode(raw: RawMessage) -> PgResult<Self> {
        let RawMessage { tag, body, .. } = raw;
        let mut body = ReadBuffer::new(body);

        let msg = match tag {
            b'R' => Self::decode_auth(&mut body)?,
            b'T' => Self::decode_row_description(&mut body)?,
            b'D' => Self::decode_data_row(&mut body)?,
            b'C' => BackendMessage::CommandComplete {
                tag: body.read_cstring()?,
            },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::from_byte(body.read_u8()?)?,
            },
            b'E' => BackendMessage::ErrorResponse(ServerError::new(read_error_fields(&mut body)?)),
            b'N' => BackendMessage::NoticeResponse {
                fields: read_error_fields(&mut body)?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: body.read_cstring()?,
                value: body.read_cstring()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: body.read_i32()?,
                secret_key: body.read_i32()?,
            },
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => Self::decode_parameter_description(&mut body)?,
            b'A' => BackendMessage::NotificationResponse {
                process_id: body.read_i32()?,
                channel: body.read_cstring()?,
                payload: body.read_cstring()?,
            },
            b'G' => {
                let (format, column_formats) = Self::decode_copy_response(&mut body)?;
                BackendMessage::CopyInResponse {
                    format,
                    column_formats,
                }
            }
            b'H' => {
                let (format, column_formats) = Self::decode_copy_response(&mut body)?;
                BackendMessage::CopyOutResponse {
                    format,
                    column_formats,
                }
            }
            b'W' => {
                let (format, column_formats) = Self::decode_copy_response(&mut body)?;
                BackendMessage::CopyBothResponse {
                    format,
                    column_formats,
                }
            }
            b'd' => BackendMessage::CopyData(body.read_rest()),
            b'c' => BackendMessage::CopyDone,
            other => return Err(PgError::unexpected(other, "decoding a backend message")),
        };

        Ok(msg)
    }

    /// The wire tag of this message.
    pub fn tag(&self) -> u8 {
        match self {
            BackendMessage::AuthenticationOk
            | BackendMessage::AuthenticationCleartextPassword
            | BackendMessage::AuthenticationMD5Password { .. }
            | BackendMessage::AuthenticationSASL { .. }
            | BackendMessage::AuthenticationSASLContinue { .. }
            | BackendMessage::AuthenticationSASLFinal { .. } => b'R',
            BackendMessage::RowDescription { .. } => b'T',
            BackendMessage::DataRow { .. } => b'D',
            BackendMessage::CommandComplete { .. } => b'C',
            BackendMessage::EmptyQueryResponse => b'I',
            BackendMessage::ParseComplete => b'1',
            BackendMessage::BindComplete => b'2',
            BackendMessage::CloseComplete => b'3',
            BackendMessage::NoData => b'n',
            BackendMessage::PortalSuspended => b's',
            BackendMessage::ParameterDescription { .. } => b't',
            BackendMessage::ReadyForQuery { .. } => b'Z',
            BackendMessage::ParameterStatus { .. } => b'S',
            BackendMessage::BackendKeyData { .. } => b'K',
            BackendMessage::ErrorResponse(_) => b'E',
            BackendMessage::NoticeResponse { .. } => b'N',
            BackendMessage::NotificationResponse { .. } => b'A',
            BackendMessage::CopyInResponse { .. } => b'G',
            BackendMessage::CopyOutResponse { .. } => b'H',
            BackendMessage::CopyBothResponse { .. } => b'W',
            BackendMessage::CopyData(_) => b'd',
            BackendMessage::CopyDone => b'c',
        }
    }

    fn decode_auth(body: &mut ReadBuffer) -> PgResult<Self> {
        let auth_type = body.read_i32()?;

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body.read_exact(4)?);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while !body.is_empty() {
                    let mech = body.read_cstring()?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue {
                data: body.read_rest(),
            }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal {
                data: body.read_rest(),
            }),
            // Kerberos, SCM credentials, GSSAPI and SSPI are not supported
            _ => Err(PgError::unexpected(b'R', "decoding an authentication request")),
        }
    }

    fn decode_row_description(body: &mut ReadBuffer) -> PgResult<Self> {
        let num_fields = body.read_i16()?.max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            fields.push(FieldDescription {
                name: body.read_cstring()?,
                table_oid: body.read_i32()?,
                column_attr: body.read_i16()?,
                type_oid: Oid::from_i32(body.read_i32()?),
                type_size: body.read_i16()?,
                type_modifier: body.read_i32()?,
                format: Format::from_code(body.read_i16()?)?,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(body: &mut ReadBuffer) -> PgResult<Self> {
        let num_cols = body.read_i16()?.max(0) as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = body.read_i32()?;
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(body.read_exact(len as usize)?));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_parameter_description(body: &mut ReadBuffer) -> PgResult<Self> {
        let num_params = body.read_i16()?.max(0) as usize;
        let mut type_oids = Vec::with_capacity(num_params);

        for _ in 0..num_params {
            type_oids.push(Oid::from_i32(body.read_i32()?));
        }

        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    fn decode_copy_response(body: &mut ReadBuffer) -> PgResult<(Format, Vec<Format>)> {
        let format = Format::from_code(i16::from(body.read_u8()?))?;
        let num_cols = body.read_i16()?.max(0) as usize;
        let mut column_formats = Vec::with_capacity(num_cols);
        for _ in 0..num_cols {
            column_formats.push(Format::from_code(body.read_i16()?)?);
        }
        Ok((format, column_formats))
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Read error/notice response fields
fn read_error_fields(body: &mut ReadBuffer) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while !body.is_empty() {
        let field_type = body.read_u8()?;
        if field_type == 0 {
            break;
        }
        let value = body.read_cstring()?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(msg: FrontendMessage<'_>) -> Vec<u8> {
        let mut buf = WriteBuffer::new();
        msg.encode(&mut buf).unwrap();
        buf.as_slice().to_vec()
    }

    fn frame(tag: u8, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[tag]);
        buf.extend_from_slice(&(body.len() as i32 + 4).to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    fn decode_one(tag: u8, body: &[u8]) -> PgResult<BackendMessage> {
        let mut buf = frame(tag, body);
        let raw = RawMessage::parse(&mut buf)?.expect("complete frame");
        BackendMessage::decode(raw)
    }

    #[test]
    fn test_startup_message_structure() {
        let params = [("user", "test"), ("database", "testdb")];
        let encoded = encode(FrontendMessage::Startup { params: &params });

        let len = i32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len());
        assert_eq!(&encoded[4..8], &PROTOCOL_VERSION.to_be_bytes());
        assert_eq!(&encoded[8..], b"user\0test\0database\0testdb\0\0");
    }

    #[test]
    fn test_ssl_request_is_untagged() {
        let encoded = encode(FrontendMessage::SslRequest);
        assert_eq!(encoded, [0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f]);
    }

    #[test]
    fn test_bind_encodes_null_and_formats() {
        let params = vec![Some(vec![0, 0, 0, 7]), None];
        let encoded = encode(FrontendMessage::Bind {
            portal: "",
            statement: "s1",
            param_formats: &[Format::Binary, Format::Text],
            params: &params,
            result_formats: &[Format::Binary],
        });

        assert_eq!(encoded[0], b'B');
        let len = i32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]);
        assert_eq!(len as usize, encoded.len() - 1);

        let expected_body: &[u8] = &[
            0, b's', b'1', 0, // portal, statement
            0, 2, 0, 1, 0, 0, // param formats
            0, 2, 0, 0, 0, 4, 0, 0, 0, 7, 0xff, 0xff, 0xff, 0xff, // values
            0, 1, 0, 1, // result formats
        ];
        assert_eq!(&encoded[5..], expected_body);
    }

    #[test]
    fn test_parse_partial_frame_consumes_nothing() {
        let full = frame(b'C', b"SELECT 1\0");
        let mut partial = BytesMut::from(&full[..7]);
        assert!(RawMessage::parse(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 7);

        partial.extend_from_slice(&full[7..]);
        let raw = RawMessage::parse(&mut partial).unwrap().unwrap();
        assert_eq!(raw.tag, b'C');
        assert_eq!(raw.len, 13);
        assert!(partial.is_empty());
    }

    #[test]
    fn test_invalid_length_rejected() {
        let mut buf = BytesMut::from(&[b'Z', 0, 0, 0, 3][..]);
        assert!(matches!(
            RawMessage::parse(&mut buf),
            Err(PgError::Protocol(_))
        ));

        let mut huge = BytesMut::from(&[b'D', 0x7f, 0xff, 0xff, 0xff][..]);
        assert!(RawMessage::parse(&mut huge).is_err());
    }

    #[test]
    fn test_unknown_tag_is_unexpected() {
        assert!(matches!(
            decode_one(b'?', b""),
            Err(PgError::UnexpectedMessage { tag: '?', .. })
        ));
        assert!(matches!(
            decode_one(b'R', &7i32.to_be_bytes()),
            Err(PgError::UnexpectedMessage { tag: 'R', .. })
        ));
    }

    #[test]
    fn test_decode_error_response() {
        let msg = decode_one(b'E', b"SERROR\0C22012\0Mdivision by zero\0\0").unwrap();
        match msg {
            BackendMessage::ErrorResponse(err) => {
                assert_eq!(err.severity(), "ERROR");
                assert_eq!(err.code(), "22012");
                assert_eq!(err.message(), "division by zero");
            }
            other => panic!("expected ErrorResponse, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_data_row_is_exhausted() {
        // claims a 10-byte value but carries 2
        let body = [0, 1, 0, 0, 0, 10, b'a', b'b'];
        assert!(matches!(
            decode_one(b'D', &body),
            Err(PgError::BufferExhausted { .. })
        ));
    }

    #[test]
    fn test_decode_copy_in_response() {
        let body = [0, 0, 2, 0, 0, 0, 0];
        match decode_one(b'G', &body).unwrap() {
            BackendMessage::CopyInResponse {
                format,
                column_formats,
            } => {
                assert_eq!(format, Format::Text);
                assert_eq!(column_formats, vec![Format::Text, Format::Text]);
            }
            other => panic!("expected CopyInResponse, got {other:?}"),
        }
    }
}
