//! Typed responses.

use crate::error::{ProtocolError, ServerError};
use crate::frame::{FrameHeader, Opcode, ProtocolVersion};
use crate::request::{CustomPayload, EventType};
use crate::result::{QueryResult, SchemaChange};
use crate::types::Reader;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use uuid::Uuid;

/// Options advertised by the server in reply to OPTIONS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Supported {
    pub options: BTreeMap<String, Vec<String>>,
}

impl Supported {
    pub fn get(&self, key: &str) -> &[String] {
        self.options.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn cql_versions(&self) -> &[String] {
        self.get("CQL_VERSION")
    }

    pub fn compression(&self) -> &[String] {
        self.get("COMPRESSION")
    }

    pub fn supports_compression(&self, name: &str) -> bool {
        self.compression().iter().any(|c| c == name)
    }
}

/// A server-pushed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TopologyChange { change: String, address: SocketAddr },
    StatusChange { change: String, address: SocketAddr },
    SchemaChange(SchemaChange),
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::TopologyChange { .. } => EventType::TopologyChange,
            Event::StatusChange { .. } => EventType::StatusChange,
            Event::SchemaChange(_) => EventType::SchemaChange,
        }
    }

    fn decode(r: &mut Reader, version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let kind: EventType = r.read_string()?.parse()?;
        let event = match kind {
            EventType::TopologyChange => Event::TopologyChange {
                change: r.read_string()?,
                address: r.read_inet()?,
            },
            EventType::StatusChange => Event::StatusChange {
                change: r.read_string()?,
                address: r.read_inet()?,
            },
            EventType::SchemaChange => Event::SchemaChange(SchemaChange::decode(r, version)?),
        };
        Ok(event)
    }
}

/// One variant per response opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Error(ServerError),
    Ready,
    /// Carries the server's authenticator class name.
    Authenticate(String),
    Supported(Supported),
    Result(QueryResult),
    Event(Event),
    AuthChallenge(Option<Bytes>),
    AuthSuccess(Option<Bytes>),
}

impl Response {
    pub fn decode(
        opcode: Opcode,
        r: &mut Reader,
        version: ProtocolVersion,
    ) -> Result<Self, ProtocolError> {
        let response = match opcode {
            Opcode::Error => Response::Error(ServerError::decode(r, version)?),
            Opcode::Ready => Response::Ready,
            Opcode::Authenticate => Response::Authenticate(r.read_string()?),
            Opcode::Supported => Response::Supported(Supported {
                options: r.read_string_multimap()?,
            }),
            Opcode::Result => Response::Result(QueryResult::decode(r, version)?),
            Opcode::Event => Response::Event(Event::decode(r, version)?),
            Opcode::AuthChallenge => Response::AuthChallenge(r.read_bytes()?),
            Opcode::AuthSuccess => Response::AuthSuccess(r.read_bytes()?),
            other => return Err(ProtocolError::NotAResponse(other)),
        };
        Ok(response)
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Response::Error(_) => Opcode::Error,
            Response::Ready => Opcode::Ready,
            Response::Authenticate(_) => Opcode::Authenticate,
            Response::Supported(_) => Opcode::Supported,
            Response::Result(_) => Opcode::Result,
            Response::Event(_) => Opcode::Event,
            Response::AuthChallenge(_) => Opcode::AuthChallenge,
            Response::AuthSuccess(_) => Opcode::AuthSuccess,
        }
    }
}

/// A decoded response frame with its optional body prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub header: FrameHeader,
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub custom_payload: Option<CustomPayload>,
    pub response: Response,
}

impl ParsedResponse {
    /// Decodes an uncompressed body.
    pub fn decode(header: FrameHeader, body: Bytes) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(body);

        let tracing_id = if header.flags.is_tracing() {
            Some(r.read_uuid()?)
        } else {
            None
        };
        let warnings = if header.flags.has_warning() {
            r.read_string_list()?
        } else {
            Vec::new()
        };
        let custom_payload = if header.flags.has_custom_payload() {
            Some(r.read_bytes_map()?)
        } else {
            None
        };
        let response = Response::decode(header.opcode, &mut r, header.version)?;

        Ok(Self {
            header,
            tracing_id,
            warnings,
            custom_payload,
            response,
        })
    }

    pub fn into_response(self) -> Response {
        self.response
    }
}
