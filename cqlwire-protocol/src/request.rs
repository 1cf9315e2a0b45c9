//! Typed requests and their body encodings.

use crate::error::ProtocolError;
use crate::frame::{Opcode, ProtocolVersion};
use crate::types::{
    write_bytes, write_bytes_map, write_consistency, write_long_string, write_short_bytes,
    write_string, write_string_list, write_string_map, write_value, Consistency,
    SerialConsistency, Value,
};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Opaque key/value map carried ahead of the body when the custom payload flag is set.
pub type CustomPayload = BTreeMap<String, Bytes>;

mod query_flags {
    pub const VALUES: u32 = 0x01;
    pub const SKIP_METADATA: u32 = 0x02;
    pub const PAGE_SIZE: u32 = 0x04;
    pub const PAGING_STATE: u32 = 0x08;
    pub const SERIAL_CONSISTENCY: u32 = 0x10;
    pub const DEFAULT_TIMESTAMP: u32 = 0x20;
    pub const NAMED_VALUES: u32 = 0x40;
    pub const KEYSPACE: u32 = 0x80;
}

const PREPARE_WITH_KEYSPACE: u32 = 0x01;

/// Server push notifications a connection can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TopologyChange => "TOPOLOGY_CHANGE",
            EventType::StatusChange => "STATUS_CHANGE",
            EventType::SchemaChange => "SCHEMA_CHANGE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOPOLOGY_CHANGE" => Ok(EventType::TopologyChange),
            "STATUS_CHANGE" => Ok(EventType::StatusChange),
            "SCHEMA_CHANGE" => Ok(EventType::SchemaChange),
            other => Err(ProtocolError::UnknownEventType(other.to_string())),
        }
    }
}

/// Bound values of a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValues {
    Positional(Vec<Value>),
    /// Values bound by marker name (v3+, not allowed in batches).
    Named(Vec<(String, Value)>),
}

impl Default for QueryValues {
    fn default() -> Self {
        QueryValues::Positional(Vec::new())
    }
}

impl QueryValues {
    pub fn len(&self) -> usize {
        match self {
            QueryValues::Positional(v) => v.len(),
            QueryValues::Named(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn encode(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), ProtocolError> {
        if self.len() > u16::MAX as usize {
            return Err(ProtocolError::TooLong {
                kind: "value list",
                len: self.len(),
                max: u16::MAX as usize,
            });
        }
        buf.put_u16(self.len() as u16);
        match self {
            QueryValues::Positional(values) => {
                for v in values {
                    write_value(buf, v, version)?;
                }
            }
            QueryValues::Named(values) => {
                for (name, v) in values {
                    write_string(buf, name)?;
                    write_value(buf, v, version)?;
                }
            }
        }
        Ok(())
    }
}

/// Parameters shared by QUERY and EXECUTE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParameters {
    pub consistency: Consistency,
    pub values: QueryValues,
    pub skip_metadata: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub serial_consistency: Option<SerialConsistency>,
    /// Client-side timestamp in microseconds (v3+).
    pub default_timestamp: Option<i64>,
    /// Keyspace to run the statement in (v5).
    pub keyspace: Option<String>,
    /// Sent ahead of the body (v4+).
    pub custom_payload: Option<CustomPayload>,
}

impl QueryParameters {
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_values(mut self, values: Vec<Value>) -> Self {
        self.values = QueryValues::Positional(values);
        self
    }

    pub fn with_named_values(mut self, values: Vec<(String, Value)>) -> Self {
        self.values = QueryValues::Named(values);
        self
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_paging_state(mut self, state: Bytes) -> Self {
        self.paging_state = Some(state);
        self
    }

    pub fn with_serial_consistency(mut self, serial: SerialConsistency) -> Self {
        self.serial_consistency = Some(serial);
        self
    }

    pub fn with_default_timestamp(mut self, micros: i64) -> Self {
        self.default_timestamp = Some(micros);
        self
    }

    pub fn with_skip_metadata(mut self, skip: bool) -> Self {
        self.skip_metadata = skip;
        self
    }

    pub fn with_keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.keyspace = Some(keyspace.into());
        self
    }

    pub fn with_custom_payload(mut self, payload: CustomPayload) -> Self {
        self.custom_payload = Some(payload);
        self
    }

    fn encode(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), ProtocolError> {
        write_consistency(buf, self.consistency);

        let mut flags = 0u32;
        if !self.values.is_empty() {
            flags |= query_flags::VALUES;
            if matches!(self.values, QueryValues::Named(_)) {
                if version < ProtocolVersion::V3 {
                    return Err(ProtocolError::requires("named values", 3, version));
                }
                flags |= query_flags::NAMED_VALUES;
            }
        }
        if self.skip_metadata {
            flags |= query_flags::SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= query_flags::PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= query_flags::PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= query_flags::SERIAL_CONSISTENCY;
        }
        if self.default_timestamp.is_some() {
            if version < ProtocolVersion::V3 {
                return Err(ProtocolError::requires("default timestamp", 3, version));
            }
            flags |= query_flags::DEFAULT_TIMESTAMP;
        }
        if self.keyspace.is_some() {
            if version < ProtocolVersion::V5 {
                return Err(ProtocolError::requires("per-query keyspace", 5, version));
            }
            flags |= query_flags::KEYSPACE;
        }

        if version >= ProtocolVersion::V5 {
            buf.put_u32(flags);
        } else {
            buf.put_u8(flags as u8);
        }

        if flags & query_flags::VALUES != 0 {
            self.values.encode(buf, version)?;
        }
        if let Some(page_size) = self.page_size {
            buf.put_i32(page_size);
        }
        if let Some(state) = &self.paging_state {
            write_bytes(buf, Some(state))?;
        }
        if let Some(serial) = self.serial_consistency {
            buf.put_u16(serial.as_u16());
        }
        if let Some(ts) = self.default_timestamp {
            buf.put_i64(ts);
        }
        if let Some(keyspace) = &self.keyspace {
            write_string(buf, keyspace)?;
        }
        Ok(())
    }
}

/// A plain QUERY.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub statement: String,
    pub params: QueryParameters,
}

impl Query {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            params: QueryParameters::default(),
        }
    }

    pub fn with_params(mut self, params: QueryParameters) -> Self {
        self.params = params;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.params.consistency = consistency;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatement {
    Query { statement: String, values: QueryValues },
    Prepared { id: Bytes, values: QueryValues },
}

/// A BATCH of queries and prepared statements (v2+).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub batch_type: BatchType,
    pub statements: Vec<BatchStatement>,
    pub consistency: Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub default_timestamp: Option<i64>,
    pub keyspace: Option<String>,
    pub custom_payload: Option<CustomPayload>,
}

impl Batch {
    fn encode(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), ProtocolError> {
        if version < ProtocolVersion::V2 {
            return Err(ProtocolError::requires("batches", 2, version));
        }
        buf.put_u8(self.batch_type as u8);
        if self.statements.len() > u16::MAX as usize {
            return Err(ProtocolError::TooLong {
                kind: "batch",
                len: self.statements.len(),
                max: u16::MAX as usize,
            });
        }
        buf.put_u16(self.statements.len() as u16);

        for stmt in &self.statements {
            let values = match stmt {
                BatchStatement::Query { statement, values } => {
                    buf.put_u8(0);
                    write_long_string(buf, statement)?;
                    values
                }
                BatchStatement::Prepared { id, values } => {
                    buf.put_u8(1);
                    write_short_bytes(buf, id)?;
                    values
                }
            };
            if matches!(values, QueryValues::Named(_)) {
                return Err(ProtocolError::NamedValuesInBatch);
            }
            values.encode(buf, version)?;
        }

        write_consistency(buf, self.consistency);

        if version >= ProtocolVersion::V3 {
            let mut flags = 0u32;
            if self.serial_consistency.is_some() {
                flags |= query_flags::SERIAL_CONSISTENCY;
            }
            if self.default_timestamp.is_some() {
                flags |= query_flags::DEFAULT_TIMESTAMP;
            }
            if self.keyspace.is_some() {
                if version < ProtocolVersion::V5 {
                    return Err(ProtocolError::requires("per-batch keyspace", 5, version));
                }
                flags |= query_flags::KEYSPACE;
            }
            if version >= ProtocolVersion::V5 {
                buf.put_u32(flags);
            } else {
                buf.put_u8(flags as u8);
            }
            if let Some(serial) = self.serial_consistency {
                buf.put_u16(serial.as_u16());
            }
            if let Some(ts) = self.default_timestamp {
                buf.put_i64(ts);
            }
            if let Some(keyspace) = &self.keyspace {
                write_string(buf, keyspace)?;
            }
        } else if self.serial_consistency.is_some() || self.default_timestamp.is_some() {
            return Err(ProtocolError::requires("batch flags", 3, version));
        }
        Ok(())
    }
}

/// Every request the client can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Options,
    Startup(BTreeMap<String, String>),
    AuthResponse(Bytes),
    Register(Vec<EventType>),
    Query(Query),
    Prepare {
        statement: String,
        /// Keyspace to prepare in (v5).
        keyspace: Option<String>,
    },
    Execute {
        id: Bytes,
        /// Result metadata id returned by PREPARE (v5).
        result_metadata_id: Option<Bytes>,
        params: QueryParameters,
    },
    Batch(Batch),
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Options => Opcode::Options,
            Request::Startup(_) => Opcode::Startup,
            Request::AuthResponse(_) => Opcode::AuthResponse,
            Request::Register(_) => Opcode::Register,
            Request::Query(_) => Opcode::Query,
            Request::Prepare { .. } => Opcode::Prepare,
            Request::Execute { .. } => Opcode::Execute,
            Request::Batch(_) => Opcode::Batch,
        }
    }

    /// Custom payload to send ahead of the body, if any.
    pub fn custom_payload(&self) -> Option<&CustomPayload> {
        match self {
            Request::Query(q) => q.params.custom_payload.as_ref(),
            Request::Execute { params, .. } => params.custom_payload.as_ref(),
            Request::Batch(b) => b.custom_payload.as_ref(),
            _ => None,
        }
        .filter(|p| !p.is_empty())
    }

    /// Writes the opcode-specific body (without header or custom payload).
    pub fn encode_body(
        &self,
        buf: &mut BytesMut,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        match self {
            Request::Options => Ok(()),
            Request::Startup(options) => write_string_map(buf, options),
            Request::AuthResponse(token) => write_bytes(buf, Some(token)),
            Request::Register(events) => {
                let names: Vec<String> = events.iter().map(|e| e.as_str().to_string()).collect();
                write_string_list(buf, &names)
            }
            Request::Query(query) => {
                write_long_string(buf, &query.statement)?;
                if version == ProtocolVersion::V1 {
                    write_consistency(buf, query.params.consistency);
                    Ok(())
                } else {
                    query.params.encode(buf, version)
                }
            }
            Request::Prepare {
                statement,
                keyspace,
            } => {
                write_long_string(buf, statement)?;
                if version >= ProtocolVersion::V5 {
                    match keyspace {
                        Some(ks) => {
                            buf.put_u32(PREPARE_WITH_KEYSPACE);
                            write_string(buf, ks)?;
                        }
                        None => buf.put_u32(0),
                    }
                } else if keyspace.is_some() {
                    return Err(ProtocolError::requires("prepare keyspace", 5, version));
                }
                Ok(())
            }
            Request::Execute {
                id,
                result_metadata_id,
                params,
            } => {
                write_short_bytes(buf, id)?;
                if version >= ProtocolVersion::V5 {
                    let metadata_id = result_metadata_id.as_deref().unwrap_or_default();
                    write_short_bytes(buf, metadata_id)?;
                }
                if version == ProtocolVersion::V1 {
                    params.values.encode(buf, version)?;
                    write_consistency(buf, params.consistency);
                    Ok(())
                } else {
                    params.encode(buf, version)
                }
            }
            Request::Batch(batch) => batch.encode(buf, version),
        }
    }
}

pub(crate) fn write_custom_payload(
    buf: &mut BytesMut,
    payload: &CustomPayload,
) -> Result<(), ProtocolError> {
    write_bytes_map(buf, payload)
}
