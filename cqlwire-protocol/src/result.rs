//! RESULT bodies: void, rows, set keyspace, prepared and schema change.
//!
//! Rows are not decoded into typed values. Each row is returned as one
//! optional byte slice per column, and the metadata describes the column
//! types so a value codec can take it from there.

use crate::error::ProtocolError;
use crate::frame::ProtocolVersion;
use crate::types::Reader;
use bytes::Bytes;
use std::fmt;

const KIND_VOID: i32 = 0x0001;
const KIND_ROWS: i32 = 0x0002;
const KIND_SET_KEYSPACE: i32 = 0x0003;
const KIND_PREPARED: i32 = 0x0004;
const KIND_SCHEMA_CHANGE: i32 = 0x0005;

const FLAG_GLOBAL_TABLE_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;
const FLAG_METADATA_CHANGED: i32 = 0x0008;

const MAX_TYPE_DEPTH: usize = 64;

/// Column type tree from a type `[option]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    BigInt,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Text,
    Timestamp,
    Uuid,
    Varchar,
    Varint,
    Timeuuid,
    Inet,
    Date,
    Time,
    SmallInt,
    TinyInt,
    Duration,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    Udt {
        keyspace: String,
        name: String,
        fields: Vec<(String, ColumnType)>,
    },
    Tuple(Vec<ColumnType>),
}

impl ColumnType {
    pub(crate) fn decode(r: &mut Reader) -> Result<Self, ProtocolError> {
        Self::decode_nested(r, 0)
    }

    fn decode_nested(r: &mut Reader, depth: usize) -> Result<Self, ProtocolError> {
        if depth > MAX_TYPE_DEPTH {
            return Err(ProtocolError::TooLong {
                kind: "type nesting",
                len: depth,
                max: MAX_TYPE_DEPTH,
            });
        }
        let next = depth + 1;
        let id = r.read_short()?;
        let ty = match id {
            0x0000 => ColumnType::Custom(r.read_string()?),
            0x0001 => ColumnType::Ascii,
            0x0002 => ColumnType::BigInt,
            0x0003 => ColumnType::Blob,
            0x0004 => ColumnType::Boolean,
            0x0005 => ColumnType::Counter,
            0x0006 => ColumnType::Decimal,
            0x0007 => ColumnType::Double,
            0x0008 => ColumnType::Float,
            0x0009 => ColumnType::Int,
            0x000A => ColumnType::Text,
            0x000B => ColumnType::Timestamp,
            0x000C => ColumnType::Uuid,
            0x000D => ColumnType::Varchar,
            0x000E => ColumnType::Varint,
            0x000F => ColumnType::Timeuuid,
            0x0010 => ColumnType::Inet,
            0x0011 => ColumnType::Date,
            0x0012 => ColumnType::Time,
            0x0013 => ColumnType::SmallInt,
            0x0014 => ColumnType::TinyInt,
            0x0015 => ColumnType::Duration,
            0x0020 => ColumnType::List(Box::new(Self::decode_nested(r, next)?)),
            0x0021 => {
                let key = Self::decode_nested(r, next)?;
                let value = Self::decode_nested(r, next)?;
                ColumnType::Map(Box::new(key), Box::new(value))
            }
            0x0022 => ColumnType::Set(Box::new(Self::decode_nested(r, next)?)),
            0x0030 => {
                let keyspace = r.read_string()?;
                let name = r.read_string()?;
                let n = r.read_short()?;
                let mut fields = Vec::with_capacity((n as usize).min(r.remaining() / 4));
                for _ in 0..n {
                    let field = r.read_string()?;
                    fields.push((field, Self::decode_nested(r, next)?));
                }
                ColumnType::Udt {
                    keyspace,
                    name,
                    fields,
                }
            }
            0x0031 => {
                let n = r.read_short()?;
                let mut elems = Vec::with_capacity((n as usize).min(r.remaining() / 2));
                for _ in 0..n {
                    elems.push(Self::decode_nested(r, next)?);
                }
                ColumnType::Tuple(elems)
            }
            other => return Err(ProtocolError::UnknownColumnType(other)),
        };
        Ok(ty)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Custom(class) => write!(f, "'{class}'"),
            ColumnType::Ascii => f.write_str("ascii"),
            ColumnType::BigInt => f.write_str("bigint"),
            ColumnType::Blob => f.write_str("blob"),
            ColumnType::Boolean => f.write_str("boolean"),
            ColumnType::Counter => f.write_str("counter"),
            ColumnType::Decimal => f.write_str("decimal"),
            ColumnType::Double => f.write_str("double"),
            ColumnType::Float => f.write_str("float"),
            ColumnType::Int => f.write_str("int"),
            ColumnType::Text => f.write_str("text"),
            ColumnType::Timestamp => f.write_str("timestamp"),
            ColumnType::Uuid => f.write_str("uuid"),
            ColumnType::Varchar => f.write_str("varchar"),
            ColumnType::Varint => f.write_str("varint"),
            ColumnType::Timeuuid => f.write_str("timeuuid"),
            ColumnType::Inet => f.write_str("inet"),
            ColumnType::Date => f.write_str("date"),
            ColumnType::Time => f.write_str("time"),
            ColumnType::SmallInt => f.write_str("smallint"),
            ColumnType::TinyInt => f.write_str("tinyint"),
            ColumnType::Duration => f.write_str("duration"),
            ColumnType::List(elem) => write!(f, "list<{elem}>"),
            ColumnType::Set(elem) => write!(f, "set<{elem}>"),
            ColumnType::Map(k, v) => write!(f, "map<{k}, {v}>"),
            ColumnType::Udt { keyspace, name, .. } => write!(f, "{keyspace}.{name}"),
            ColumnType::Tuple(elems) => {
                f.write_str("tuple<")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{e}")?;
                }
                f.write_str(">")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub keyspace: String,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub column_type: ColumnType,
}

/// Metadata describing the columns of a row set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    /// Number of columns per row, present even when `columns` was skipped.
    pub column_count: usize,
    /// Opaque token for fetching the next page.
    pub paging_state: Option<Bytes>,
    /// New result metadata id when the server's metadata changed (v5).
    pub new_metadata_id: Option<Bytes>,
    /// Empty when the server was asked to skip metadata.
    pub columns: Vec<ColumnSpec>,
}

impl ResultMetadata {
    pub fn has_more_pages(&self) -> bool {
        self.paging_state.is_some()
    }

    pub(crate) fn decode(r: &mut Reader, version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let flags = r.read_int()?;
        let column_count = read_count(r, "column")?;

        let mut meta = ResultMetadata {
            column_count,
            ..Default::default()
        };
        if flags & FLAG_HAS_MORE_PAGES != 0 {
            meta.paging_state = r.read_bytes()?;
        }
        if version >= ProtocolVersion::V5 && flags & FLAG_METADATA_CHANGED != 0 {
            meta.new_metadata_id = Some(r.read_short_bytes()?);
        }
        if flags & FLAG_NO_METADATA != 0 {
            return Ok(meta);
        }
        meta.columns = read_columns(r, flags, column_count)?;
        Ok(meta)
    }
}

/// Bind-marker metadata of a prepared statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedMetadata {
    /// Indices of bind markers that make up the partition key (v4+).
    pub pk_indices: Vec<u16>,
    pub column_count: usize,
    pub columns: Vec<ColumnSpec>,
}

impl PreparedMetadata {
    fn decode(r: &mut Reader, version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let flags = r.read_int()?;
        let column_count = read_count(r, "column")?;

        let mut meta = PreparedMetadata {
            column_count,
            ..Default::default()
        };
        if version >= ProtocolVersion::V4 {
            let pk_count = read_count(r, "partition key")?;
            meta.pk_indices = Vec::with_capacity(pk_count.min(r.remaining() / 2));
            for _ in 0..pk_count {
                meta.pk_indices.push(r.read_short()?);
            }
        }
        if flags & FLAG_HAS_MORE_PAGES != 0 {
            r.read_bytes()?;
        }
        if flags & FLAG_NO_METADATA != 0 {
            return Ok(meta);
        }
        meta.columns = read_columns(r, flags, column_count)?;
        Ok(meta)
    }
}

fn read_count(r: &mut Reader, kind: &'static str) -> Result<usize, ProtocolError> {
    let count = r.read_int()?;
    if count < 0 {
        return Err(ProtocolError::NegativeCount { kind, count });
    }
    Ok(count as usize)
}

fn read_columns(
    r: &mut Reader,
    flags: i32,
    column_count: usize,
) -> Result<Vec<ColumnSpec>, ProtocolError> {
    let global = if flags & FLAG_GLOBAL_TABLE_SPEC != 0 {
        Some(TableSpec {
            keyspace: r.read_string()?,
            table: r.read_string()?,
        })
    } else {
        None
    };

    let mut columns = Vec::with_capacity(column_count.min(r.remaining() / 4));
    for _ in 0..column_count {
        let table_spec = match &global {
            Some(spec) => spec.clone(),
            None => TableSpec {
                keyspace: r.read_string()?,
                table: r.read_string()?,
            },
        };
        let name = r.read_string()?;
        let column_type = ColumnType::decode(r)?;
        columns.push(ColumnSpec {
            table_spec,
            name,
            column_type,
        });
    }
    Ok(columns)
}

/// A page of rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rows {
    pub metadata: ResultMetadata,
    /// One entry per row, one optional byte slice per column (`None` is null).
    pub rows: Vec<Vec<Option<Bytes>>>,
}

impl Rows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn decode(r: &mut Reader, version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let metadata = ResultMetadata::decode(r, version)?;
        let row_count = read_count(r, "row")?;
        let width = metadata.column_count;

        if width == 0 {
            if row_count != 0 {
                return Err(ProtocolError::RowsWithoutColumns(row_count));
            }
            return Ok(Self {
                metadata,
                rows: Vec::new(),
            });
        }
        // Every cell takes at least its 4-byte length.
        let needed = row_count
            .checked_mul(width)
            .and_then(|cells| cells.checked_mul(4))
            .unwrap_or(usize::MAX);
        if needed > r.remaining() {
            return Err(ProtocolError::NotEnoughBytes {
                kind: "rows",
                needed,
                available: r.remaining(),
            });
        }

        let mut rows = Vec::with_capacity(row_count);
        for _ in 0..row_count {
            let mut row = Vec::with_capacity(width.min(r.remaining() / 4));
            for _ in 0..width {
                row.push(r.read_bytes()?);
            }
            rows.push(row);
        }
        Ok(Self { metadata, rows })
    }
}

/// Result of a successful PREPARE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedResult {
    pub id: Bytes,
    /// Result metadata id to send with EXECUTE (v5).
    pub result_metadata_id: Option<Bytes>,
    pub metadata: PreparedMetadata,
    /// Shape of the rows EXECUTE will return (v2+).
    pub result_metadata: ResultMetadata,
}

impl PreparedResult {
    fn decode(r: &mut Reader, version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let id = r.read_short_bytes()?;
        let result_metadata_id = if version >= ProtocolVersion::V5 {
            Some(r.read_short_bytes()?)
        } else {
            None
        };
        let metadata = PreparedMetadata::decode(r, version)?;
        let result_metadata = if version >= ProtocolVersion::V2 {
            ResultMetadata::decode(r, version)?
        } else {
            ResultMetadata::default()
        };
        Ok(Self {
            id,
            result_metadata_id,
            metadata,
            result_metadata,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeTarget {
    Keyspace,
    Table,
    Type,
    Function,
    Aggregate,
}

impl SchemaChangeTarget {
    fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "KEYSPACE" => Ok(SchemaChangeTarget::Keyspace),
            "TABLE" => Ok(SchemaChangeTarget::Table),
            "TYPE" => Ok(SchemaChangeTarget::Type),
            "FUNCTION" => Ok(SchemaChangeTarget::Function),
            "AGGREGATE" => Ok(SchemaChangeTarget::Aggregate),
            other => Err(ProtocolError::UnknownSchemaTarget(other.to_string())),
        }
    }
}

/// A schema change, either as a RESULT or pushed as an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    /// `CREATED`, `UPDATED` or `DROPPED`.
    pub change: String,
    pub target: SchemaChangeTarget,
    pub keyspace: String,
    /// Table, type, function or aggregate name; `None` for keyspace changes.
    pub name: Option<String>,
    /// Argument types of a changed function or aggregate.
    pub arguments: Vec<String>,
}

impl SchemaChange {
    pub(crate) fn decode(r: &mut Reader, version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let change = r.read_string()?;

        if version < ProtocolVersion::V3 {
            let keyspace = r.read_string()?;
            let table = r.read_string()?;
            let (target, name) = if table.is_empty() {
                (SchemaChangeTarget::Keyspace, None)
            } else {
                (SchemaChangeTarget::Table, Some(table))
            };
            return Ok(Self {
                change,
                target,
                keyspace,
                name,
                arguments: Vec::new(),
            });
        }

        let target = SchemaChangeTarget::parse(&r.read_string()?)?;
        let keyspace = r.read_string()?;
        let (name, arguments) = match target {
            SchemaChangeTarget::Keyspace => (None, Vec::new()),
            SchemaChangeTarget::Table | SchemaChangeTarget::Type => {
                (Some(r.read_string()?), Vec::new())
            }
            SchemaChangeTarget::Function | SchemaChangeTarget::Aggregate => {
                let name = r.read_string()?;
                (Some(name), r.read_string_list()?)
            }
        };
        Ok(Self {
            change,
            target,
            keyspace,
            name,
            arguments,
        })
    }
}

/// Decoded RESULT body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    Void,
    Rows(Rows),
    SetKeyspace(String),
    Prepared(PreparedResult),
    SchemaChange(SchemaChange),
}

impl QueryResult {
    pub(crate) fn decode(r: &mut Reader, version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let kind = r.read_int()?;
        let result = match kind {
            KIND_VOID => QueryResult::Void,
            KIND_ROWS => QueryResult::Rows(Rows::decode(r, version)?),
            KIND_SET_KEYSPACE => QueryResult::SetKeyspace(r.read_string()?),
            KIND_PREPARED => QueryResult::Prepared(PreparedResult::decode(r, version)?),
            KIND_SCHEMA_CHANGE => QueryResult::SchemaChange(SchemaChange::decode(r, version)?),
            other => return Err(ProtocolError::UnknownResultKind(other)),
        };
        Ok(result)
    }
}
