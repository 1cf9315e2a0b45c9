//! Primitive binary grammar: `[short]`, `[int]`, `[string]`, `[bytes]`, maps,
//! inet addresses, consistency levels and bound values.
//!
//! All integers are big-endian. Reading goes through [`Reader`], which checks
//! every declared length against the bytes actually available.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use uuid::Uuid;

/// Length sentinel for a null `[bytes]` value.
pub const NULL_LENGTH: i32 = -1;
/// Length sentinel for an unset `[value]` (v4+).
pub const UNSET_LENGTH: i32 = -2;

/// Consistency level of a request or reported in an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Consistency {
    Any,
    One,
    Two,
    Three,
    #[default]
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    Serial,
    LocalSerial,
    LocalOne,
}

impl Consistency {
    pub fn from_u16(value: u16) -> Result<Self, ProtocolError> {
        let c = match value {
            0x00 => Consistency::Any,
            0x01 => Consistency::One,
            0x02 => Consistency::Two,
            0x03 => Consistency::Three,
            0x04 => Consistency::Quorum,
            0x05 => Consistency::All,
            0x06 => Consistency::LocalQuorum,
            0x07 => Consistency::EachQuorum,
            0x08 => Consistency::Serial,
            0x09 => Consistency::LocalSerial,
            0x0A => Consistency::LocalOne,
            other => return Err(ProtocolError::InvalidConsistency(other)),
        };
        Ok(c)
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Consistency::Any => 0x00,
            Consistency::One => 0x01,
            Consistency::Two => 0x02,
            Consistency::Three => 0x03,
            Consistency::Quorum => 0x04,
            Consistency::All => 0x05,
            Consistency::LocalQuorum => 0x06,
            Consistency::EachQuorum => 0x07,
            Consistency::Serial => 0x08,
            Consistency::LocalSerial => 0x09,
            Consistency::LocalOne => 0x0A,
        }
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Consistency::Any => "ANY",
            Consistency::One => "ONE",
            Consistency::Two => "TWO",
            Consistency::Three => "THREE",
            Consistency::Quorum => "QUORUM",
            Consistency::All => "ALL",
            Consistency::LocalQuorum => "LOCAL_QUORUM",
            Consistency::EachQuorum => "EACH_QUORUM",
            Consistency::Serial => "SERIAL",
            Consistency::LocalSerial => "LOCAL_SERIAL",
            Consistency::LocalOne => "LOCAL_ONE",
        };
        f.write_str(name)
    }
}

impl FromStr for Consistency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let c = match s.to_ascii_uppercase().as_str() {
            "ANY" => Consistency::Any,
            "ONE" => Consistency::One,
            "TWO" => Consistency::Two,
            "THREE" => Consistency::Three,
            "QUORUM" => Consistency::Quorum,
            "ALL" => Consistency::All,
            "LOCAL_QUORUM" => Consistency::LocalQuorum,
            "EACH_QUORUM" => Consistency::EachQuorum,
            "SERIAL" => Consistency::Serial,
            "LOCAL_SERIAL" => Consistency::LocalSerial,
            "LOCAL_ONE" => Consistency::LocalOne,
            other => return Err(format!("unknown consistency level: {other}")),
        };
        Ok(c)
    }
}

/// Consistency for the Paxos phase of conditional updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SerialConsistency {
    Serial,
    LocalSerial,
}

impl SerialConsistency {
    pub fn as_u16(self) -> u16 {
        match self {
            SerialConsistency::Serial => 0x08,
            SerialConsistency::LocalSerial => 0x09,
        }
    }
}

impl fmt::Display for SerialConsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialConsistency::Serial => f.write_str("SERIAL"),
            SerialConsistency::LocalSerial => f.write_str("LOCAL_SERIAL"),
        }
    }
}

/// A bound statement argument, already serialized by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Set(Bytes),
    Null,
    /// Leave the column untouched (v4+).
    Unset,
}

impl Value {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Value::Set(bytes.into())
    }
}

impl From<Option<Bytes>> for Value {
    fn from(value: Option<Bytes>) -> Self {
        match value {
            Some(bytes) => Value::Set(bytes),
            None => Value::Null,
        }
    }
}

/// Bounds-checked cursor over a frame body.
#[derive(Debug, Clone)]
pub struct Reader {
    buf: Bytes,
}

impl Reader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns whatever is left without consuming it.
    pub fn rest(&self) -> &Bytes {
        &self.buf
    }

    fn ensure(&self, kind: &'static str, needed: usize) -> Result<(), ProtocolError> {
        if self.buf.len() < needed {
            return Err(ProtocolError::NotEnoughBytes {
                kind,
                needed,
                available: self.buf.len(),
            });
        }
        Ok(())
    }

    fn take(&mut self, kind: &'static str, len: usize) -> Result<Bytes, ProtocolError> {
        self.ensure(kind, len)?;
        Ok(self.buf.split_to(len))
    }

    fn count(&mut self, kind: &'static str) -> Result<usize, ProtocolError> {
        let count = self.read_int()?;
        if count < 0 {
            return Err(ProtocolError::NegativeCount { kind, count });
        }
        Ok(count as usize)
    }

    pub fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        self.ensure("byte", 1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_short(&mut self) -> Result<u16, ProtocolError> {
        self.ensure("short", 2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_int(&mut self) -> Result<i32, ProtocolError> {
        self.ensure("int", 4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_long(&mut self) -> Result<i64, ProtocolError> {
        self.ensure("long", 8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_short()? as usize;
        let raw = self.take("string", len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8("string"))
    }

    pub fn read_long_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.count("long string")?;
        let raw = self.take("long string", len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8("long string"))
    }

    /// Reads `[bytes]`; a negative length is null.
    pub fn read_bytes(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        let len = self.read_int()?;
        if len < 0 {
            return Ok(None);
        }
        self.take("bytes", len as usize).map(Some)
    }

    pub fn read_short_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.read_short()? as usize;
        self.take("short bytes", len)
    }

    pub fn read_string_list(&mut self) -> Result<Vec<String>, ProtocolError> {
        let n = self.read_short()? as usize;
        let mut list = Vec::with_capacity(n.min(self.remaining() / 2));
        for _ in 0..n {
            list.push(self.read_string()?);
        }
        Ok(list)
    }

    pub fn read_string_map(&mut self) -> Result<BTreeMap<String, String>, ProtocolError> {
        let n = self.read_short()?;
        let mut map = BTreeMap::new();
        for _ in 0..n {
            let key = self.read_string()?;
            map.insert(key, self.read_string()?);
        }
        Ok(map)
    }

    pub fn read_string_multimap(&mut self) -> Result<BTreeMap<String, Vec<String>>, ProtocolError> {
        let n = self.read_short()?;
        let mut map = BTreeMap::new();
        for _ in 0..n {
            let key = self.read_string()?;
            map.insert(key, self.read_string_list()?);
        }
        Ok(map)
    }

    /// Reads a `[bytes map]`; null values become empty.
    pub fn read_bytes_map(&mut self) -> Result<BTreeMap<String, Bytes>, ProtocolError> {
        let n = self.read_short()?;
        let mut map = BTreeMap::new();
        for _ in 0..n {
            let key = self.read_string()?;
            map.insert(key, self.read_bytes()?.unwrap_or_default());
        }
        Ok(map)
    }

    pub fn read_inet_addr(&mut self) -> Result<IpAddr, ProtocolError> {
        let len = self.read_byte()?;
        match len {
            4 => {
                let raw = self.take("inet", 4)?;
                Ok(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])))
            }
            16 => {
                let raw = self.take("inet", 16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&raw);
                Ok(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            other => Err(ProtocolError::InvalidInetLength(other)),
        }
    }

    /// Reads `[inet]`: an address followed by an `[int]` port.
    pub fn read_inet(&mut self) -> Result<SocketAddr, ProtocolError> {
        let ip = self.read_inet_addr()?;
        let port = self.read_int()?;
        let port = u16::try_from(port).map_err(|_| ProtocolError::InvalidPort(port))?;
        Ok(SocketAddr::new(ip, port))
    }

    pub fn read_uuid(&mut self) -> Result<Uuid, ProtocolError> {
        let raw = self.take("uuid", 16)?;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&raw);
        Ok(Uuid::from_bytes(octets))
    }

    pub fn read_consistency(&mut self) -> Result<Consistency, ProtocolError> {
        Consistency::from_u16(self.read_short()?)
    }
}

fn check_len(kind: &'static str, len: usize, max: usize) -> Result<(), ProtocolError> {
    if len > max {
        return Err(ProtocolError::TooLong { kind, len, max });
    }
    Ok(())
}

pub fn write_string(buf: &mut impl BufMut, s: &str) -> Result<(), ProtocolError> {
    check_len("string", s.len(), u16::MAX as usize)?;
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub fn write_long_string(buf: &mut impl BufMut, s: &str) -> Result<(), ProtocolError> {
    check_len("long string", s.len(), i32::MAX as usize)?;
    buf.put_i32(s.len() as i32);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Writes `[bytes]`; `None` is written as null.
pub fn write_bytes(buf: &mut impl BufMut, bytes: Option<&[u8]>) -> Result<(), ProtocolError> {
    match bytes {
        Some(b) => {
            check_len("bytes", b.len(), i32::MAX as usize)?;
            buf.put_i32(b.len() as i32);
            buf.put_slice(b);
        }
        None => buf.put_i32(NULL_LENGTH),
    }
    Ok(())
}

pub fn write_short_bytes(buf: &mut impl BufMut, bytes: &[u8]) -> Result<(), ProtocolError> {
    check_len("short bytes", bytes.len(), u16::MAX as usize)?;
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
    Ok(())
}

pub fn write_string_list(buf: &mut impl BufMut, list: &[String]) -> Result<(), ProtocolError> {
    check_len("string list", list.len(), u16::MAX as usize)?;
    buf.put_u16(list.len() as u16);
    for s in list {
        write_string(buf, s)?;
    }
    Ok(())
}

pub fn write_string_map(
    buf: &mut impl BufMut,
    map: &BTreeMap<String, String>,
) -> Result<(), ProtocolError> {
    check_len("string map", map.len(), u16::MAX as usize)?;
    buf.put_u16(map.len() as u16);
    for (k, v) in map {
        write_string(buf, k)?;
        write_string(buf, v)?;
    }
    Ok(())
}

pub fn write_bytes_map(
    buf: &mut impl BufMut,
    map: &BTreeMap<String, Bytes>,
) -> Result<(), ProtocolError> {
    check_len("bytes map", map.len(), u16::MAX as usize)?;
    buf.put_u16(map.len() as u16);
    for (k, v) in map {
        write_string(buf, k)?;
        write_bytes(buf, Some(v))?;
    }
    Ok(())
}

/// Writes a `[value]`. Unset values require protocol v4 or later.
pub fn write_value(
    buf: &mut impl BufMut,
    value: &Value,
    version: crate::ProtocolVersion,
) -> Result<(), ProtocolError> {
    match value {
        Value::Set(b) => write_bytes(buf, Some(b)),
        Value::Null => write_bytes(buf, None),
        Value::Unset => {
            if version < crate::ProtocolVersion::V4 {
                return Err(ProtocolError::requires("unset values", 4, version));
            }
            buf.put_i32(UNSET_LENGTH);
            Ok(())
        }
    }
}

pub fn write_consistency(buf: &mut impl BufMut, consistency: Consistency) {
    buf.put_u16(consistency.as_u16());
}
