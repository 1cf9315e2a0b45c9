//! Scripted CQL peer for tests.

use bytes::{BufMut, Bytes, BytesMut};
use cqlwire_protocol::types::{
    write_bytes, write_short_bytes, write_string, write_string_list, Reader,
};
use cqlwire_protocol::{
    Decoder, ErrorCode, FrameFlags, FrameHeader, Opcode, ProtocolVersion, RawFrame, StreamId,
    EVENT_STREAM_ID,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// What the peer does with one request frame.
pub(crate) enum Reply {
    Frame(Vec<u8>),
    Frames(Vec<Vec<u8>>),
    Delayed(Duration, Vec<u8>),
    Nothing,
    /// Drops the connection.
    Hangup,
}

pub(crate) type Received = Arc<Mutex<Vec<RawFrame>>>;

/// Runs a peer on `stream`, recording every request frame it receives.
pub(crate) fn serve<S, F>(stream: S, handler: F) -> Received
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: Fn(&RawFrame) -> Reply + Send + Sync + 'static,
{
    let received: Received = Arc::default();
    serve_into(stream, handler, Arc::clone(&received));
    received
}

fn serve_into<S, F>(stream: S, handler: F, log: Received)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: Fn(&RawFrame) -> Reply + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let (mut rd, mut wr) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if wr.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            let _ = wr.shutdown().await;
        });

        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; 16 * 1024];
        'read: loop {
            let n = match rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            decoder.extend(&buf[..n]);
            while let Ok(Some(frame)) = decoder.decode_frame() {
                log.lock().push(frame.clone());
                match handler(&frame) {
                    Reply::Frame(bytes) => {
                        let _ = tx.send(bytes);
                    }
                    Reply::Frames(frames) => {
                        for bytes in frames {
                            let _ = tx.send(bytes);
                        }
                    }
                    Reply::Delayed(delay, bytes) => {
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(bytes);
                        });
                    }
                    Reply::Nothing => {}
                    Reply::Hangup => break 'read,
                }
            }
        }
        drop(tx);
        writer.abort();
    });
}

/// A TCP peer accepting a single connection.
pub(crate) struct FakeServer {
    pub(crate) addr: SocketAddr,
    pub(crate) received: Received,
}

impl FakeServer {
    pub(crate) async fn start<F>(handler: F) -> Self
    where
        F: Fn(&RawFrame) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received: Received = Arc::default();
        let log = Arc::clone(&received);

        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                serve_into(socket, handler, log);
            }
        });

        Self { addr, received }
    }

    pub(crate) fn frames(&self, opcode: Opcode) -> Vec<RawFrame> {
        self.received
            .lock()
            .iter()
            .filter(|f| f.header.opcode == opcode)
            .cloned()
            .collect()
    }
}

/// Builds a response frame on `stream`.
pub(crate) fn frame_on(
    version: ProtocolVersion,
    stream: StreamId,
    opcode: Opcode,
    flags: FrameFlags,
    body: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    FrameHeader {
        version,
        is_response: true,
        flags,
        stream,
        opcode,
        length: body.len(),
    }
    .encode(&mut buf);
    buf.put_slice(body);
    buf.to_vec()
}

/// Builds a response to `request` on the same stream.
pub(crate) fn response(request: &RawFrame, opcode: Opcode, body: &[u8]) -> Vec<u8> {
    frame_on(
        request.header.version,
        request.header.stream,
        opcode,
        FrameFlags::new(),
        body,
    )
}

fn body(f: impl FnOnce(&mut BytesMut)) -> Vec<u8> {
    let mut buf = BytesMut::new();
    f(&mut buf);
    buf.to_vec()
}

pub(crate) fn ready(request: &RawFrame) -> Vec<u8> {
    response(request, Opcode::Ready, &[])
}

pub(crate) fn supported(request: &RawFrame) -> Vec<u8> {
    let b = body(|b| {
        b.put_u16(2);
        write_string(b, "COMPRESSION").unwrap();
        write_string_list(b, &["lz4".into(), "snappy".into()]).unwrap();
        write_string(b, "CQL_VERSION").unwrap();
        write_string_list(b, &["3.4.5".into()]).unwrap();
    });
    response(request, Opcode::Supported, &b)
}

pub(crate) fn authenticate(request: &RawFrame, class: &str) -> Vec<u8> {
    let b = body(|b| write_string(b, class).unwrap());
    response(request, Opcode::Authenticate, &b)
}

pub(crate) fn auth_challenge(request: &RawFrame, token: &[u8]) -> Vec<u8> {
    let b = body(|b| write_bytes(b, Some(token)).unwrap());
    response(request, Opcode::AuthChallenge, &b)
}

pub(crate) fn auth_success(request: &RawFrame) -> Vec<u8> {
    let b = body(|b| write_bytes(b, None).unwrap());
    response(request, Opcode::AuthSuccess, &b)
}

pub(crate) fn void(request: &RawFrame) -> Vec<u8> {
    response(request, Opcode::Result, &1i32.to_be_bytes())
}

/// A RESULT/Rows with no metadata and `rows` single-column rows.
pub(crate) fn rows(request: &RawFrame, values: &[&[u8]]) -> Vec<u8> {
    let b = body(|b| {
        b.put_i32(0x0002);
        b.put_i32(0x0004);
        b.put_i32(1);
        b.put_i32(values.len() as i32);
        for value in values {
            write_bytes(b, Some(value)).unwrap();
        }
    });
    response(request, Opcode::Result, &b)
}

pub(crate) fn set_keyspace(request: &RawFrame, keyspace: &str) -> Vec<u8> {
    let b = body(|b| {
        b.put_i32(0x0003);
        write_string(b, keyspace).unwrap();
    });
    response(request, Opcode::Result, &b)
}

pub(crate) fn prepared(request: &RawFrame, id: &[u8]) -> Vec<u8> {
    let version = request.header.version;
    let b = body(|b| {
        b.put_i32(0x0004);
        write_short_bytes(b, id).unwrap();
        if version >= ProtocolVersion::V5 {
            write_short_bytes(b, b"meta").unwrap();
        }
        b.put_i32(0x0004);
        b.put_i32(0);
        if version >= ProtocolVersion::V4 {
            b.put_i32(0);
        }
        b.put_i32(0x0004);
        b.put_i32(0);
    });
    response(request, Opcode::Result, &b)
}

pub(crate) fn error(request: &RawFrame, code: ErrorCode, message: &str) -> Vec<u8> {
    let b = body(|b| {
        b.put_i32(code.code());
        write_string(b, message).unwrap();
    });
    response(request, Opcode::Error, &b)
}

pub(crate) fn unprepared(request: &RawFrame, id: &[u8]) -> Vec<u8> {
    let b = body(|b| {
        b.put_i32(ErrorCode::Unprepared.code());
        write_string(b, "Prepared query with ID not found").unwrap();
        write_short_bytes(b, id).unwrap();
    });
    response(request, Opcode::Error, &b)
}

/// A STATUS_CHANGE event pushed on the event stream.
pub(crate) fn status_event(version: ProtocolVersion, change: &str, addr: SocketAddr) -> Vec<u8> {
    let b = body(|b| {
        write_string(b, "STATUS_CHANGE").unwrap();
        write_string(b, change).unwrap();
        match addr.ip() {
            std::net::IpAddr::V4(ip) => {
                b.put_u8(4);
                b.put_slice(&ip.octets());
            }
            std::net::IpAddr::V6(ip) => {
                b.put_u8(16);
                b.put_slice(&ip.octets());
            }
        }
        b.put_i32(addr.port() as i32);
    });
    frame_on(version, EVENT_STREAM_ID, Opcode::Event, FrameFlags::new(), &b)
}

/// Answers OPTIONS, STARTUP and REGISTER; ignores everything else.
pub(crate) fn handshake_only(request: &RawFrame) -> Reply {
    match request.header.opcode {
        Opcode::Options => Reply::Frame(supported(request)),
        Opcode::Startup | Opcode::Register => Reply::Frame(ready(request)),
        _ => Reply::Nothing,
    }
}

/// Handshake plus a void result for every QUERY and EXECUTE.
pub(crate) fn handshake_then_void(request: &RawFrame) -> Reply {
    match request.header.opcode {
        Opcode::Query | Opcode::Execute => Reply::Frame(void(request)),
        _ => handshake_only(request),
    }
}

pub(crate) fn startup_options(request: &RawFrame) -> BTreeMap<String, String> {
    Reader::new(request.body.clone()).read_string_map().unwrap()
}

pub(crate) fn auth_token(request: &RawFrame) -> Option<Bytes> {
    Reader::new(request.body.clone()).read_bytes().unwrap()
}

/// Statement text of a QUERY or PREPARE (no custom payload).
pub(crate) fn statement(request: &RawFrame) -> String {
    Reader::new(request.body.clone()).read_long_string().unwrap()
}

/// Statement id of an EXECUTE.
pub(crate) fn execute_id(request: &RawFrame) -> Bytes {
    Reader::new(request.body.clone()).read_short_bytes().unwrap()
}
