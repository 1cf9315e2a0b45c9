//! Connection handshake: OPTIONS, STARTUP and the authentication exchange.
//!
//! Runs on stream 0 before the read loop exists, so responses are read
//! straight off the transport.

use crate::auth::Authenticator;
use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::reader::{FrameReader, Incoming};
use crate::writer::DeadlineWriter;
use bytes::Bytes;
use cqlwire_protocol::{
    decode_response, Compressor, Encoder, ParsedResponse, Request, Response, Supported,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

const HANDSHAKE_STREAM: i16 = 0;

/// What the handshake settled on.
#[derive(Debug)]
pub(crate) struct Negotiated {
    pub(crate) supported: Supported,
    /// Compressor accepted by the server, if any.
    pub(crate) compressor: Option<Arc<dyn Compressor>>,
}

pub(crate) struct Handshake<'a, R, W> {
    reader: &'a mut FrameReader<R>,
    writer: &'a DeadlineWriter<W>,
    config: &'a ConnectionConfig,
    encoder: Encoder,
}

impl<'a, R, W> Handshake<'a, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(
        reader: &'a mut FrameReader<R>,
        writer: &'a DeadlineWriter<W>,
        config: &'a ConnectionConfig,
    ) -> Self {
        Self {
            reader,
            writer,
            config,
            encoder: Encoder::new(config.protocol_version),
        }
    }

    pub(crate) async fn run(mut self) -> Result<Negotiated, ClientError> {
        let supported = match self.round_trip(&Request::Options).await? {
            Response::Supported(supported) => supported,
            other => return Err(unexpected(other)),
        };
        tracing::debug!(options = ?supported.options, "server options");

        let compressor = self.choose_compressor(&supported);
        let startup = self.startup_options(compressor.as_deref());
        if let Some(compressor) = &compressor {
            self.encoder = self.encoder.clone().with_compressor(Arc::clone(compressor));
        }

        match self.round_trip(&Request::Startup(startup)).await? {
            Response::Ready => {}
            Response::Authenticate(class) => self.authenticate(class).await?,
            other => return Err(unexpected(other)),
        }

        Ok(Negotiated {
            supported,
            compressor,
        })
    }

    fn choose_compressor(&self, supported: &Supported) -> Option<Arc<dyn Compressor>> {
        let compressor = self.config.compressor.as_ref()?;
        if supported.supports_compression(compressor.name()) {
            Some(Arc::clone(compressor))
        } else {
            tracing::warn!(
                compressor = compressor.name(),
                offered = ?supported.compression(),
                "server does not support requested compression, continuing uncompressed"
            );
            None
        }
    }

    fn startup_options(&self, compressor: Option<&dyn Compressor>) -> BTreeMap<String, String> {
        let mut options = BTreeMap::new();
        options.insert("CQL_VERSION".to_string(), self.config.cql_version.clone());
        options.insert("DRIVER_NAME".to_string(), self.config.driver_name.clone());
        options.insert(
            "DRIVER_VERSION".to_string(),
            self.config.driver_version.clone(),
        );
        if let Some(compressor) = compressor {
            options.insert("COMPRESSION".to_string(), compressor.name().to_string());
        }
        options
    }

    async fn authenticate(&mut self, class: String) -> Result<(), ClientError> {
        let root = self
            .config
            .authenticator
            .clone()
            .ok_or_else(|| ClientError::AuthRequired(class.clone()))?;
        tracing::debug!(authenticator = %class, "server requested authentication");

        let challenge = root.challenge(class.as_bytes())?;
        let mut next = challenge.next;
        let mut response = self
            .round_trip(&Request::AuthResponse(Bytes::from(challenge.response)))
            .await;

        loop {
            match response {
                Ok(Response::AuthChallenge(token)) => {
                    let current = next.take().ok_or_else(|| {
                        ClientError::Auth("server sent an unexpected AUTH_CHALLENGE".to_string())
                    })?;
                    let challenge = current.challenge(token.as_deref().unwrap_or_default())?;
                    next = challenge.next;
                    response = self
                        .round_trip(&Request::AuthResponse(Bytes::from(challenge.response)))
                        .await;
                }
                Ok(Response::AuthSuccess(token)) => {
                    let last: &dyn Authenticator = match &next {
                        Some(next) => &**next,
                        None => &*root,
                    };
                    last.success(token.as_deref())?;
                    tracing::debug!("authentication succeeded");
                    return Ok(());
                }
                Ok(other) => return Err(unexpected(other)),
                Err(ClientError::Server(err)) => return Err(ClientError::Auth(err.to_string())),
                Err(err) => return Err(err),
            }
        }
    }

    /// Sends `request` on stream 0 and reads its response.
    ///
    /// A server error reply comes back as `ClientError::Server`.
    async fn round_trip(&mut self, request: &Request) -> Result<Response, ClientError> {
        let frame = self.encoder.encode(request, HANDSHAKE_STREAM, false)?;
        tracing::trace!(opcode = %request.opcode(), "handshake request");
        self.writer
            .write_frame(frame.freeze())
            .await
            .map_err(|failure| failure.error)?;

        let frame = match self.reader.read_frame().await? {
            Incoming::Frame(frame) => frame,
            Incoming::Oversized { error, .. } => return Err(error.into()),
        };
        if frame.header.stream != HANDSHAKE_STREAM {
            return Err(ClientError::Handshake(format!(
                "response on stream {} while handshaking",
                frame.header.stream
            )));
        }

        let got = frame.header.version;
        let parsed: ParsedResponse =
            decode_response(frame, self.encoder.compressor().map(|c| c.as_ref()))?;
        match parsed.response {
            Response::Error(err) => Err(ClientError::Server(err)),
            _ if got != self.config.protocol_version => Err(ClientError::UnexpectedProtocolVersion {
                expected: self.config.protocol_version,
                got,
            }),
            response => Ok(response),
        }
    }
}

fn unexpected(response: Response) -> ClientError {
    ClientError::UnexpectedResponse(response.opcode())
}
