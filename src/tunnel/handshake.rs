//! Tunnel authentication and key exchange
//!
//! Standard handshake (two round trips, stream id 0, plaintext):
//! ```text
//! Accepting                                      Relay
//!     |--- HAND_SHAKE [tunnel id][challenge] ------->|
//!     |<-- HAND_SHAKE [tunnel id][response] ---------|
//!     |--- HAND_SHAKE_RESPONSE [password] ---------->|
//!     |        (both derive the key, encrypted from here on)
//! ```
//!
//! Fast connect (one round trip, stream id = first stream):
//! ```text
//!     |--- FAST_CONNECT [tunnel id][challenge][password][enc(address)] -->|
//!     |<-- FAST_CONNECT [tunnel id][response][status] --------------------|
//! ```
//!
//! Variable-length fields are prefixed with a big-endian u16 length.

use super::block::{Block, BlockType, StreamId, CONTROL_STREAM};
use super::connection::{mint_tunnel_id, Tunnel, TunnelId, TunnelState};
use super::multiplexer::Dialer;
use super::stream::StreamSession;
use super::TunnelError;
use crate::crypto::SecurityProvider;
use crate::protocol::{Address, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

const STATUS_CONNECTED: u8 = 0;
const STATUS_FAILED: u8 = 1;

/// Result of the relay side of the handshake
#[derive(Debug)]
pub struct Accepted {
    /// Tunnel id agreed with the peer
    pub tunnel_id: TunnelId,
    /// Stream opened by a fast connect, already registered and pumping
    pub first_stream: Option<Arc<StreamSession>>,
}

/// How the relay answered a fast connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastConnectOutcome {
    Connected,
    Failed,
}

/// Run the standard handshake from the accepting side
pub async fn connect_handshake(
    tunnel: &Arc<Tunnel>,
    provider: &SecurityProvider,
) -> Result<(), TunnelError> {
    guarded(tunnel, async {
        tunnel.begin_handshake(TunnelState::HandShaking)?;
        let auth = provider.authenticator();

        let challenge = auth.generate_challenge()?;
        let mut hello = BytesMut::new();
        hello.put_u128(tunnel.id());
        put_field(&mut hello, &challenge)?;
        tunnel
            .write_block(&Block::new(CONTROL_STREAM, BlockType::HandShake, hello.freeze()))
            .await?;

        let reply = tunnel.read_block().await?;
        tunnel.expect_type(&reply, BlockType::HandShake)?;
        let mut payload = reply.payload;
        let tunnel_id = get_id(&mut payload)?;
        let response = get_field(&mut payload)?;
        auth.validate_challenge_response(&challenge, &response)?;
        tunnel.set_id(tunnel_id);

        let password = auth.generate_encoded_password()?;
        let mut material = BytesMut::new();
        put_field(&mut material, &password)?;
        tunnel
            .write_block(&Block::new(
                CONTROL_STREAM,
                BlockType::HandShakeResponse,
                material.freeze(),
            ))
            .await?;

        let cryptor = provider.derive_cryptor(&password)?;
        tunnel.activate(cryptor)
    })
    .await
}

/// Authenticate and open the first stream in a single round trip
///
/// The caller registers the stream once this returns `Connected`, built
/// with [`StreamSession::fast_connected`]: the request and the reply block
/// handled here used the stream's first sequence number in each direction.
pub async fn fast_connect(
    tunnel: &Arc<Tunnel>,
    provider: &SecurityProvider,
    stream_id: StreamId,
    target: &Address,
) -> Result<FastConnectOutcome, TunnelError> {
    guarded(tunnel, async {
        tunnel.begin_handshake(TunnelState::FastConnecting)?;
        let auth = provider.authenticator();

        let challenge = auth.generate_challenge()?;
        let password = auth.generate_encoded_password()?;
        let cryptor = provider.derive_cryptor(&password)?;
        let request = cryptor.encrypt(&target.encode())?;

        let mut payload = BytesMut::new();
        payload.put_u128(tunnel.id());
        put_field(&mut payload, &challenge)?;
        put_field(&mut payload, &password)?;
        payload.put_slice(&request);
        tunnel
            .write_block(&Block::new(stream_id, BlockType::FastConnect, payload.freeze()))
            .await?;

        let reply = tunnel.read_block().await?;
        tunnel.expect_type(&reply, BlockType::FastConnect)?;
        if reply.stream_id != stream_id {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "fast connect reply for stream {:032x}",
                reply.stream_id
            ))
            .into());
        }

        let mut payload = reply.payload;
        let tunnel_id = get_id(&mut payload)?;
        let response = get_field(&mut payload)?;
        auth.validate_challenge_response(&challenge, &response)?;
        if !payload.has_remaining() {
            return Err(malformed("missing fast connect status"));
        }
        let status = payload.get_u8();

        tunnel.set_id(tunnel_id);
        tunnel.activate(cryptor)?;

        Ok(if status == STATUS_CONNECTED {
            FastConnectOutcome::Connected
        } else {
            FastConnectOutcome::Failed
        })
    })
    .await
}

/// Run the relay side of either handshake
///
/// A fast connect dials the embedded target; when that succeeds the new
/// stream is registered and already pumping by the time this returns.
pub async fn accept_handshake(
    tunnel: &Arc<Tunnel>,
    provider: &SecurityProvider,
    dialer: &dyn Dialer,
) -> Result<Accepted, TunnelError> {
    guarded(tunnel, async {
        let first = tunnel.read_block().await?;
        match first.block_type {
            BlockType::HandShake => accept_standard(tunnel, provider, first).await,
            BlockType::FastConnect => accept_fast(tunnel, provider, dialer, first).await,
            BlockType::Invalid => Err(TunnelError::Handshake(
                "corrupted handshake block".to_string(),
            )),
            other => Err(TunnelError::Handshake(format!(
                "expected a handshake, got {:?}",
                other
            ))),
        }
    })
    .await
}

async fn accept_standard(
    tunnel: &Arc<Tunnel>,
    provider: &SecurityProvider,
    hello: Block,
) -> Result<Accepted, TunnelError> {
    tunnel.begin_handshake(TunnelState::HandShaking)?;

    let mut payload = hello.payload;
    let requested = get_id(&mut payload)?;
    let challenge = get_field(&mut payload)?;
    let response = provider.authenticator().validate_challenge(&challenge)?;

    let tunnel_id = assign_id(requested);
    tunnel.set_id(tunnel_id);

    let mut reply = BytesMut::new();
    reply.put_u128(tunnel_id);
    put_field(&mut reply, &response)?;
    tunnel
        .write_block(&Block::new(CONTROL_STREAM, BlockType::HandShake, reply.freeze()))
        .await?;

    let material = tunnel.read_block().await?;
    tunnel.expect_type(&material, BlockType::HandShakeResponse)?;
    let mut payload = material.payload;
    let password = get_field(&mut payload)?;

    let cryptor = provider.derive_cryptor(&password)?;
    tunnel.activate(cryptor)?;

    Ok(Accepted {
        tunnel_id,
        first_stream: None,
    })
}

async fn accept_fast(
    tunnel: &Arc<Tunnel>,
    provider: &SecurityProvider,
    dialer: &dyn Dialer,
    request: Block,
) -> Result<Accepted, TunnelError> {
    tunnel.begin_handshake(TunnelState::FastConnecting)?;
    let stream_id = request.stream_id;

    let mut payload = request.payload;
    let requested = get_id(&mut payload)?;
    let challenge = get_field(&mut payload)?;
    let password = get_field(&mut payload)?;

    let cryptor = provider.derive_cryptor(&password)?;
    let response = provider.authenticator().validate_challenge(&challenge)?;
    let target = cryptor
        .decrypt(&payload)
        .map_err(|_| TunnelError::Handshake("cannot decrypt fast connect request".to_string()))?;
    let target = Address::decode(&target)?;

    let tunnel_id = assign_id(requested);
    tunnel.set_id(tunnel_id);
    tunnel.activate(cryptor)?;

    debug!("Tunnel {} fast connect to {}", tunnel, target);
    let session = match tokio::time::timeout(tunnel.config().handshake_timeout, dialer.dial(&target))
        .await
    {
        Ok(Ok(io)) => {
            let session = StreamSession::new(stream_id, io, tunnel);
            session.mark_received();
            tunnel.register_stream(Arc::clone(&session))?;
            Some(session)
        }
        Ok(Err(e)) => {
            info!("Tunnel {}: connect to {} failed: {}", tunnel, target, e);
            None
        }
        Err(_) => {
            info!("Tunnel {}: connect to {} timed out", tunnel, target);
            None
        }
    };

    let mut reply = BytesMut::new();
    reply.put_u128(tunnel_id);
    put_field(&mut reply, &response)?;
    reply.put_u8(if session.is_some() {
        STATUS_CONNECTED
    } else {
        STATUS_FAILED
    });

    let sequence = session.as_ref().map(|s| s.next_sequence()).unwrap_or(0);
    tunnel
        .write_block(&Block::new(stream_id, BlockType::FastConnect, reply.freeze()).with_sequence(sequence))
        .await?;

    if let Some(session) = &session {
        session.start_pump(Bytes::new());
    }

    Ok(Accepted {
        tunnel_id,
        first_stream: session,
    })
}

/// Bound the handshake by its timeout; any failure shuts the tunnel down
async fn guarded<T, F>(tunnel: &Tunnel, handshake: F) -> Result<T, TunnelError>
where
    F: Future<Output = Result<T, TunnelError>>,
{
    let result = match tokio::time::timeout(tunnel.config().handshake_timeout, handshake).await {
        Ok(result) => result,
        Err(_) => Err(TunnelError::Timeout),
    };

    if let Err(e) = &result {
        warn!("Tunnel handshake failed: {}", e);
        tunnel.shutdown().await;
    }
    result
}

fn assign_id(requested: TunnelId) -> TunnelId {
    if requested != 0 {
        requested
    } else {
        mint_tunnel_id()
    }
}

fn malformed(what: &str) -> TunnelError {
    ProtocolError::MalformedPayload(what.to_string()).into()
}

fn put_field(buf: &mut BytesMut, field: &[u8]) -> Result<(), TunnelError> {
    let len = u16::try_from(field.len()).map_err(|_| malformed("handshake field too long"))?;
    buf.put_u16(len);
    buf.put_slice(field);
    Ok(())
}

fn get_field(buf: &mut Bytes) -> Result<Bytes, TunnelError> {
    if buf.remaining() < 2 {
        return Err(malformed("truncated handshake field"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(malformed("truncated handshake field"));
    }
    Ok(buf.split_to(len))
}

fn get_id(buf: &mut Bytes) -> Result<TunnelId, TunnelError> {
    if buf.remaining() < 16 {
        return Err(malformed("truncated tunnel id"));
    }
    Ok(buf.get_u128())
}
