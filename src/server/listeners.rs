//! Listeners: UDP, TCP, and DNS-over-TLS, all fanning into the same
//! decision pipeline. Stream transports share one framing loop; the only
//! difference DoT adds is the TLS accept in front of it.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument, warn};

use crate::buffer::buffer::{BytePacketBuffer, VectorPacketBuffer, MAX_DATAGRAM_SIZE};
use crate::metrics::recorder;
use crate::network_utilities::netutil::{read_frame, write_frame};
use crate::protocols::edns::EdnsInfo;
use crate::protocols::protocol::DnsPacket;
use crate::server::context::ServerContext;

/// Stream connections are dropped after this long without a query.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Serializes a response, bounded by `max_size` (the packet codec raises
/// TC when it has to cut records). An empty vector means the response
/// could not be encoded at all and nothing should be sent.
fn encode_response(mut response: DnsPacket, max_size: usize) -> Vec<u8> {
    let mut buffer = VectorPacketBuffer::new();
    match response.write(&mut buffer, max_size) {
        Ok(()) => buffer.buffer,
        Err(err) => {
            warn!(error = %err, "failed to encode response");
            Vec::new()
        }
    }
}

/// Decodes one wire message, runs the pipeline, and returns the encoded
/// response. `clamp_udp` applies the negotiated EDNS payload limit;
/// stream transports are bounded only by the frame format.
async fn respond(
    context: &ServerContext,
    client_ip: IpAddr,
    data: &[u8],
    clamp_udp: bool,
) -> Vec<u8> {
    let request = BytePacketBuffer::from_slice(data)
        .map_err(crate::protocols::protocol::ProtocolError::from)
        .and_then(|mut buffer| DnsPacket::from_buffer(&mut buffer));

    match request {
        Ok(request) => {
            let max_size = if clamp_udp {
                EdnsInfo::extract(&request).negotiated_udp_size() as usize
            } else {
                u16::MAX as usize
            };

            let response = context.handler.handle(client_ip, request).await;
            encode_response(response, max_size)
        }
        Err(err) => {
            // Salvage the transaction ID when the first two bytes made it.
            debug!(%client_ip, error = %err, "dropping undecodable message");
            let id = match data {
                [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
                _ => 0,
            };
            let response = context.handler.handle_malformed(client_ip, id);
            encode_response(response, 512)
        }
    }
}

/// The UDP listener: one receive loop, one task per datagram.
pub async fn run_udp(
    context: Arc<ServerContext>,
    socket: UdpSocket,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = Arc::new(socket);
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(error = %err, "udp receive failed");
                        continue;
                    }
                };

                let data = buf[..len].to_vec();
                let socket = Arc::clone(&socket);
                let context = Arc::clone(&context);

                tokio::spawn(async move {
                    recorder::client_connected();
                    let response = respond(&context, peer.ip(), &data, true).await;
                    if !response.is_empty() {
                        if let Err(err) = socket.send_to(&response, peer).await {
                            debug!(%peer, error = %err, "udp send failed");
                        }
                    }
                    recorder::client_disconnected();
                });
            }
        }
    }

    info!("udp listener stopped");
}

/// One framed request/response loop, shared by TCP and TLS streams.
/// Serves queries until EOF, an error, or the idle deadline.
async fn serve_stream<S>(context: &ServerContext, client_ip: IpAddr, stream: &mut S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = match timeout(STREAM_IDLE_TIMEOUT, read_frame(stream)).await {
            Err(_) => {
                debug!(%client_ip, "stream idle, closing");
                break;
            }
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => break,
            Ok(Err(err)) => {
                debug!(%client_ip, error = %err, "stream read failed");
                break;
            }
        };

        let response = respond(context, client_ip, &frame, false).await;
        if response.is_empty() {
            continue;
        }
        if let Err(err) = write_frame(stream, &response).await {
            debug!(%client_ip, error = %err, "stream write failed");
            break;
        }
    }
}

/// The TCP listener: accept loop, one task per connection.
pub async fn run_tcp(
    context: Arc<ServerContext>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (mut stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "tcp accept failed");
                        continue;
                    }
                };

                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    recorder::client_connected();
                    serve_stream(&context, peer.ip(), &mut stream).await;
                    recorder::client_disconnected();
                });
            }
        }
    }

    info!("tcp listener stopped");
}

/// The DNS-over-TLS listener. The TLS configuration arrives fully built;
/// we only make sure the ALPN list advertises `dot`.
pub async fn run_dot(
    context: Arc<ServerContext>,
    listener: TcpListener,
    mut tls: rustls::ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    if !tls.alpn_protocols.iter().any(|proto| proto == b"dot") {
        tls.alpn_protocols.push(b"dot".to_vec());
    }
    let acceptor = TlsAcceptor::from(Arc::new(tls));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "dot accept failed");
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    recorder::client_connected();
                    match acceptor.accept(stream).await {
                        Ok(mut tls_stream) => {
                            handle_dot_connection(&context, peer.ip(), &mut tls_stream).await;
                        }
                        Err(err) => debug!(%peer, error = %err, "tls handshake failed"),
                    }
                    recorder::client_disconnected();
                });
            }
        }
    }

    info!("dot listener stopped");
}

#[instrument(skip(context, stream))]
async fn handle_dot_connection<S>(context: &ServerContext, client_ip: IpAddr, stream: &mut S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    serve_stream(context, client_ip, stream).await;
}
