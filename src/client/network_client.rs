//! The upstream-facing DNS client.
//!
//! One query, one ephemeral socket, a fresh random transaction ID. A
//! truncated UDP reply is retried over TCP with the standard two byte
//! length prefix. The inbound request's ID is never reused on the
//! upstream leg.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use derive_more::{Display, Error, From};
use rand::random;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{self, Duration};
use tracing::{debug, instrument, warn};

use crate::buffer::buffer::{BytePacketBuffer, VectorPacketBuffer};
use crate::network_utilities::netutil::{read_frame, write_frame};
use crate::protocols::edns::{EdnsInfo, EDNS_MAX_UDP_SIZE};
use crate::protocols::protocol::{DnsPacket, DnsQuestion, DnsRecord};

#[derive(Debug, Display, From, Error)]
pub enum ClientError {
    Protocol(crate::protocols::protocol::ProtocolError),
    Buffer(crate::buffer::buffer::BufferError),
    Io(std::io::Error),
    #[display(fmt = "upstream timed out")]
    #[from(ignore)]
    TimedOut,
    #[display(fmt = "upstream sent an unusable reply")]
    #[from(ignore)]
    LookupFailed,
}

type Result<T> = std::result::Result<T, ClientError>;

/// Transport-level client for talking to one upstream resolver.
#[async_trait]
pub trait DnsClient: Send + Sync {
    fn sent_count(&self) -> usize;
    fn failed_count(&self) -> usize;

    async fn send_query(
        &self,
        question: &DnsQuestion,
        edns: &EdnsInfo,
        server: (&str, u16),
    ) -> Result<DnsPacket>;
}

#[derive(Debug)]
pub struct UdpDnsClient {
    total_sent: AtomicUsize,
    total_failed: AtomicUsize,
    timeout: Duration,
}

impl UdpDnsClient {
    pub fn new(timeout: Duration) -> UdpDnsClient {
        UdpDnsClient {
            total_sent: AtomicUsize::new(0),
            total_failed: AtomicUsize::new(0),
            timeout,
        }
    }

    /// Builds the upstream query: fresh ID, recursion desired, and an
    /// OPT advertising our full receive window with the client's DO bit
    /// mirrored through.
    fn build_query(question: &DnsQuestion, edns: &EdnsInfo) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.id = random::<u16>();
        packet.header.recursion_desired = true;
        packet.header.questions = 1;
        packet.questions.push(question.clone());
        packet.resources.push(DnsRecord::OPT {
            udp_size: EDNS_MAX_UDP_SIZE,
            version: 0,
            do_bit: edns.do_bit,
        });
        packet
    }

    async fn query_udp(&self, query: &mut DnsPacket, address: &str) -> Result<DnsPacket> {
        let mut req_buffer = VectorPacketBuffer::new();
        query.write(&mut req_buffer, EDNS_MAX_UDP_SIZE as usize)?;

        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.map_err(ClientError::Io)?;
        socket
            .send_to(&req_buffer.buffer, address)
            .await
            .map_err(ClientError::Io)?;

        let expected_id = query.header.id;
        let receive = async {
            loop {
                let mut datagram = [0u8; EDNS_MAX_UDP_SIZE as usize];
                let (len, _) = socket.recv_from(&mut datagram).await.map_err(ClientError::Io)?;

                let mut res_buffer = BytePacketBuffer::from_slice(&datagram[..len])?;
                let response = DnsPacket::from_buffer(&mut res_buffer)?;

                if response.header.id == expected_id {
                    return Ok(response);
                }
                debug!(
                    got = response.header.id,
                    expected = expected_id,
                    "dropping reply with unexpected id"
                );
            }
        };

        match time::timeout(self.timeout, receive).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::TimedOut),
        }
    }

    async fn query_tcp(&self, query: &mut DnsPacket, address: &str) -> Result<DnsPacket> {
        let mut req_buffer = VectorPacketBuffer::new();
        query.write(&mut req_buffer, u16::MAX as usize)?;

        let exchange = async {
            let mut stream = TcpStream::connect(address).await.map_err(ClientError::Io)?;
            write_frame(&mut stream, &req_buffer.buffer)
                .await
                .map_err(ClientError::Io)?;

            let body = read_frame(&mut stream)
                .await
                .map_err(ClientError::Io)?
                .ok_or(ClientError::LookupFailed)?;

            let mut res_buffer = BytePacketBuffer::from_slice(&body)?;
            Ok(DnsPacket::from_buffer(&mut res_buffer)?)
        };

        match time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::TimedOut),
        }
    }
}

#[async_trait]
impl DnsClient for UdpDnsClient {
    fn sent_count(&self) -> usize {
        self.total_sent.load(Ordering::Acquire)
    }

    fn failed_count(&self) -> usize {
        self.total_failed.load(Ordering::Acquire)
    }

    #[instrument(skip(self, question, edns), fields(name = %question.name))]
    async fn send_query(
        &self,
        question: &DnsQuestion,
        edns: &EdnsInfo,
        server: (&str, u16),
    ) -> Result<DnsPacket> {
        self.total_sent.fetch_add(1, Ordering::Release);

        let address = format!("{}:{}", server.0, server.1);
        let mut query = Self::build_query(question, edns);

        let result = match self.query_udp(&mut query, &address).await {
            Ok(response) if response.header.truncated_message => {
                debug!(%address, "upstream reply truncated, retrying over tcp");
                let mut tcp_query = Self::build_query(question, edns);
                self.query_tcp(&mut tcp_query, &address).await
            }
            other => other,
        };

        if let Err(ref err) = result {
            self.total_failed.fetch_add(1, Ordering::Release);
            warn!(%address, error = %err, "upstream query failed");
        }

        result
    }
}
