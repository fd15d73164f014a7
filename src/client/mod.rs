pub mod network_client;

pub use network_client::{ClientError, DnsClient, UdpDnsClient};
