pub mod edns;
pub mod protocol;

pub use edns::{EdnsInfo, EDNS_DEFAULT_UDP_SIZE, EDNS_MAX_UDP_SIZE, EDNS_MIN_UDP_SIZE};
pub use protocol::{
    DnsHeader, DnsPacket, DnsQuestion, DnsRecord, ProtocolError, QueryType, ResultCode,
    TransientTtl,
};
