// implementations of the dns wire protocol

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error, From};
use serde_derive::{Deserialize, Serialize};

use crate::buffer::buffer;
use crate::buffer::buffer::{PacketBuffer, VectorPacketBuffer};

#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(buffer::BufferError),
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// Represents the dns query types this resolver understands
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, Serialize, Deserialize)]
pub enum QueryType {
    /// An unrecognized or custom query type.
    UNKNOWN(u16),
    /// IPv4 address query.
    A, // 1
    /// Authoritative name server.
    NS, // 2
    /// Canonical name.
    CNAME, // 5
    /// Start of authority.
    SOA, // 6
    /// Reverse pointer query.
    PTR, // 12
    /// Mail exchange record query.
    MX, // 15
    /// Text record query.
    TXT, // 16
    /// IPv6 address query.
    AAAA, // 28
    /// Service locator record query.
    SRV, // 33
    /// EDNS(0) pseudo record.
    OPT, // 41
    /// Certificate authority authorization.
    CAA, // 257
}

impl QueryType {
    /// Converts the `QueryType` enum to its corresponding numeric code.
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::UNKNOWN(x) => x,
            QueryType::A => 1,
            QueryType::NS => 2,
            QueryType::CNAME => 5,
            QueryType::SOA => 6,
            QueryType::PTR => 12,
            QueryType::MX => 15,
            QueryType::TXT => 16,
            QueryType::AAAA => 28,
            QueryType::SRV => 33,
            QueryType::OPT => 41,
            QueryType::CAA => 257,
        }
    }

    /// Creates a `QueryType` from a numeric code.
    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            2 => QueryType::NS,
            5 => QueryType::CNAME,
            6 => QueryType::SOA,
            12 => QueryType::PTR,
            15 => QueryType::MX,
            16 => QueryType::TXT,
            28 => QueryType::AAAA,
            33 => QueryType::SRV,
            41 => QueryType::OPT,
            257 => QueryType::CAA,
            _ => QueryType::UNKNOWN(num),
        }
    }

    /// Stable label for metrics and query logs.
    pub fn label(&self) -> String {
        match *self {
            QueryType::UNKNOWN(x) => format!("TYPE{}", x),
            _ => format!("{:?}", self),
        }
    }
}

/// A TTL that is transparent to record comparison. Two records differing
/// only in their remaining TTL are the same record.
#[derive(Copy, Clone, Debug, Eq, Ord, Serialize, Deserialize)]
pub struct TransientTtl(pub u32);

impl PartialEq for TransientTtl {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl PartialOrd for TransientTtl {
    fn partial_cmp(&self, _: &Self) -> Option<Ordering> {
        Some(Ordering::Equal)
    }
}

impl Hash for TransientTtl {
    fn hash<H: Hasher>(&self, _: &mut H) {
        // All TransientTtl instances are treated as equivalent.
    }
}

impl TransientTtl {
    pub fn new(value: u32) -> Self {
        TransientTtl(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// `DnsRecord` is the primary representation of a DNS record.
///
/// This enumeration is used for reading and writing records from the
/// network and for answers synthesized from local data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DnsRecord {
    UNKNOWN {
        domain: String,
        qtype: u16,
        data_len: u16,
        ttl: TransientTtl,
    },
    A {
        domain: String,
        addr: Ipv4Addr,
        ttl: TransientTtl,
    },
    NS {
        domain: String,
        host: String,
        ttl: TransientTtl,
    },
    CNAME {
        domain: String,
        host: String,
        ttl: TransientTtl,
    },
    SOA {
        domain: String,
        m_name: String,
        r_name: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: TransientTtl,
    },
    PTR {
        domain: String,
        host: String,
        ttl: TransientTtl,
    },
    MX {
        domain: String,
        priority: u16,
        host: String,
        ttl: TransientTtl,
    },
    TXT {
        domain: String,
        data: String,
        ttl: TransientTtl,
    },
    AAAA {
        domain: String,
        addr: Ipv6Addr,
        ttl: TransientTtl,
    },
    SRV {
        domain: String,
        priority: u16,
        weight: u16,
        port: u16,
        host: String,
        ttl: TransientTtl,
    },
    CAA {
        domain: String,
        flag: u8,
        tag: String,
        value: String,
        ttl: TransientTtl,
    },
    /// EDNS(0) pseudo record. The advertised payload size rides in the
    /// CLASS field, version and DO bit in the TTL field.
    OPT {
        udp_size: u16,
        version: u8,
        do_bit: bool,
    },
}

impl DnsRecord {
    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsRecord> {
        let mut domain = String::new();
        buffer.read_qname(&mut domain)?;

        let qtype_num = buffer.read_u16()?;
        let qtype = QueryType::from_num(qtype_num);
        let class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()?;

        match qtype {
            QueryType::A => Self::read_a_record(buffer, domain, ttl),
            QueryType::AAAA => Self::read_aaaa_record(buffer, domain, ttl),
            QueryType::NS => Self::read_ns_record(buffer, domain, ttl),
            QueryType::CNAME => Self::read_cname_record(buffer, domain, ttl),
            QueryType::PTR => Self::read_ptr_record(buffer, domain, ttl),
            QueryType::SRV => Self::read_srv_record(buffer, domain, ttl),
            QueryType::MX => Self::read_mx_record(buffer, domain, ttl),
            QueryType::SOA => Self::read_soa_record(buffer, domain, ttl),
            QueryType::TXT => Self::read_txt_record(buffer, domain, ttl, data_len),
            QueryType::CAA => Self::read_caa_record(buffer, domain, ttl, data_len),
            QueryType::OPT => Self::read_opt_record(buffer, class, ttl, data_len),
            QueryType::UNKNOWN(_) => {
                buffer.step(data_len as usize)?;
                Ok(DnsRecord::UNKNOWN {
                    domain,
                    qtype: qtype_num,
                    data_len,
                    ttl: TransientTtl(ttl),
                })
            }
        }
    }

    fn read_a_record<T: PacketBuffer>(
        buffer: &mut T,
        domain: String,
        ttl: u32,
    ) -> Result<DnsRecord> {
        let raw_addr = buffer.read_u32()?;
        let addr = Ipv4Addr::from(raw_addr);

        Ok(DnsRecord::A {
            domain,
            addr,
            ttl: TransientTtl(ttl),
        })
    }

    fn read_aaaa_record<T: PacketBuffer>(
        buffer: &mut T,
        domain: String,
        ttl: u32,
    ) -> Result<DnsRecord> {
        let mut segments = [0u16; 8];
        for segment in &mut segments {
            *segment = buffer.read_u16()?;
        }
        let addr = Ipv6Addr::from(segments);

        Ok(DnsRecord::AAAA {
            domain,
            addr,
            ttl: TransientTtl(ttl),
        })
    }

    fn read_ns_record<T: PacketBuffer>(
        buffer: &mut T,
        domain: String,
        ttl: u32,
    ) -> Result<DnsRecord> {
        let mut ns = String::new();
        buffer.read_qname(&mut ns)?;

        Ok(DnsRecord::NS {
            domain,
            host: ns,
            ttl: TransientTtl(ttl),
        })
    }

    fn read_cname_record<T: PacketBuffer>(
        buffer: &mut T,
        domain: String,
        ttl: u32,
    ) -> Result<DnsRecord> {
        let mut cname = String::new();
        buffer.read_qname(&mut cname)?;

        Ok(DnsRecord::CNAME {
            domain,
            host: cname,
            ttl: TransientTtl(ttl),
        })
    }

    fn read_ptr_record<T: PacketBuffer>(
        buffer: &mut T,
        domain: String,
        ttl: u32,
    ) -> Result<DnsRecord> {
        let mut ptr = String::new();
        buffer.read_qname(&mut ptr)?;

        Ok(DnsRecord::PTR {
            domain,
            host: ptr,
            ttl: TransientTtl(ttl),
        })
    }

    fn read_srv_record<T: PacketBuffer>(
        buffer: &mut T,
        domain: String,
        ttl: u32,
    ) -> Result<DnsRecord> {
        let priority = buffer.read_u16()?;
        let weight = buffer.read_u16()?;
        let port = buffer.read_u16()?;
        let mut srv = String::new();
        buffer.read_qname(&mut srv)?;

        Ok(DnsRecord::SRV {
            domain,
            priority,
            weight,
            port,
            host: srv,
            ttl: TransientTtl(ttl),
        })
    }

    fn read_mx_record<T: PacketBuffer>(
        buffer: &mut T,
        domain: String,
        ttl: u32,
    ) -> Result<DnsRecord> {
        let priority = buffer.read_u16()?;
        let mut mx = String::new();
        buffer.read_qname(&mut mx)?;

        Ok(DnsRecord::MX {
            domain,
            priority,
            host: mx,
            ttl: TransientTtl(ttl),
        })
    }

    fn read_soa_record<T: PacketBuffer>(
        buffer: &mut T,
        domain: String,
        ttl: u32,
    ) -> Result<DnsRecord> {
        let mut m_name = String::new();
        buffer.read_qname(&mut m_name)?;

        let mut r_name = String::new();
        buffer.read_qname(&mut r_name)?;

        let serial = buffer.read_u32()?;
        let refresh = buffer.read_u32()?;
        let retry = buffer.read_u32()?;
        let expire = buffer.read_u32()?;
        let minimum = buffer.read_u32()?;

        Ok(DnsRecord::SOA {
            domain,
            m_name,
            r_name,
            serial,
            refresh,
            retry,
            expire,
            minimum,
            ttl: TransientTtl(ttl),
        })
    }

    fn read_txt_record<T: PacketBuffer>(
        buffer: &mut T,
        domain: String,
        ttl: u32,
        data_len: u16,
    ) -> Result<DnsRecord> {
        // TXT rdata is a sequence of length-prefixed character strings.
        let mut data = String::new();
        let mut consumed = 0usize;
        while consumed < data_len as usize {
            let slen = buffer.read()? as usize;
            consumed += 1;
            let cur_pos = buffer.pos();
            data.push_str(&String::from_utf8_lossy(
                buffer.get_range(cur_pos, slen)?,
            ));
            buffer.step(slen)?;
            consumed += slen;
        }

        Ok(DnsRecord::TXT {
            domain,
            data,
            ttl: TransientTtl(ttl),
        })
    }

    fn read_caa_record<T: PacketBuffer>(
        buffer: &mut T,
        domain: String,
        ttl: u32,
        data_len: u16,
    ) -> Result<DnsRecord> {
        let flag = buffer.read()?;
        let tag_len = buffer.read()? as usize;

        let cur_pos = buffer.pos();
        let tag = String::from_utf8_lossy(buffer.get_range(cur_pos, tag_len)?).to_string();
        buffer.step(tag_len)?;

        let value_len = (data_len as usize).saturating_sub(2 + tag_len);
        let cur_pos = buffer.pos();
        let value = String::from_utf8_lossy(buffer.get_range(cur_pos, value_len)?).to_string();
        buffer.step(value_len)?;

        Ok(DnsRecord::CAA {
            domain,
            flag,
            tag,
            value,
            ttl: TransientTtl(ttl),
        })
    }

    fn read_opt_record<T: PacketBuffer>(
        buffer: &mut T,
        class: u16,
        ttl: u32,
        data_len: u16,
    ) -> Result<DnsRecord> {
        // Any EDNS options in the rdata are skipped; we only negotiate the
        // payload size, version and DO bit.
        buffer.step(data_len as usize)?;

        Ok(DnsRecord::OPT {
            udp_size: class,
            version: ((ttl >> 16) & 0xFF) as u8,
            do_bit: (ttl >> 15) & 1 == 1,
        })
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        let start_pos = buffer.pos();

        // Common prefix of every record: name, type, class, ttl.
        fn write_common<T: PacketBuffer>(
            buffer: &mut T,
            domain: &str,
            query_type: QueryType,
            ttl: u32,
        ) -> Result<()> {
            buffer.write_qname(domain)?;
            buffer.write_u16(query_type.to_num())?;
            buffer.write_u16(1)?; // Record class (IN)
            buffer.write_u32(ttl)?;
            Ok(())
        }

        match *self {
            DnsRecord::A {
                ref domain,
                ref addr,
                ttl: TransientTtl(ttl),
            } => {
                write_common(buffer, domain, QueryType::A, ttl)?;
                buffer.write_u16(4)?;
                for &octet in &addr.octets() {
                    buffer.write_u8(octet)?;
                }
            }
            DnsRecord::AAAA {
                ref domain,
                ref addr,
                ttl: TransientTtl(ttl),
            } => {
                write_common(buffer, domain, QueryType::AAAA, ttl)?;
                buffer.write_u16(16)?;
                for &segment in &addr.segments() {
                    buffer.write_u16(segment)?;
                }
            }
            DnsRecord::NS {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                write_common(buffer, domain, QueryType::NS, ttl)?;
                let pos = buffer.pos();
                buffer.write_u16(0)?;
                buffer.write_qname(host)?;
                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::CNAME {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                write_common(buffer, domain, QueryType::CNAME, ttl)?;
                let pos = buffer.pos();
                buffer.write_u16(0)?;
                buffer.write_qname(host)?;
                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::PTR {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                write_common(buffer, domain, QueryType::PTR, ttl)?;
                let pos = buffer.pos();
                buffer.write_u16(0)?;
                buffer.write_qname(host)?;
                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::SRV {
                ref domain,
                priority,
                weight,
                port,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                write_common(buffer, domain, QueryType::SRV, ttl)?;
                let pos = buffer.pos();
                buffer.write_u16(0)?;
                buffer.write_u16(priority)?;
                buffer.write_u16(weight)?;
                buffer.write_u16(port)?;
                buffer.write_qname(host)?;
                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::MX {
                ref domain,
                priority,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                write_common(buffer, domain, QueryType::MX, ttl)?;
                let pos = buffer.pos();
                buffer.write_u16(0)?;
                buffer.write_u16(priority)?;
                buffer.write_qname(host)?;
                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::SOA {
                ref domain,
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ttl: TransientTtl(ttl),
            } => {
                write_common(buffer, domain, QueryType::SOA, ttl)?;
                let pos = buffer.pos();
                buffer.write_u16(0)?;
                buffer.write_qname(m_name)?;
                buffer.write_qname(r_name)?;
                buffer.write_u32(serial)?;
                buffer.write_u32(refresh)?;
                buffer.write_u32(retry)?;
                buffer.write_u32(expire)?;
                buffer.write_u32(minimum)?;
                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::TXT {
                ref domain,
                ref data,
                ttl: TransientTtl(ttl),
            } => {
                write_common(buffer, domain, QueryType::TXT, ttl)?;
                let chunks: Vec<&[u8]> = data.as_bytes().chunks(255).collect();
                let rd_len = data.len() + chunks.len().max(1);
                buffer.write_u16(rd_len as u16)?;
                if chunks.is_empty() {
                    buffer.write_u8(0)?;
                }
                for chunk in chunks {
                    buffer.write_u8(chunk.len() as u8)?;
                    for &b in chunk {
                        buffer.write_u8(b)?;
                    }
                }
            }
            DnsRecord::CAA {
                ref domain,
                flag,
                ref tag,
                ref value,
                ttl: TransientTtl(ttl),
            } => {
                write_common(buffer, domain, QueryType::CAA, ttl)?;
                buffer.write_u16((2 + tag.len() + value.len()) as u16)?;
                buffer.write_u8(flag)?;
                buffer.write_u8(tag.len() as u8)?;
                for &b in tag.as_bytes() {
                    buffer.write_u8(b)?;
                }
                for &b in value.as_bytes() {
                    buffer.write_u8(b)?;
                }
            }
            DnsRecord::OPT {
                udp_size,
                version,
                do_bit,
            } => {
                buffer.write_u8(0)?; // root name
                buffer.write_u16(QueryType::OPT.to_num())?;
                buffer.write_u16(udp_size)?;
                let flags = ((version as u32) << 16) | ((do_bit as u32) << 15);
                buffer.write_u32(flags)?;
                buffer.write_u16(0)?; // no options
            }
            DnsRecord::UNKNOWN { .. } => {
                tracing::debug!("skipping record: {:?}", self);
            }
        }

        Ok(buffer.pos() - start_pos)
    }

    pub fn get_querytype(&self) -> QueryType {
        match *self {
            DnsRecord::A { .. } => QueryType::A,
            DnsRecord::AAAA { .. } => QueryType::AAAA,
            DnsRecord::NS { .. } => QueryType::NS,
            DnsRecord::CNAME { .. } => QueryType::CNAME,
            DnsRecord::PTR { .. } => QueryType::PTR,
            DnsRecord::SRV { .. } => QueryType::SRV,
            DnsRecord::MX { .. } => QueryType::MX,
            DnsRecord::SOA { .. } => QueryType::SOA,
            DnsRecord::TXT { .. } => QueryType::TXT,
            DnsRecord::CAA { .. } => QueryType::CAA,
            DnsRecord::OPT { .. } => QueryType::OPT,
            DnsRecord::UNKNOWN { qtype, .. } => QueryType::UNKNOWN(qtype),
        }
    }

    pub fn get_domain(&self) -> Option<String> {
        match *self {
            DnsRecord::A { ref domain, .. }
            | DnsRecord::AAAA { ref domain, .. }
            | DnsRecord::NS { ref domain, .. }
            | DnsRecord::CNAME { ref domain, .. }
            | DnsRecord::PTR { ref domain, .. }
            | DnsRecord::SRV { ref domain, .. }
            | DnsRecord::MX { ref domain, .. }
            | DnsRecord::UNKNOWN { ref domain, .. }
            | DnsRecord::SOA { ref domain, .. }
            | DnsRecord::CAA { ref domain, .. }
            | DnsRecord::TXT { ref domain, .. } => Some(domain.clone()),
            DnsRecord::OPT { .. } => None,
        }
    }

    pub fn get_ttl(&self) -> u32 {
        match *self {
            DnsRecord::A { ttl: TransientTtl(ttl), .. }
            | DnsRecord::AAAA { ttl: TransientTtl(ttl), .. }
            | DnsRecord::NS { ttl: TransientTtl(ttl), .. }
            | DnsRecord::CNAME { ttl: TransientTtl(ttl), .. }
            | DnsRecord::PTR { ttl: TransientTtl(ttl), .. }
            | DnsRecord::SRV { ttl: TransientTtl(ttl), .. }
            | DnsRecord::MX { ttl: TransientTtl(ttl), .. }
            | DnsRecord::UNKNOWN { ttl: TransientTtl(ttl), .. }
            | DnsRecord::SOA { ttl: TransientTtl(ttl), .. }
            | DnsRecord::CAA { ttl: TransientTtl(ttl), .. }
            | DnsRecord::TXT { ttl: TransientTtl(ttl), .. } => ttl,
            DnsRecord::OPT { .. } => 0,
        }
    }

    /// Rewrites the TTL in place. Cache hits decay the remaining TTL this
    /// way before a stored response goes back out.
    pub fn set_ttl(&mut self, new_ttl: u32) {
        match *self {
            DnsRecord::A { ref mut ttl, .. }
            | DnsRecord::AAAA { ref mut ttl, .. }
            | DnsRecord::NS { ref mut ttl, .. }
            | DnsRecord::CNAME { ref mut ttl, .. }
            | DnsRecord::PTR { ref mut ttl, .. }
            | DnsRecord::SRV { ref mut ttl, .. }
            | DnsRecord::MX { ref mut ttl, .. }
            | DnsRecord::UNKNOWN { ref mut ttl, .. }
            | DnsRecord::SOA { ref mut ttl, .. }
            | DnsRecord::CAA { ref mut ttl, .. }
            | DnsRecord::TXT { ref mut ttl, .. } => *ttl = TransientTtl(new_ttl),
            DnsRecord::OPT { .. } => {}
        }
    }
}

/// The result code (RCODE) for a DNS response
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResultCode {
    #[default]
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
}

impl ResultCode {
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            _ => ResultCode::NOERROR,
        }
    }
}

/// Representation of a DNS header
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16, // Transaction ID

    // Flags
    pub recursion_desired: bool,
    pub truncated_message: bool,
    pub authoritative_answer: bool,
    pub opcode: u8, // 4 bits
    pub response: bool,

    pub rescode: ResultCode, // 4 bits
    pub checking_disabled: bool,
    pub authed_data: bool,
    pub z: bool,
    pub recursion_available: bool,

    // Record counts
    pub questions: u16,
    pub answers: u16,
    pub authoritative_entries: u16,
    pub resource_entries: u16,
}

impl DnsHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the DNS header to the provided buffer.
    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        // The flags span two bytes
        let flags1 = (self.recursion_desired as u8)
            | ((self.truncated_message as u8) << 1)
            | ((self.authoritative_answer as u8) << 2)
            | (self.opcode << 3)
            | ((self.response as u8) << 7);

        let flags2 = (self.rescode as u8)
            | ((self.checking_disabled as u8) << 4)
            | ((self.authed_data as u8) << 5)
            | ((self.z as u8) << 6)
            | ((self.recursion_available as u8) << 7);

        buffer.write_u8(flags1)?;
        buffer.write_u8(flags2)?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    /// The fixed binary size of the DNS header.
    pub fn binary_len(&self) -> usize {
        12
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let flags1 = (flags >> 8) as u8;
        let flags2 = (flags & 0xFF) as u8;

        self.recursion_desired = (flags1 & (1 << 0)) > 0;
        self.truncated_message = (flags1 & (1 << 1)) > 0;
        self.authoritative_answer = (flags1 & (1 << 2)) > 0;
        self.opcode = (flags1 >> 3) & 0x0F;
        self.response = (flags1 & (1 << 7)) > 0;

        self.rescode = ResultCode::from_num(flags2 & 0x0F);
        self.checking_disabled = (flags2 & (1 << 4)) > 0;
        self.authed_data = (flags2 & (1 << 5)) > 0;
        self.z = (flags2 & (1 << 6)) > 0;
        self.recursion_available = (flags2 & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

/// DNS Question representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: QueryType,
    pub class: u16,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> Self {
        Self {
            name,
            qtype,
            class: 1,
        }
    }

    /// The binary length of the question: labels plus terminator plus
    /// type and class.
    pub fn binary_len(&self) -> usize {
        self.name.split('.').map(|x| x.len() + 1).sum::<usize>() + 1 + 4
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.qtype.to_num())?;
        buffer.write_u16(self.class)?;
        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = QueryType::from_num(buffer.read_u16()?);
        self.class = buffer.read_u16()?;
        Ok(())
    }
}

/// Representation of a complete DNS packet.
///
/// A packet can be read and written in a single operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a dns packet from the packet buffer
    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<Self> {
        let mut packet = Self::new();

        packet.header.read(buffer)?;

        for _ in 0..packet.header.questions {
            let mut question = DnsQuestion::new("".to_string(), QueryType::UNKNOWN(0));
            question.read(buffer)?;
            packet.questions.push(question);
        }

        fn read_records<T: PacketBuffer>(
            count: u16,
            buffer: &mut T,
            target: &mut Vec<DnsRecord>,
        ) -> Result<()> {
            for _ in 0..count {
                target.push(DnsRecord::read(buffer)?);
            }
            Ok(())
        }

        read_records(packet.header.answers, buffer, &mut packet.answers)?;
        read_records(
            packet.header.authoritative_entries,
            buffer,
            &mut packet.authorities,
        )?;
        read_records(packet.header.resource_entries, buffer, &mut packet.resources)?;

        Ok(packet)
    }

    /// The smallest TTL across answer and authority records, ignoring the
    /// OPT pseudo record. Used to bound cache lifetimes.
    pub fn min_record_ttl(&self) -> Option<u32> {
        self.answers
            .iter()
            .chain(&self.authorities)
            .filter(|rec| !matches!(rec, DnsRecord::OPT { .. }))
            .map(|rec| rec.get_ttl())
            .min()
    }

    /// Writes the packet, truncating the record sections if the encoded
    /// size would exceed `max_size`. Section counts in the header are
    /// recomputed from what actually fits; the TC flag is raised when
    /// anything was dropped.
    pub fn write<T: PacketBuffer>(&mut self, buffer: &mut T, max_size: usize) -> Result<()> {
        let mut test_buffer = VectorPacketBuffer::new();
        let mut size = self.header.binary_len();

        for question in &self.questions {
            size += question.binary_len();
            question.write(&mut test_buffer)?;
        }

        let mut answers = 0u16;
        let mut authorities = 0u16;
        let mut resources = 0u16;
        let mut record_count = 0;

        for (i, rec) in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.resources)
            .enumerate()
        {
            size += rec.write(&mut test_buffer)?;
            if size > max_size {
                self.header.truncated_message = true;
                break;
            }

            record_count = i + 1;

            if i < self.answers.len() {
                answers += 1;
            } else if i < self.answers.len() + self.authorities.len() {
                authorities += 1;
            } else {
                resources += 1;
            }
        }

        self.header.questions = self.questions.len() as u16;
        self.header.answers = answers;
        self.header.authoritative_entries = authorities;
        self.header.resource_entries = resources;

        self.header.write(buffer)?;

        for question in &self.questions {
            question.write(buffer)?;
        }

        for rec in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.resources)
            .take(record_count)
        {
            rec.write(buffer)?;
        }

        Ok(())
    }
}
