//! EDNS(0) extraction and response negotiation.

use crate::protocols::protocol::{DnsPacket, DnsRecord};

/// Smallest payload size a client may force us down to.
pub const EDNS_MIN_UDP_SIZE: u16 = 512;
/// Largest payload size we will honor.
pub const EDNS_MAX_UDP_SIZE: u16 = 4096;
/// Used when the client advertises nothing useful (zero).
pub const EDNS_DEFAULT_UDP_SIZE: u16 = 4096;

/// What the request told us about its EDNS(0) support, extracted once per
/// request and carried through the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdnsInfo {
    pub present: bool,
    pub version: u8,
    pub udp_size: u16,
    pub do_bit: bool,
}

impl EdnsInfo {
    /// Scans the additional section for an OPT pseudo record. A request
    /// without one yields `present = false` and the classic 512 byte limit.
    pub fn extract(packet: &DnsPacket) -> EdnsInfo {
        for record in &packet.resources {
            if let DnsRecord::OPT {
                udp_size,
                version,
                do_bit,
            } = *record
            {
                return EdnsInfo {
                    present: true,
                    version,
                    udp_size,
                    do_bit,
                };
            }
        }

        EdnsInfo {
            present: false,
            version: 0,
            udp_size: EDNS_MIN_UDP_SIZE,
            do_bit: false,
        }
    }

    /// The UDP payload size the response may use for this request.
    pub fn negotiated_udp_size(&self) -> u16 {
        if self.present {
            negotiate(self.udp_size)
        } else {
            EDNS_MIN_UDP_SIZE
        }
    }
}

/// Clamps a requested payload size into the supported window. Zero means
/// the client sent an OPT without a usable size and gets the default.
pub fn negotiate(requested: u16) -> u16 {
    if requested == 0 {
        EDNS_DEFAULT_UDP_SIZE
    } else if requested < EDNS_MIN_UDP_SIZE {
        EDNS_MIN_UDP_SIZE
    } else if requested > EDNS_MAX_UDP_SIZE {
        EDNS_MAX_UDP_SIZE
    } else {
        requested
    }
}

/// Removes any OPT pseudo records from the additional section. Cached
/// responses are stored stripped so every hit renegotiates from the
/// current request, and clients that sent no OPT never receive one.
pub fn strip(packet: &mut DnsPacket) {
    packet
        .resources
        .retain(|rec| !matches!(rec, DnsRecord::OPT { .. }));
}

/// Attaches the response OPT for this request.
///
/// The response carries an OPT iff the request carried one. A response
/// that already has an OPT (straight from an upstream) is left alone when
/// the client negotiated EDNS; when it did not, the upstream OPT is
/// stripped instead.
pub fn apply(packet: &mut DnsPacket, info: &EdnsInfo) {
    if !info.present {
        strip(packet);
        return;
    }

    let already_present = packet
        .resources
        .iter()
        .any(|rec| matches!(rec, DnsRecord::OPT { .. }));
    if already_present {
        return;
    }

    packet.resources.push(DnsRecord::OPT {
        udp_size: negotiate(info.udp_size),
        version: 0,
        do_bit: info.do_bit,
    });
}
