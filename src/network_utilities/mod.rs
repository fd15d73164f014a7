pub mod netutil;

pub use netutil::{read_frame, write_frame, IpPrefix};
