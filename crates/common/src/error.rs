use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubnetError {
    #[error("cluster CIDR prefix must be /8 through /24, got /{0}")]
    PrefixTooLong(u8),
    #[error("index {index} exceeds capacity of cluster CIDR (max index {max})")]
    CapacityExceeded { index: u32, max: u32 },
    #[error("invalid cluster CIDR: {0}")]
    InvalidCidr(#[from] ipnet::AddrParseError),
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("no IP-echo service responded and no fallback hostname configured")]
    NoEndpointsDiscovered,
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("interface enumeration error: {0}")]
    Interfaces(#[from] std::io::Error),
}
