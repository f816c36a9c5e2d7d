//! Wire Protocol Constants

// Original-destination header address families
pub const HEADER_FAMILY_IPV4: u8 = 4;
pub const HEADER_FAMILY_IPV6: u8 = 6;

// Original-destination header field sizes
pub const HEADER_FAMILY_LEN: usize = 1;
pub const HEADER_PORT_LEN: usize = 2;
pub const HEADER_IPV4_LEN: usize = HEADER_FAMILY_LEN + 4 + HEADER_PORT_LEN;
pub const HEADER_IPV6_LEN: usize = HEADER_FAMILY_LEN + 16 + HEADER_PORT_LEN;

// Largest datagram the UDP listener accepts
pub const MAX_DATAGRAM_SIZE: usize = 65536;

// SOCKS5 Protocol Version
pub const SOCKS5_VERSION: u8 = 0x05;

// SOCKS5 Commands
pub const SOCKS5_CMD_CONNECT: u8 = 0x01;

// Address Types
pub const SOCKS5_ADDR_IPV4: u8 = 0x01;
pub const SOCKS5_ADDR_DOMAIN: u8 = 0x03;
pub const SOCKS5_ADDR_IPV6: u8 = 0x04;

// Authentication Methods
pub const SOCKS5_AUTH_NONE: u8 = 0x00;
pub const SOCKS5_AUTH_USERPASS: u8 = 0x02;

// Response Codes
pub const SOCKS5_REPLY_SUCCESS: u8 = 0x00;

// Reserved field value
pub const SOCKS5_RESERVED: u8 = 0x00;

// Username/Password authentication version
pub const SOCKS5_USERPASS_VERSION: u8 = 0x01;

// Username/Password authentication status codes
pub const SOCKS5_USERPASS_SUCCESS: u8 = 0x00;
