//! SOCKS5 Client Handshake
//!
//! Client side of RFC 1928/1929, used by SOCKS5 dialers to open an egress
//! stream through an upstream proxy.

use std::net::{IpAddr, SocketAddr};

use anyhow::anyhow;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::constants::*;
use crate::Result;

/// Username/password credentials for an upstream proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// SOCKS5 client bound to a connected stream
pub struct Socks5Client {
    stream: TcpStream,
}

impl Socks5Client {
    /// Create a new client for the given stream
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Run the full handshake and CONNECT to `target`, returning the tunnel
    pub async fn connect(
        mut self,
        target: SocketAddr,
        auth: Option<&ProxyAuth>,
    ) -> Result<TcpStream> {
        let method = if auth.is_some() {
            SOCKS5_AUTH_USERPASS
        } else {
            SOCKS5_AUTH_NONE
        };

        self.send_greeting(&[method]).await?;
        let selected = self.receive_auth_method().await?;
        if selected != method {
            return Err(anyhow!(
                "SOCKS5 proxy rejected authentication method: expected {}, got {}",
                method,
                selected
            ));
        }

        if let Some(auth) = auth {
            self.authenticate_username_password(&auth.username, &auth.password)
                .await?;
        }

        self.send_connect_request(target).await?;
        let reply_code = self.receive_connect_response().await?;
        if reply_code != SOCKS5_REPLY_SUCCESS {
            return Err(anyhow!(
                "SOCKS5 connection to {} failed with reply code: {}",
                target,
                reply_code
            ));
        }

        Ok(self.stream)
    }

    /// Send SOCKS5 greeting
    async fn send_greeting(&mut self, methods: &[u8]) -> Result<()> {
        let mut greeting = Vec::with_capacity(2 + methods.len());
        greeting.push(SOCKS5_VERSION);
        greeting.push(methods.len() as u8);
        greeting.extend_from_slice(methods);

        self.stream
            .write_all(&greeting)
            .await
            .map_err(|e| anyhow!("Failed to send greeting: {}", e))?;

        Ok(())
    }

    /// Receive authentication method selection
    async fn receive_auth_method(&mut self) -> Result<u8> {
        let mut response = [0u8; 2];
        self.stream
            .read_exact(&mut response)
            .await
            .map_err(|e| anyhow!("Failed to read auth method response: {}", e))?;

        if response[0] != SOCKS5_VERSION {
            return Err(anyhow!(
                "Invalid SOCKS version in auth response: {}",
                response[0]
            ));
        }

        Ok(response[1])
    }

    /// Authenticate with username/password
    async fn authenticate_username_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<()> {
        if username.len() > 255 || password.len() > 255 {
            return Err(anyhow!("SOCKS5 credentials exceed 255 bytes"));
        }

        let mut auth_request = Vec::with_capacity(3 + username.len() + password.len());
        auth_request.push(SOCKS5_USERPASS_VERSION);
        auth_request.push(username.len() as u8);
        auth_request.extend_from_slice(username.as_bytes());
        auth_request.push(password.len() as u8);
        auth_request.extend_from_slice(password.as_bytes());

        self.stream
            .write_all(&auth_request)
            .await
            .map_err(|e| anyhow!("Failed to send auth request: {}", e))?;

        let mut response = [0u8; 2];
        self.stream
            .read_exact(&mut response)
            .await
            .map_err(|e| anyhow!("Failed to read auth response: {}", e))?;

        if response[0] != SOCKS5_USERPASS_VERSION {
            return Err(anyhow!("Invalid auth response version: {}", response[0]));
        }

        if response[1] != SOCKS5_USERPASS_SUCCESS {
            return Err(anyhow!("Authentication failed"));
        }

        Ok(())
    }

    /// Send CONNECT request
    async fn send_connect_request(&mut self, target: SocketAddr) -> Result<()> {
        let mut request = Vec::with_capacity(22);

        // VER CMD RSV ATYP
        request.push(SOCKS5_VERSION);
        request.push(SOCKS5_CMD_CONNECT);
        request.push(SOCKS5_RESERVED);
        match target.ip() {
            IpAddr::V4(ip) => {
                request.push(SOCKS5_ADDR_IPV4);
                request.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                request.push(SOCKS5_ADDR_IPV6);
                request.extend_from_slice(&ip.octets());
            }
        }
        request.extend_from_slice(&target.port().to_be_bytes());

        self.stream
            .write_all(&request)
            .await
            .map_err(|e| anyhow!("Failed to send connect request: {}", e))?;

        Ok(())
    }

    /// Receive CONNECT response and return the reply code. The bound
    /// address is consumed and discarded.
    async fn receive_connect_response(&mut self) -> Result<u8> {
        // VER REP RSV ATYP
        let mut header = [0u8; 4];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|e| anyhow!("Failed to read connect response header: {}", e))?;

        if header[0] != SOCKS5_VERSION {
            return Err(anyhow!("Invalid SOCKS version in response: {}", header[0]));
        }

        let addr_len = match header[3] {
            SOCKS5_ADDR_IPV4 => 4,
            SOCKS5_ADDR_IPV6 => 16,
            SOCKS5_ADDR_DOMAIN => self.stream.read_u8().await? as usize,
            other => return Err(anyhow!("Unsupported bind address type: {}", other)),
        };

        // BND.ADDR BND.PORT
        let mut bound = vec![0u8; addr_len + 2];
        self.stream.read_exact(&mut bound).await?;

        Ok(header[1])
    }
}
