//! UDP Logger
//!
//! Sends one datagram per processed packet to a fixed destination.
use super::line_logger::{LineLogger, LineSink};
use crate::model::config::UdpLoggerConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

pub struct UdpSink {
    destination: SocketAddr,
    socket: Option<UdpSocket>,
}

impl UdpSink {
    pub fn new(destination: SocketAddr) -> Self {
        Self {
            destination,
            socket: None,
        }
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }
}

#[async_trait]
impl LineSink for UdpSink {
    async fn open(&mut self) -> Result<()> {
        let local: SocketAddr = match self.destination {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.destination).await?;
        debug!("UDP logger sending from {} to {}", socket.local_addr()?, self.destination);
        self.socket = Some(socket);
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let socket = self.socket.as_ref().ok_or_else(|| anyhow!("UDP socket not open"))?;
        socket.send(line.as_bytes()).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.socket = None;
        Ok(())
    }
}

pub type UdpLogger = LineLogger<UdpSink>;

impl UdpLogger {
    pub fn new(config: &UdpLoggerConfig) -> Self {
        Self::with_sink(UdpSink::new(config.destination), config.delimiter.clone())
    }
}
