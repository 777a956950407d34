//! RS-485 transport backed by `tokio-serial`

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use super::Transport;
use crate::config::{Parity, SerialConfig};

/// Owns the serial port; reopens it lazily after an I/O error
pub struct SerialTransport {
    config: SerialConfig,
    stream: Option<SerialStream>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    /// Open the port now instead of on the first request
    pub fn open(config: SerialConfig) -> io::Result<Self> {
        let mut transport = Self::new(config);
        transport.stream = Some(transport.connect()?);
        Ok(transport)
    }

    fn connect(&self) -> io::Result<SerialStream> {
        let data_bits = match self.config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let parity = match self.config.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        let stop_bits = match self.config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let stream = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(io::Error::from)?;

        info!(
            "opened {} at {} baud",
            self.config.port, self.config.baud_rate
        );
        Ok(stream)
    }

    async fn exchange(stream: &mut SerialStream, request: &[u8]) -> io::Result<Vec<u8>> {
        // Drop stale bytes left over from an abandoned exchange
        stream.clear(ClearBuffer::Input).map_err(io::Error::from)?;

        stream.write_all(request).await?;
        stream.flush().await?;

        let mut header = [0u8; 3];
        stream.read_exact(&mut header).await?;

        // Exception frames carry a single code byte; normal frames announce their length
        let remaining = if header[1] & 0x80 != 0 {
            2
        } else {
            header[2] as usize + 2
        };

        let mut frame = Vec::with_capacity(3 + remaining);
        frame.extend_from_slice(&header);
        frame.resize(3 + remaining, 0);
        stream.read_exact(&mut frame[3..]).await?;
        Ok(frame)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn transact(&mut self, request: &[u8]) -> io::Result<Vec<u8>> {
        if self.stream.is_none() {
            debug!("serial port closed, reopening {}", self.config.port);
            self.stream = Some(self.connect()?);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "serial port not open"));
        };

        let result = Self::exchange(stream, request).await;
        if let Err(e) = &result {
            warn!("serial exchange failed: {e}");
            self.stream = None;
        }
        result
    }
}
