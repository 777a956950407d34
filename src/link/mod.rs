//! Meter link - request/response exchange with one meter on the shared bus
//!
//! The bus is a single half-duplex line, so the link owns its transport and
//! every operation takes `&mut self`: two reads can never overlap.
//!
//! Each poll is bounded: every attempt runs under a timeout and a failing
//! request is retried a fixed number of times with a short pause in between.
//! A failure is returned as data ([`PollFailure`]), never as a panic.

pub mod frame;
#[cfg(feature = "serial")]
pub mod serial;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument, trace, warn};

use crate::config::{LinkConfig, MeterConfig};
use crate::{PollError, PollFailure};

/// Byte-level request/response channel to the meters
#[async_trait]
pub trait Transport: Send {
    /// Send one request frame and return the complete response frame.
    async fn transact(&mut self, request: &[u8]) -> io::Result<Vec<u8>>;
}

/// Registers read from one meter
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub registers: Vec<u16>,
    pub attempts: u32,
}

pub struct MeterLink<T> {
    transport: T,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
}

impl<T: Transport> MeterLink<T> {
    pub fn new(transport: T, config: &LinkConfig) -> Self {
        Self {
            transport,
            timeout: Duration::from_millis(config.timeout_ms),
            retries: config.retries,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    /// Total number of attempts a failing poll makes
    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }

    /// Read the full register block of a meter's map
    pub async fn poll(&mut self, meter: &MeterConfig) -> Result<RawResponse, PollFailure> {
        let (start, quantity) = meter.register_map.span();
        self.read_registers(meter.address, start, quantity).await
    }

    #[instrument(skip(self))]
    pub async fn read_registers(
        &mut self,
        slave: u8,
        start: u16,
        quantity: u16,
    ) -> Result<RawResponse, PollFailure> {
        if quantity == 0 || quantity > frame::MAX_READ_QUANTITY {
            return Err(PollFailure {
                error: PollError::MalformedFrame(format!("cannot read {quantity} registers")),
                attempts: 0,
            });
        }

        let request = frame::build_read_request(slave, start, quantity);
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            trace!("attempt {attempt}/{max_attempts}: sending {}", hex(&request));

            let error = match tokio::time::timeout(self.timeout, self.transport.transact(&request))
                .await
            {
                Err(_) => PollError::TransportTimeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                },
                Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => PollError::TransportTimeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                },
                Ok(Err(e)) => PollError::Transport(e.to_string()),
                Ok(Ok(response)) => match frame::parse_read_response(&response, slave, quantity) {
                    Ok(registers) => {
                        return Ok(RawResponse {
                            registers,
                            attempts: attempt,
                        });
                    }
                    Err(e) => {
                        debug!("rejected response {}: {e}", hex(&response));
                        e
                    }
                },
            };

            if !error.is_retryable() || attempt >= max_attempts {
                warn!("meter at address {slave} failed after {attempt} attempt(s): {error}");
                return Err(PollFailure {
                    error,
                    attempts: attempt,
                });
            }

            debug!("attempt {attempt} failed: {error}, retrying");
            tokio::time::sleep(self.backoff).await;
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
