use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::time::{timeout, Duration};
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};
use tokio_util::codec::{Decoder, Encoder};

use anyhow::{self, Result};

use crate::instructions::Command;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SerialPortError {
    #[error("connection timeout")]
    Timeout,
    #[error("reading error")]
    ReadingError,
}

/// One line of text sent back by the board.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Response {
    line: String,
}

impl Response {
    pub fn new(line: impl Into<String>) -> Response {
        Response { line: line.into() }
    }

    pub fn line(&self) -> &str {
        &self.line
    }
}

pub(crate) struct PetoiProtocol;

/// Longest reply kept before it is handed out without a newline.
pub(crate) const MAX_LINE_LENGTH: usize = 1024;

fn to_response(line: &[u8]) -> Response {
    Response::new(String::from_utf8_lossy(line).trim())
}

impl Decoder for PetoiProtocol {
    type Item = Response;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match src.iter().position(|b| *b == b'\n') {
            Some(newline) => {
                let message = src.split_to(newline + 1);
                Ok(Some(to_response(&message[..newline])))
            }
            None if src.len() >= MAX_LINE_LENGTH => {
                let message = src.split_to(MAX_LINE_LENGTH);
                Ok(Some(to_response(&message)))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(response) = self.decode(src)? {
            return Ok(Some(response));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let message = src.split();
        Ok(Some(to_response(&message)))
    }
}

impl Encoder<Command> for PetoiProtocol {
    type Error = anyhow::Error;

    fn encode(&mut self, data: Command, buf: &mut BytesMut) -> Result<()> {
        let msg = data.serialize()?;
        buf.reserve(msg.len());
        buf.put(msg.as_ref());
        Ok(())
    }
}

#[async_trait]
pub(crate) trait FramedDriver: Send + Sync {
    async fn send(&mut self, command: Command) -> Result<()>;
    async fn receive(&mut self) -> Result<Response>;
    async fn close(&mut self) -> Result<()>;
}

pub(crate) const TIMEOUT: u64 = 100;
pub const DEFAULT_BAUD_RATE: u32 = 115200;

pub struct FramedSerialDriver {
    framed_port: tokio_util::codec::Framed<SerialStream, PetoiProtocol>,
}

impl FramedSerialDriver {
    pub fn new(port: &str) -> Result<FramedSerialDriver> {
        FramedSerialDriver::with_baud_rate(port, DEFAULT_BAUD_RATE)
    }

    pub fn with_baud_rate(port: &str, baud_rate: u32) -> Result<FramedSerialDriver> {
        let serial_port = tokio_serial::new(port, baud_rate)
            .timeout(std::time::Duration::from_millis(TIMEOUT))
            .open_native_async()?;
        Ok(FramedSerialDriver {
            framed_port: PetoiProtocol.framed(serial_port),
        })
    }
}

#[async_trait]
impl FramedDriver for FramedSerialDriver {
    async fn send(&mut self, command: Command) -> Result<()> {
        self.framed_port.send(command).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Response> {
        let response = timeout(Duration::from_millis(TIMEOUT), self.framed_port.next())
            .await
            .map_err(|_| SerialPortError::Timeout)?
            .ok_or(SerialPortError::ReadingError)??;
        Ok(response)
    }

    async fn close(&mut self) -> Result<()> {
        <_ as SinkExt<Command>>::close(&mut self.framed_port).await?;
        Ok(())
    }
}

fn looks_like_board(name: &str, port_type: &SerialPortType) -> bool {
    if let SerialPortType::UsbPort(_) = port_type {
        return true;
    }
    ["ttyUSB", "ttyACM", "cu.usb", "cu.wchusb", "COM"]
        .iter()
        .any(|pattern| name.contains(pattern))
}

/// Names of the serial ports a board could be attached to, in the order the
/// system reports them.
pub fn available_port_names() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports()?;
    Ok(ports
        .into_iter()
        .filter(|info| looks_like_board(&info.port_name, &info.port_type))
        .map(|info| info.port_name)
        .collect())
}
