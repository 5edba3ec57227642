mod controller;
mod instructions;
mod serial_driver;

pub use controller::{
    await_quit_keystroke, initial_pose, spawn_quit_listener, swing_angles, Controller,
    ControllerConfig, QuitFlag, QUIT_PROMPT,
};
pub use instructions::{Command, CommandError, JointAngle, JointId};
pub use serial_driver::{
    available_port_names, FramedSerialDriver, Response, SerialPortError, DEFAULT_BAUD_RATE,
};

use serial_driver::FramedDriver;

use anyhow::Result;
use tracing::{debug, warn};

/// Driver for a single board attached over a serial port.
pub struct PetoiDriver {
    port: Box<dyn FramedDriver>,
}

impl PetoiDriver {
    pub fn new(port_name: &str) -> Result<PetoiDriver> {
        let driver = FramedSerialDriver::new(port_name)?;
        Ok(PetoiDriver {
            port: Box::new(driver),
        })
    }

    pub fn with_baud_rate(port_name: &str, baud_rate: u32) -> Result<PetoiDriver> {
        let driver = FramedSerialDriver::with_baud_rate(port_name, baud_rate)?;
        Ok(PetoiDriver {
            port: Box::new(driver),
        })
    }

    #[cfg(test)]
    fn with_connection(connection: Box<dyn FramedDriver>) -> PetoiDriver {
        PetoiDriver { port: connection }
    }

    /// Writes the command and then waits for its delay to pass.
    /// The board reply, if any, is left in the read buffer.
    pub async fn send(&mut self, command: &Command) -> Result<()> {
        debug!(%command, "sending command");
        self.port.send(command.clone()).await?;
        tokio::time::sleep(command.delay()).await;
        Ok(())
    }

    pub async fn receive(&mut self) -> Result<Response> {
        self.port.receive().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.port.close().await
    }
}

/// Open ports keyed by name, in discovery order.
#[derive(Default)]
pub struct ConnectedPorts {
    ports: Vec<(String, PetoiDriver)>,
}

impl ConnectedPorts {
    pub fn new() -> ConnectedPorts {
        ConnectedPorts::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, driver: PetoiDriver) {
        let name = name.into();
        self.ports.retain(|(existing, _)| existing != &name);
        self.ports.push((name, driver));
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.ports.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Drops every port except the first one discovered.
    pub fn keep_first(&mut self) {
        self.ports.truncate(1);
    }

    pub async fn send(&mut self, command: &Command) -> Result<()> {
        for (_, driver) in self.ports.iter_mut() {
            driver.send(command).await?;
        }
        Ok(())
    }

    /// Closes and forgets every port. Errors from individual ports are
    /// logged so the remaining ports still get closed.
    pub async fn close_all(&mut self) {
        for (name, mut driver) in self.ports.drain(..) {
            if let Err(error) = driver.close().await {
                warn!(port = %name, %error, "failed to close port");
            }
        }
    }
}

/// Opens the named ports, or every port that looks like a board when `names`
/// is empty. Ports that fail to open are skipped.
pub fn connect_ports(names: &[String], baud_rate: u32) -> Result<ConnectedPorts> {
    let names = if names.is_empty() {
        available_port_names()?
    } else {
        names.to_vec()
    };
    let mut ports = ConnectedPorts::new();
    for name in names {
        match PetoiDriver::with_baud_rate(&name, baud_rate) {
            Ok(driver) => {
                debug!(port = %name, baud_rate, "connected");
                ports.insert(name, driver);
            }
            Err(error) => warn!(port = %name, %error, "failed to open port"),
        }
    }
    Ok(ports)
}
