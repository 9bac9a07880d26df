//! Serial port settings and opening.
//!
//! Opening a port touches the OS and may block, so it runs on the blocking pool
//! via `spawn_blocking`. The prealigner speaks 9600 8N1 without flow control by
//! default; every parameter can be overridden from configuration.

use super::link::DynLink;
use crate::error::AppResult;
#[cfg(not(feature = "serial"))]
use crate::error::PrealignError;
use serde::{Deserialize, Serialize};

/// Parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Port parameters.
///
/// # Example
/// ```
/// use prealigner::hardware::SerialSettings;
///
/// let settings = SerialSettings::new("/dev/ttyUSB0").with_baud_rate(19200);
/// assert_eq!(settings.data_bits, 8);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Data bits (5 to 8).
    pub data_bits: u8,
    /// Parity.
    pub parity: Parity,
    /// Stop bits (1 or 2).
    pub stop_bits: u8,
}

impl SerialSettings {
    /// 9600 8N1 on `port`.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }

    /// Set the baud rate.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the data bits.
    pub fn with_data_bits(mut self, data_bits: u8) -> Self {
        self.data_bits = data_bits;
        self
    }

    /// Set the parity.
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the stop bits.
    pub fn with_stop_bits(mut self, stop_bits: u8) -> Self {
        self.stop_bits = stop_bits;
        self
    }
}

#[cfg(feature = "serial")]
fn io_error(context: String) -> impl FnOnce(tokio_serial::Error) -> std::io::Error {
    move |e| std::io::Error::other(format!("{context}: {e}"))
}

/// Open the port described by `settings`.
#[cfg(feature = "serial")]
pub async fn open_serial_async(settings: &SerialSettings) -> AppResult<DynLink> {
    use tokio_serial::SerialPortBuilderExt;

    let settings = settings.clone();
    let stream = tokio::task::spawn_blocking(move || {
        let data_bits = match settings.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let parity = match settings.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        let stop_bits = match settings.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(io_error(format!("Failed to open serial port {}", settings.port)))
    })
    .await
    .map_err(|e| std::io::Error::other(format!("spawn_blocking for serial port opening failed: {e}")))??;

    Ok(Box::new(stream))
}

/// Open the port described by `settings`.
#[cfg(not(feature = "serial"))]
pub async fn open_serial_async(_settings: &SerialSettings) -> AppResult<DynLink> {
    Err(PrealignError::SerialFeatureDisabled)
}

/// Names of the serial ports present on this machine.
#[cfg(feature = "serial")]
pub fn available_ports() -> AppResult<Vec<String>> {
    let ports = tokio_serial::available_ports()
        .map_err(io_error("Failed to enumerate serial ports".to_string()))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Names of the serial ports present on this machine.
#[cfg(not(feature = "serial"))]
pub fn available_ports() -> AppResult<Vec<String>> {
    Err(PrealignError::SerialFeatureDisabled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_9600_8n1() {
        let settings = SerialSettings::new("COM3");
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.data_bits, 8);
        assert_eq!(settings.parity, Parity::None);
        assert_eq!(settings.stop_bits, 1);
    }

    #[test]
    fn builder_overrides() {
        let settings = SerialSettings::new("/dev/ttyS0")
            .with_baud_rate(115_200)
            .with_data_bits(7)
            .with_parity(Parity::Even)
            .with_stop_bits(2);
        assert_eq!(settings.baud_rate, 115_200);
        assert_eq!(settings.data_bits, 7);
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.stop_bits, 2);
    }

    #[cfg(feature = "serial")]
    #[tokio::test]
    async fn missing_port_is_an_io_error() {
        let err = open_serial_async(&SerialSettings::new("/dev/does-not-exist-prealigner"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, crate::error::PrealignError::Io(_)));
    }
}
