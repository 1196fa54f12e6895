// Copyright 2025-2026 CEMAXECUTER LLC

//! Hardware port implementations.

pub mod fir;
#[cfg(feature = "iio")]
pub mod iio;
#[cfg(feature = "limesuite")]
pub mod lime;
pub mod sim;

use std::sync::Arc;

use crate::error::{Result, SdrError};
use crate::ident::DeviceId;
use crate::port::HardwarePort;

/// Pick the backend for an identifier: `sim:` is the in-memory radio,
/// `uri=` goes through libiio and a bare serial through LimeSuite.
pub fn port_for(id: &DeviceId) -> Result<Arc<dyn HardwarePort>> {
    match id {
        DeviceId::Simulated(_) => Ok(Arc::new(sim::SimPort::new(sim::SimConfig::default()))),
        DeviceId::Uri(_) => uri_port(id),
        DeviceId::Serial(_) => serial_port(id),
    }
}

#[cfg(feature = "iio")]
fn uri_port(_id: &DeviceId) -> Result<Arc<dyn HardwarePort>> {
    Ok(Arc::new(iio::IioPort::new()))
}

#[cfg(not(feature = "iio"))]
fn uri_port(id: &DeviceId) -> Result<Arc<dyn HardwarePort>> {
    Err(SdrError::DeviceOpen {
        id: id.to_string(),
        reason: "built without the iio feature".to_string(),
    })
}

#[cfg(feature = "limesuite")]
fn serial_port(_id: &DeviceId) -> Result<Arc<dyn HardwarePort>> {
    Ok(Arc::new(lime::LimePort::new()))
}

#[cfg(not(feature = "limesuite"))]
fn serial_port(id: &DeviceId) -> Result<Arc<dyn HardwarePort>> {
    Err(SdrError::DeviceOpen {
        id: id.to_string(),
        reason: "built without the limesuite feature".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_always_available() {
        let port = port_for(&DeviceId::Simulated("t".into())).unwrap();
        assert_eq!(port.name(), "sim");
    }

    #[cfg(not(feature = "iio"))]
    #[test]
    fn test_uri_without_feature() {
        let err = port_for(&DeviceId::Uri("ip:192.168.2.1".into())).err().unwrap();
        assert!(matches!(err, SdrError::DeviceOpen { .. }));
    }
}
