use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PrinterError {
    #[error("No printer was selected")]
    NoDeviceSelected,
    #[error("No device profile matches {vendor_id:04x}:{product_id:04x}")]
    NoMatchingProfile { vendor_id: u16, product_id: u16 },
    #[error("Interface {0} not found in active configuration")]
    InterfaceNotFound(u8),
    #[error("Interface {0} has no bulk OUT endpoint")]
    NoOutputEndpoint(u8),
    #[error("Printer not connected")]
    NotConnected,
    #[error("USB error: {0}")]
    Usb(String),
    #[error("Transfer failed: {0}")]
    Transfer(String),
    #[error("Device closed")]
    Closed,
    #[error("Config error: {0}")]
    Config(String),
}

pub type PrinterResult<T> = Result<T, PrinterError>;
