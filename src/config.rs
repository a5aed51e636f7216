use std::path::Path;

use crate::error::{PrinterError, PrinterResult};
use crate::printer::host::DeviceDescriptor;
use crate::printer::session::{SessionOptions, DEFAULT_READ_SIZE};

pub const ENV_FILE: &str = ".printer_env";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterConfig {
    /// Serial number of the printer to prefer and reconnect to.
    pub serial: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub read_size: usize,
    pub reset_on_open: bool,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            serial: None,
            vendor_id: None,
            product_id: None,
            read_size: DEFAULT_READ_SIZE,
            reset_on_open: true,
        }
    }
}

impl PrinterConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            read_size: self.read_size,
            reset_on_open: self.reset_on_open,
        }
    }

    /// The printer to reconnect to, if enough of it is configured.
    pub fn reconnect_target(&self) -> Option<DeviceDescriptor> {
        let mut target = match (self.vendor_id, self.product_id) {
            (Some(vid), Some(pid)) => DeviceDescriptor::new(vid, pid),
            _ if self.serial.is_some() => DeviceDescriptor::default(),
            _ => return None,
        };
        target.serial_number = self.serial.clone();
        Some(target)
    }
}

/// Read [`ENV_FILE`] if present; the process environment wins over it.
pub fn load_config() -> PrinterResult<PrinterConfig> {
    let env_path = Path::new(ENV_FILE);

    let entries: Vec<(String, String)> = if env_path.exists() {
        dotenvy::from_filename_iter(env_path)
            .map_err(|e| PrinterError::Config(format!("Failed to read {ENV_FILE}: {e}")))?
            .filter_map(|item| item.ok())
            .collect()
    } else {
        tracing::debug!("{ENV_FILE} not found, using environment only");
        Vec::new()
    };

    parse_config(|key| {
        std::env::var(key).ok().or_else(|| {
            entries
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
    })
}

pub fn parse_config(get: impl Fn(&str) -> Option<String>) -> PrinterResult<PrinterConfig> {
    let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let hex = |key: &str| -> PrinterResult<Option<u16>> {
        get(key)
            .map(|v| {
                let digits = v.trim_start_matches("0x").trim_start_matches("0X");
                u16::from_str_radix(digits, 16)
                    .map_err(|e| PrinterError::Config(format!("Invalid {key} {v:?}: {e}")))
            })
            .transpose()
    };

    let read_size = match get("PRINTER_READ_SIZE") {
        Some(v) => match v.parse::<usize>() {
            Ok(0) => return Err(PrinterError::Config("PRINTER_READ_SIZE must be positive".into())),
            Ok(n) => n,
            Err(e) => return Err(PrinterError::Config(format!("Invalid PRINTER_READ_SIZE: {e}"))),
        },
        None => DEFAULT_READ_SIZE,
    };

    let reset_on_open = match get("PRINTER_RESET_ON_OPEN").as_deref() {
        None => true,
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        Some(other) => {
            return Err(PrinterError::Config(format!(
                "Invalid PRINTER_RESET_ON_OPEN: {other:?}"
            )))
        }
    };

    Ok(PrinterConfig {
        serial: get("PRINTER_SERIAL"),
        vendor_id: hex("PRINTER_VENDOR_ID")?,
        product_id: hex("PRINTER_PRODUCT_ID")?,
        read_size,
        reset_on_open,
    })
}
