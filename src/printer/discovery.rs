use serde::Serialize;

use crate::error::{PrinterError, PrinterResult};
use crate::printer::host::DeviceDescriptor;
use crate::printer::profiles::{find_profile, CodepageMapping, CommandLanguage, DeviceProfile};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPrinter {
    pub vendor_id: u16,
    pub product_id: u16,
    pub model_name: String,
    pub serial: Option<String>,
    pub profile: &'static str,
    pub language: CommandLanguage,
    pub codepage_mapping: CodepageMapping,
}

/// Resolve each descriptor against `catalog`, dropping unknown devices.
pub fn classify(
    catalog: &'static [DeviceProfile],
    devices: impl IntoIterator<Item = DeviceDescriptor>,
) -> Vec<DiscoveredPrinter> {
    devices
        .into_iter()
        .filter_map(|dev| {
            let profile = find_profile(catalog, dev.vendor_id, dev.product_id)?;

            let model_name = dev
                .product_name
                .clone()
                .unwrap_or_else(|| format!("{} {:04x}", profile.name, dev.product_id));

            tracing::info!(
                "Found {} device: {} (VID={:04x} PID={:04x})",
                profile.name,
                model_name,
                dev.vendor_id,
                dev.product_id
            );

            Some(DiscoveredPrinter {
                vendor_id: dev.vendor_id,
                product_id: dev.product_id,
                language: profile.resolve_language(&dev),
                codepage_mapping: profile.codepage_mapping,
                profile: profile.name,
                serial: dev.serial_number,
                model_name,
            })
        })
        .collect()
}

/// Attached USB devices that some profile in `catalog` claims.
pub async fn scan_for_printers(
    catalog: &'static [DeviceProfile],
) -> PrinterResult<Vec<DiscoveredPrinter>> {
    let devices = nusb::list_devices()
        .await
        .map_err(|e| PrinterError::Usb(e.to_string()))?;

    let descriptors = devices.map(|dev| DeviceDescriptor {
        vendor_id: dev.vendor_id(),
        product_id: dev.product_id(),
        manufacturer_name: dev.manufacturer_string().map(|s| s.to_string()),
        product_name: dev.product_string().map(|s| s.to_string()),
        serial_number: dev.serial_number().map(|s| s.to_string()),
    });

    Ok(classify(catalog, descriptors))
}
