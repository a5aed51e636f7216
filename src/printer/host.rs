//! Hardware access consumed by a printer session.
//!
//! A host selects and enumerates devices; a device performs the USB
//! operations. [`NusbHost`](crate::printer::native::NusbHost) talks to real
//! hardware, [`MockHost`](crate::printer::mock::MockHost) is used in tests.

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::error::PrinterResult;
use crate::printer::profiles::Filter;

/// Identity strings and ids a device reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer_name: Option<String>,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            ..Default::default()
        }
    }

    /// Index of the device this descriptor was taken from: serial number
    /// first, then the vendor/product pair.
    pub fn position_in<D: UsbDevice>(&self, devices: &[D]) -> Option<usize> {
        let by_serial = self.serial_number.as_ref().and_then(|serial| {
            devices
                .iter()
                .position(|d| d.descriptor().serial_number.as_ref() == Some(serial))
        });

        by_serial.or_else(|| {
            devices.iter().position(|d| {
                let other = d.descriptor();
                other.vendor_id == self.vendor_id && other.product_id == self.product_id
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint address including the direction bit.
    pub address: u8,
    pub direction: Direction,
    pub kind: TransferKind,
}

impl EndpointInfo {
    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }
}

#[async_trait]
pub trait UsbHost: Send + Sync + 'static {
    type Device: UsbDevice;

    /// Pick one device among those matching `filters`.
    ///
    /// Returns `PrinterError::NoDeviceSelected` when nothing was chosen.
    async fn request_device(&self, filters: &[Filter]) -> PrinterResult<Self::Device>;

    /// Devices this host may open without asking again.
    async fn authorized_devices(&self) -> PrinterResult<Vec<Self::Device>>;

    /// Ids of devices as they are unplugged.
    fn disconnect_events(&self) -> PrinterResult<BoxStream<'static, DeviceId<Self>>>;
}

pub type DeviceId<H> = <<H as UsbHost>::Device as UsbDevice>::Id;

#[async_trait]
pub trait UsbDevice: Send + Sync + 'static {
    type Id: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    fn id(&self) -> Self::Id;

    fn descriptor(&self) -> &DeviceDescriptor;

    async fn open(&self) -> PrinterResult<()>;

    async fn select_configuration(&self, configuration: u8) -> PrinterResult<()>;

    async fn claim_interface(&self, interface: u8) -> PrinterResult<()>;

    /// Endpoints of the default alternate setting of `interface`.
    fn interface_endpoints(&self, interface: u8) -> PrinterResult<Vec<EndpointInfo>>;

    async fn reset(&self) -> PrinterResult<()>;

    async fn transfer_in(&self, endpoint: u8, length: usize) -> PrinterResult<Bytes>;

    async fn transfer_out(&self, endpoint: u8, data: Bytes) -> PrinterResult<usize>;

    async fn close(&self) -> PrinterResult<()>;
}
