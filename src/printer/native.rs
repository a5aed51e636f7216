//! USB host backed by `nusb`.
//!
//! There is no permission prompt on a desktop OS, so "selecting" a device
//! means taking the first attached one that matches the catalog filters,
//! preferring a configured serial number when one is set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use nusb::descriptors::TransferType;
use nusb::hotplug::HotplugEvent;
use nusb::transfer::{Buffer, Bulk, In, Out};
use nusb::Endpoint;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::{PrinterError, PrinterResult};
use crate::printer::host::{
    DeviceDescriptor, DeviceId, Direction, EndpointInfo, TransferKind, UsbDevice, UsbHost,
};
use crate::printer::profiles::Filter;

/// How long to wait for a reset device to show up again.
const REAPPEAR_ATTEMPTS: usize = 10;
const REAPPEAR_INTERVAL: Duration = Duration::from_millis(200);

fn usb_err(e: impl std::fmt::Display) -> PrinterError {
    PrinterError::Usb(e.to_string())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Default)]
pub struct NusbHost {
    preferred_serial: Option<String>,
}

impl NusbHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preferred_serial(mut self, serial: Option<String>) -> Self {
        self.preferred_serial = serial;
        self
    }

    async fn attached(&self) -> PrinterResult<Vec<NusbDevice>> {
        let devices = nusb::list_devices().await.map_err(usb_err)?;
        Ok(devices.map(NusbDevice::new).collect())
    }
}

#[async_trait]
impl UsbHost for NusbHost {
    type Device = NusbDevice;

    async fn request_device(&self, filters: &[Filter]) -> PrinterResult<NusbDevice> {
        let mut candidates: Vec<NusbDevice> = self
            .attached()
            .await?
            .into_iter()
            .filter(|d| {
                let desc = d.descriptor();
                filters.iter().any(|f| f.matches(desc.vendor_id, desc.product_id))
            })
            .collect();

        for d in &candidates {
            let desc = d.descriptor();
            debug!(
                "Candidate printer: {} (VID={:04x} PID={:04x})",
                desc.product_name.as_deref().unwrap_or("unknown"),
                desc.vendor_id,
                desc.product_id
            );
        }

        if let Some(serial) = &self.preferred_serial {
            if let Some(pos) = candidates
                .iter()
                .position(|d| d.descriptor().serial_number.as_ref() == Some(serial))
            {
                return Ok(candidates.swap_remove(pos));
            }
            warn!(serial = %serial, "Preferred printer not attached, using first match");
        }

        if candidates.is_empty() {
            let wanted: Vec<String> = filters.iter().map(Filter::to_string).collect();
            warn!("No attached printer matches {}", wanted.join(", "));
            return Err(PrinterError::NoDeviceSelected);
        }
        Ok(candidates.swap_remove(0))
    }

    async fn authorized_devices(&self) -> PrinterResult<Vec<NusbDevice>> {
        self.attached().await
    }

    fn disconnect_events(&self) -> PrinterResult<BoxStream<'static, DeviceId<Self>>> {
        let watch = nusb::watch_devices().map_err(usb_err)?;

        let removed = watch.filter_map(|event| async move {
            match event {
                HotplugEvent::Connected(info) => {
                    info!(
                        "USB connected: VID={:04x} PID={:04x}",
                        info.vendor_id(),
                        info.product_id()
                    );
                    None
                }
                HotplugEvent::Disconnected(id) => {
                    info!("USB disconnected: {id:?}");
                    Some(id)
                }
            }
        });

        Ok(removed.boxed())
    }
}

/// One attached USB device. Nothing is opened until [`UsbDevice::open`].
///
/// A reset invalidates the nusb handle, so [`UsbDevice::reset`] releases
/// everything and the next [`UsbDevice::open`] looks the device up again.
pub struct NusbDevice {
    info: Mutex<nusb::DeviceInfo>,
    was_reset: AtomicBool,
    descriptor: DeviceDescriptor,
    device: Mutex<Option<nusb::Device>>,
    interface: Mutex<Option<nusb::Interface>>,
    bulk_in: tokio::sync::Mutex<HashMap<u8, Endpoint<Bulk, In>>>,
    bulk_out: tokio::sync::Mutex<HashMap<u8, Endpoint<Bulk, Out>>>,
    closed: watch::Sender<bool>,
}

impl NusbDevice {
    pub fn new(info: nusb::DeviceInfo) -> Self {
        let descriptor = DeviceDescriptor {
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            manufacturer_name: info.manufacturer_string().map(str::to_string),
            product_name: info.product_string().map(str::to_string),
            serial_number: info.serial_number().map(str::to_string),
        };
        let (closed, _) = watch::channel(true);

        Self {
            info: Mutex::new(info),
            was_reset: AtomicBool::new(false),
            descriptor,
            device: Mutex::new(None),
            interface: Mutex::new(None),
            bulk_in: tokio::sync::Mutex::new(HashMap::new()),
            bulk_out: tokio::sync::Mutex::new(HashMap::new()),
            closed,
        }
    }

    fn device(&self) -> PrinterResult<nusb::Device> {
        lock(&self.device).clone().ok_or(PrinterError::Closed)
    }

    fn interface(&self) -> PrinterResult<nusb::Interface> {
        lock(&self.interface).clone().ok_or(PrinterError::Closed)
    }

    async fn release(&self) {
        self.closed.send_replace(true);

        self.bulk_in.lock().await.clear();
        self.bulk_out.lock().await.clear();
        lock(&self.interface).take();
        lock(&self.device).take();
    }

    /// Find the device again after a reset; it may come back under a new id.
    async fn rediscover(&self) -> PrinterResult<()> {
        let previous = self.id();

        for attempt in 1..=REAPPEAR_ATTEMPTS {
            let mut candidates: Vec<nusb::DeviceInfo> = nusb::list_devices()
                .await
                .map_err(usb_err)?
                .filter(|info| {
                    info.vendor_id() == self.descriptor.vendor_id
                        && info.product_id() == self.descriptor.product_id
                })
                .collect();

            let serial = self.descriptor.serial_number.as_deref();
            let pos = candidates
                .iter()
                .position(|info| info.id() == previous)
                .or_else(|| {
                    serial.and_then(|s| {
                        candidates
                            .iter()
                            .position(|info| info.serial_number() == Some(s))
                    })
                })
                .or_else(|| (serial.is_none() && !candidates.is_empty()).then_some(0));

            if let Some(pos) = pos {
                debug!(attempt, "Device back after reset");
                *lock(&self.info) = candidates.swap_remove(pos);
                return Ok(());
            }
            tokio::time::sleep(REAPPEAR_INTERVAL).await;
        }

        Err(PrinterError::Usb(format!(
            "{:04x}:{:04x} did not come back after reset",
            self.descriptor.vendor_id, self.descriptor.product_id
        )))
    }
}

/// IN requests must be a whole number of packets.
fn in_request_len(length: usize, max_packet_size: usize) -> usize {
    let packet = max_packet_size.max(1);
    length.div_ceil(packet).max(1) * packet
}

#[async_trait]
impl UsbDevice for NusbDevice {
    type Id = nusb::DeviceId;

    fn id(&self) -> nusb::DeviceId {
        lock(&self.info).id()
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    #[instrument(skip(self), fields(vid = self.descriptor.vendor_id, pid = self.descriptor.product_id))]
    async fn open(&self) -> PrinterResult<()> {
        if self.was_reset.swap(false, Ordering::SeqCst) {
            self.rediscover().await?;
        }

        let info = lock(&self.info).clone();
        let device = info.open().await.map_err(|e| {
            PrinterError::Usb(format!(
                "Failed to open USB device {:04x}:{:04x}: {}",
                self.descriptor.vendor_id, self.descriptor.product_id, e
            ))
        })?;

        *lock(&self.device) = Some(device);
        self.closed.send_replace(false);
        Ok(())
    }

    async fn select_configuration(&self, configuration: u8) -> PrinterResult<()> {
        let device = self.device()?;

        let active = device
            .active_configuration()
            .map(|c| c.configuration_value())
            .ok();
        if active == Some(configuration) {
            debug!(configuration, "Configuration already active");
            return Ok(());
        }

        device
            .set_configuration(configuration)
            .await
            .map_err(usb_err)
    }

    async fn claim_interface(&self, interface: u8) -> PrinterResult<()> {
        let device = self.device()?;

        // usblp and friends may hold the interface on Linux
        let claimed = device
            .detach_and_claim_interface(interface)
            .await
            .map_err(|e| PrinterError::Usb(format!("failed to claim interface {interface}: {e}")))?;

        self.bulk_in.lock().await.clear();
        self.bulk_out.lock().await.clear();
        *lock(&self.interface) = Some(claimed);
        Ok(())
    }

    fn interface_endpoints(&self, interface: u8) -> PrinterResult<Vec<EndpointInfo>> {
        let device = self.device()?;
        let config = device.active_configuration().map_err(usb_err)?;

        let alt = config
            .interface_alt_settings()
            .find(|alt| alt.interface_number() == interface && alt.alternate_setting() == 0)
            .ok_or(PrinterError::InterfaceNotFound(interface))?;

        Ok(alt
            .endpoints()
            .map(|ep| EndpointInfo {
                address: ep.address(),
                direction: match ep.direction() {
                    nusb::transfer::Direction::In => Direction::In,
                    nusb::transfer::Direction::Out => Direction::Out,
                },
                kind: match ep.transfer_type() {
                    TransferType::Control => TransferKind::Control,
                    TransferType::Isochronous => TransferKind::Isochronous,
                    TransferType::Bulk => TransferKind::Bulk,
                    TransferType::Interrupt => TransferKind::Interrupt,
                },
            })
            .collect())
    }

    async fn reset(&self) -> PrinterResult<()> {
        let device = self.device()?;
        self.release().await;

        if cfg!(target_os = "windows") {
            warn!("USB reset is not supported on Windows, reopening instead");
            return Ok(());
        }

        device.reset().await.map_err(usb_err)?;
        self.was_reset.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn transfer_in(&self, endpoint: u8, length: usize) -> PrinterResult<Bytes> {
        let address = 0x80 | (endpoint & 0x0f);
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(PrinterError::Closed);
        }

        let mut endpoints = self.bulk_in.lock().await;
        if !endpoints.contains_key(&address) {
            let ep = self
                .interface()?
                .endpoint::<Bulk, In>(address)
                .map_err(usb_err)?;
            endpoints.insert(address, ep);
        }
        let ep = endpoints.get_mut(&address).ok_or(PrinterError::Closed)?;

        let requested = in_request_len(length, ep.max_packet_size());
        let mut buffer = Buffer::new(requested);
        buffer.set_requested_len(requested);
        ep.submit(buffer);

        tokio::select! {
            completion = ep.next_complete() => {
                completion.status.map_err(|e| PrinterError::Transfer(e.to_string()))?;
                Ok(Bytes::copy_from_slice(&completion.buffer[..]))
            }
            _ = closed.changed() => {
                ep.cancel_all();
                let _ = ep.next_complete().await;
                Err(PrinterError::Transfer("transfer cancelled".into()))
            }
        }
    }

    async fn transfer_out(&self, endpoint: u8, data: Bytes) -> PrinterResult<usize> {
        let address = endpoint & 0x0f;

        let mut endpoints = self.bulk_out.lock().await;
        if !endpoints.contains_key(&address) {
            let ep = self
                .interface()?
                .endpoint::<Bulk, Out>(address)
                .map_err(usb_err)?;
            endpoints.insert(address, ep);
        }
        let ep = endpoints.get_mut(&address).ok_or(PrinterError::Closed)?;

        ep.submit(Buffer::from(data.to_vec()));
        let completion = ep.next_complete().await;
        completion
            .status
            .map_err(|e| PrinterError::Transfer(e.to_string()))?;
        Ok(completion.actual_len)
    }

    async fn close(&self) -> PrinterResult<()> {
        self.release().await;
        Ok(())
    }
}
