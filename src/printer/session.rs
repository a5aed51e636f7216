//! A connection to one receipt printer.
//!
//! The session resolves the device against the profile catalog, opens and
//! claims it, and then forwards raw bytes. Device, profile and endpoints are
//! stored together in [`Slot::Open`], so they are always set and cleared as
//! one unit.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::{PrinterError, PrinterResult};
use crate::printer::events::{
    ConnectedInfo, EventKind, EventListeners, ListenStopped, PrinterEvent,
};
use crate::printer::host::{
    DeviceDescriptor, DeviceId, Direction, EndpointInfo, TransferKind, UsbDevice, UsbHost,
};
use crate::printer::profiles::{find_profile, request_filters, DeviceProfile, DEVICE_PROFILES};

pub const DEFAULT_READ_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Bytes requested per inbound transfer. Hosts may round this up to a
    /// whole number of packets, so a `data` event can be longer.
    pub read_size: usize,
    /// Reset the device after claiming its interface, then open and claim
    /// it again.
    pub reset_on_open: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_size: DEFAULT_READ_SIZE,
            reset_on_open: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
}

/// Endpoint numbers in use. Output is always present on an open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub input: Option<u8>,
    pub output: u8,
}

struct OpenPrinter<D> {
    device: Arc<D>,
    profile: &'static DeviceProfile,
    endpoints: Endpoints,
    generation: u64,
    listening: bool,
}

enum Slot<D> {
    Idle,
    Connecting,
    Open(OpenPrinter<D>),
}

impl<D> Slot<D> {
    fn state(&self) -> SessionState {
        match self {
            Slot::Idle => SessionState::Idle,
            Slot::Connecting => SessionState::Connecting,
            Slot::Open(_) => SessionState::Open,
        }
    }
}

struct SessionInner<H: UsbHost> {
    host: H,
    catalog: &'static [DeviceProfile],
    options: SessionOptions,
    slot: Arc<Mutex<Slot<H::Device>>>,
    listeners: Arc<EventListeners>,
    generation: AtomicU64,
    /// Held for the whole of `connect`/`reconnect`, so `Connecting` always
    /// belongs to the one attempt in progress.
    connecting: tokio::sync::Mutex<()>,
}

/// Cheap to clone; clones share the same connection.
pub struct PrinterSession<H: UsbHost> {
    inner: Arc<SessionInner<H>>,
}

impl<H: UsbHost> Clone for PrinterSession<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<H: UsbHost> PrinterSession<H> {
    pub fn new(host: H) -> Self {
        Self::with_catalog(host, DEVICE_PROFILES, SessionOptions::default())
    }

    pub fn with_options(host: H, options: SessionOptions) -> Self {
        Self::with_catalog(host, DEVICE_PROFILES, options)
    }

    pub fn with_catalog(
        host: H,
        catalog: &'static [DeviceProfile],
        options: SessionOptions,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                host,
                catalog,
                options,
                slot: Arc::new(Mutex::new(Slot::Idle)),
                listeners: Arc::new(EventListeners::default()),
                generation: AtomicU64::new(0),
                connecting: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn host(&self) -> &H {
        &self.inner.host
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner.slot).state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn profile(&self) -> Option<&'static DeviceProfile> {
        match &*lock(&self.inner.slot) {
            Slot::Open(open) => Some(open.profile),
            _ => None,
        }
    }

    pub fn endpoints(&self) -> Option<Endpoints> {
        match &*lock(&self.inner.slot) {
            Slot::Open(open) => Some(open.endpoints),
            _ => None,
        }
    }

    pub fn device_descriptor(&self) -> Option<DeviceDescriptor> {
        match &*lock(&self.inner.slot) {
            Slot::Open(open) => Some(open.device.descriptor().clone()),
            _ => None,
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(&*lock(&self.inner.slot), Slot::Open(open) if open.listening)
    }

    pub fn on_connected(&self, f: impl Fn(&ConnectedInfo) + Send + Sync + 'static) {
        self.inner.listeners.on_connected(f);
    }

    pub fn on_disconnected(&self, f: impl Fn() + Send + Sync + 'static) {
        self.inner.listeners.on_disconnected(f);
    }

    pub fn on_data(&self, f: impl Fn(&Bytes) + Send + Sync + 'static) {
        self.inner.listeners.on_data(f);
    }

    pub fn on_listen_stopped(&self, f: impl Fn(&ListenStopped) + Send + Sync + 'static) {
        self.inner.listeners.on_listen_stopped(f);
    }

    pub fn add_event_listener(
        &self,
        kind: EventKind,
        f: impl Fn(&PrinterEvent) + Send + Sync + 'static,
    ) {
        self.inner.listeners.add(kind, f);
    }

    /// Ask the host for a printer the catalog knows about and open it.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> PrinterResult<ConnectedInfo> {
        let filters = request_filters(self.inner.catalog);
        let _turn = self.inner.connecting.lock().await;
        self.begin_connecting();

        match self.inner.host.request_device(&filters).await {
            Ok(device) => self.open(device).await,
            Err(e) => {
                warn!("Could not connect: {e}");
                self.end_connecting();
                Err(e)
            }
        }
    }

    /// Reopen a printer seen before, by serial number or else by vendor/product.
    ///
    /// Returns `Ok(None)` when no such device is available.
    #[instrument(skip(self, previous), fields(vid = previous.vendor_id, pid = previous.product_id))]
    pub async fn reconnect(
        &self,
        previous: &DeviceDescriptor,
    ) -> PrinterResult<Option<ConnectedInfo>> {
        let _turn = self.inner.connecting.lock().await;
        let mut devices = self.inner.host.authorized_devices().await?;

        let Some(pos) = previous.position_in(&devices) else {
            debug!("Previous printer not available");
            return Ok(None);
        };

        self.begin_connecting();
        self.open(devices.swap_remove(pos)).await.map(Some)
    }

    /// Reopen `previous` when possible, otherwise fall back to [`connect`].
    ///
    /// [`connect`]: Self::connect
    pub async fn reconnect_or_connect(
        &self,
        previous: Option<&DeviceDescriptor>,
    ) -> PrinterResult<ConnectedInfo> {
        if let Some(previous) = previous {
            match self.reconnect(previous).await {
                Ok(Some(info)) => return Ok(info),
                Ok(None) => debug!("Previous printer not attached, selecting another"),
                Err(e) => warn!("Could not reopen previous printer: {e}"),
            }
        }
        self.connect().await
    }

    async fn open(&self, device: H::Device) -> PrinterResult<ConnectedInfo> {
        let descriptor = device.descriptor().clone();

        let Some(profile) =
            find_profile(self.inner.catalog, descriptor.vendor_id, descriptor.product_id)
        else {
            warn!(
                "No profile for {:04x}:{:04x}, not opening",
                descriptor.vendor_id, descriptor.product_id
            );
            self.end_connecting();
            return Err(PrinterError::NoMatchingProfile {
                vendor_id: descriptor.vendor_id,
                product_id: descriptor.product_id,
            });
        };

        if self.is_open() {
            debug!("Replacing the open printer");
            if let Err(e) = self.disconnect().await {
                warn!("Closing previous printer failed: {e}");
            }
        }
        self.begin_connecting();

        let device = Arc::new(device);
        let endpoints = match self.configure(&device, profile).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!("Could not open {}: {e}", profile.name);
                if let Err(close) = device.close().await {
                    debug!("Close after failed open: {close}");
                }
                self.end_connecting();
                return Err(e);
            }
        };

        let info = ConnectedInfo {
            kind: "usb",
            manufacturer_name: descriptor.manufacturer_name.clone(),
            product_name: descriptor.product_name.clone(),
            serial_number: descriptor.serial_number.clone(),
            vendor_id: descriptor.vendor_id,
            product_id: descriptor.product_id,
            language: profile.resolve_language(&descriptor),
            codepage_mapping: profile.codepage_mapping,
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.inner.slot) = Slot::Open(OpenPrinter {
            device,
            profile,
            endpoints,
            generation,
            listening: false,
        });

        info!(
            profile = profile.name,
            language = %info.language,
            codepage = %info.codepage_mapping,
            "Printer connected: {} (VID={:04x} PID={:04x})",
            info.product_name.as_deref().unwrap_or("unknown"),
            info.vendor_id,
            info.product_id
        );
        self.inner
            .listeners
            .emit(&PrinterEvent::Connected(info.clone()));
        Ok(info)
    }

    async fn configure(
        &self,
        device: &H::Device,
        profile: &'static DeviceProfile,
    ) -> PrinterResult<Endpoints> {
        claim(device, profile).await?;

        let available = device.interface_endpoints(profile.interface)?;
        let endpoints = discover_endpoints(&available, profile.endpoint)
            .ok_or(PrinterError::NoOutputEndpoint(profile.interface))?;
        debug!(?endpoints, "Endpoints resolved");

        if self.inner.options.reset_on_open {
            // the old handle is gone after a reset
            device.reset().await?;
            claim(device, profile).await?;
        }
        Ok(endpoints)
    }

    /// Start reading inbound data. Returns `false` if the printer has no
    /// input endpoint or nothing is open.
    pub async fn listen(&self) -> bool {
        let (device, endpoint, generation) = {
            let mut slot = lock(&self.inner.slot);
            let Slot::Open(open) = &mut *slot else {
                return false;
            };
            let Some(endpoint) = open.endpoints.input else {
                return false;
            };
            if open.listening {
                return true;
            }
            open.listening = true;
            (Arc::clone(&open.device), endpoint, open.generation)
        };

        tokio::spawn(read_loop(
            device,
            endpoint,
            self.inner.options.read_size,
            generation,
            Arc::clone(&self.inner.slot),
            Arc::clone(&self.inner.listeners),
        ));
        true
    }

    /// Send raw bytes to the output endpoint. One transfer, no retry.
    pub async fn print(&self, data: impl Into<Bytes>) -> PrinterResult<usize> {
        let (device, endpoint) = match &*lock(&self.inner.slot) {
            Slot::Open(open) => (Arc::clone(&open.device), open.endpoints.output),
            _ => return Err(PrinterError::NotConnected),
        };

        let data = data.into();
        let len = data.len();
        match device.transfer_out(endpoint, data).await {
            Ok(written) => {
                debug!(endpoint, len, written, "Print data sent");
                Ok(written)
            }
            Err(e) => {
                warn!("Print failed: {e}");
                Err(e)
            }
        }
    }

    /// Close the printer. Does nothing, and emits nothing, when idle.
    pub async fn disconnect(&self) -> PrinterResult<()> {
        let Some(open) = self.take_open(|_| true) else {
            return Ok(());
        };

        let result = open.device.close().await;
        if let Err(e) = &result {
            warn!("Error closing printer: {e}");
        }

        info!(profile = open.profile.name, "Printer disconnected");
        self.inner.listeners.emit(&PrinterEvent::Disconnected);
        result
    }

    /// The host reported `id` gone. Clears the session if it was ours.
    pub async fn handle_device_removed(&self, id: &DeviceId<H>) -> bool {
        let Some(open) = self.take_open(|open| open.device.id() == *id) else {
            return false;
        };

        if let Err(e) = open.device.close().await {
            debug!("Close after unplug: {e}");
        }

        info!(profile = open.profile.name, "Printer unplugged");
        self.inner.listeners.emit(&PrinterEvent::Disconnected);
        true
    }

    /// Follow the host's unplug notifications in the background.
    ///
    /// The task ends when the host stops reporting or the session is dropped.
    pub fn watch_disconnects(&self) -> PrinterResult<JoinHandle<()>> {
        let mut removed = self.inner.host.disconnect_events()?;
        let weak = Arc::downgrade(&self.inner);

        Ok(tokio::spawn(async move {
            while let Some(id) = removed.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                PrinterSession { inner }.handle_device_removed(&id).await;
            }
            debug!("Disconnect watcher finished");
        }))
    }

    fn take_open(
        &self,
        pred: impl FnOnce(&OpenPrinter<H::Device>) -> bool,
    ) -> Option<OpenPrinter<H::Device>> {
        let mut slot = lock(&self.inner.slot);
        match &*slot {
            Slot::Open(open) if pred(open) => {}
            _ => return None,
        }
        match mem::replace(&mut *slot, Slot::Idle) {
            Slot::Open(open) => Some(open),
            _ => None,
        }
    }

    fn begin_connecting(&self) {
        let mut slot = lock(&self.inner.slot);
        if matches!(*slot, Slot::Idle) {
            *slot = Slot::Connecting;
        }
    }

    fn end_connecting(&self) {
        let mut slot = lock(&self.inner.slot);
        if matches!(*slot, Slot::Connecting) {
            *slot = Slot::Idle;
        }
    }
}

async fn claim<D: UsbDevice>(device: &D, profile: &DeviceProfile) -> PrinterResult<()> {
    device.open().await?;
    device.select_configuration(profile.configuration).await?;
    device.claim_interface(profile.interface).await
}

/// First bulk IN and bulk OUT endpoint numbers. A fixed output endpoint
/// skips output discovery. `None` if there is no way to send data.
pub fn discover_endpoints(available: &[EndpointInfo], fixed_output: Option<u8>) -> Option<Endpoints> {
    let first = |direction: Direction| {
        available
            .iter()
            .find(|ep| ep.kind == TransferKind::Bulk && ep.direction == direction)
            .map(EndpointInfo::number)
    };

    Some(Endpoints {
        input: first(Direction::In),
        output: fixed_output.or_else(|| first(Direction::Out))?,
    })
}

fn is_current<D>(slot: &Mutex<Slot<D>>, generation: u64) -> bool {
    matches!(&*lock(slot), Slot::Open(open) if open.generation == generation)
}

async fn read_loop<D: UsbDevice>(
    device: Arc<D>,
    endpoint: u8,
    read_size: usize,
    generation: u64,
    slot: Arc<Mutex<Slot<D>>>,
    listeners: Arc<EventListeners>,
) {
    debug!(endpoint, read_size, "Read loop started");

    let reason = loop {
        if !is_current(&slot, generation) {
            break ListenStopped::Released;
        }

        match device.transfer_in(endpoint, read_size).await {
            Ok(data) if data.is_empty() => {}
            Ok(data) => {
                if !is_current(&slot, generation) {
                    break ListenStopped::Released;
                }
                debug!(len = data.len(), "Received data");
                listeners.emit(&PrinterEvent::Data(data));
            }
            Err(e) if !is_current(&slot, generation) => {
                debug!("Read ended after release: {e}");
                break ListenStopped::Released;
            }
            Err(e) => {
                warn!("Read loop stopped: {e}");
                break ListenStopped::Failed(e);
            }
        }
    };

    if let Slot::Open(open) = &mut *lock(&slot) {
        if open.generation == generation {
            open.listening = false;
        }
    }

    listeners.emit(&PrinterEvent::ListenStopped(reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::printer::mock::{MockDevice, MockHost};
    use crate::printer::profiles::{
        CodepageMapping, CommandLanguage, Filter, LanguageSource, EPSON_VENDOR_ID, STAR_VENDOR_ID,
    };

    const WAIT: Duration = Duration::from_secs(2);

    fn star_tsp143() -> MockDevice {
        MockDevice::new(DeviceDescriptor {
            vendor_id: STAR_VENDOR_ID,
            product_id: 0x0003,
            manufacturer_name: Some("STAR".into()),
            product_name: Some("Star TSP143IIIU".into()),
            serial_number: Some("2580018082300087".into()),
        })
    }

    fn epson(serial: &str) -> MockDevice {
        MockDevice::new(DeviceDescriptor {
            vendor_id: EPSON_VENDOR_ID,
            product_id: 0x0e28,
            manufacturer_name: Some("EPSON".into()),
            product_name: Some("TM-T88VI".into()),
            serial_number: Some(serial.into()),
        })
    }

    fn session_with(devices: &[&MockDevice]) -> PrinterSession<MockHost> {
        let host = MockHost::new();
        for d in devices {
            host.attach((*d).clone());
        }
        PrinterSession::new(host)
    }

    fn collect<T: Send + 'static>() -> (mpsc::UnboundedSender<T>, mpsc::UnboundedReceiver<T>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn connect_opens_claims_and_reports() {
        let device = star_tsp143();
        let session = session_with(&[&device]);

        let (tx, mut rx) = collect();
        session.on_connected(move |info| {
            let _ = tx.send(info.clone());
        });

        let info = session.connect().await.unwrap();
        assert_eq!(info.kind, "usb");
        assert_eq!(info.language, CommandLanguage::StarGraphics);
        assert_eq!(info.codepage_mapping, CodepageMapping::Star);
        assert_eq!(info.serial_number.as_deref(), Some("2580018082300087"));
        assert_eq!(rx.try_recv().unwrap(), info);

        let state = device.snapshot();
        assert!(state.opened);
        assert_eq!(state.configuration, Some(1));
        assert_eq!(state.claimed, vec![0]);
        assert_eq!(state.resets, 1);
        assert_eq!(state.opens, 2);

        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.profile().unwrap().name, "Star");
        assert_eq!(
            session.endpoints(),
            Some(Endpoints {
                input: Some(1),
                output: 2
            })
        );
        assert_eq!(
            session.host().offered_filters(),
            request_filters(DEVICE_PROFILES)
        );
    }

    #[tokio::test]
    async fn cancelled_selection_stays_idle() {
        let session = session_with(&[&star_tsp143()]);
        session.host().cancel_selection(true);

        let (tx, mut rx) = collect::<()>();
        session.on_connected(move |_| {
            let _ = tx.send(());
        });

        assert_eq!(
            session.connect().await.err(),
            Some(PrinterError::NoDeviceSelected)
        );
        assert_eq!(session.state(), SessionState::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_device_is_rejected_before_opening() {
        let stranger = MockDevice::new(DeviceDescriptor::new(0x1234, 0x5678));
        let session = session_with(&[&stranger]);

        let result = session
            .reconnect(&DeviceDescriptor::new(0x1234, 0x5678))
            .await;

        assert_eq!(
            result.err(),
            Some(PrinterError::NoMatchingProfile {
                vendor_id: 0x1234,
                product_id: 0x5678
            })
        );
        let state = stranger.snapshot();
        assert!(!state.opened);
        assert_eq!(state.closes, 0);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn reconnect_prefers_serial_number() {
        let a = epson("A");
        let b = epson("B");
        let session = session_with(&[&a, &b]);

        let info = session.reconnect(b.descriptor()).await.unwrap().unwrap();
        assert_eq!(info.serial_number.as_deref(), Some("B"));
        assert!(b.snapshot().opened);
        assert!(!a.snapshot().opened);
    }

    #[tokio::test]
    async fn reconnect_falls_back_to_vendor_and_product() {
        let a = epson("A");
        let session = session_with(&[&a]);

        let mut previous = a.descriptor().clone();
        previous.serial_number = Some("replaced-board".into());

        let info = session.reconnect(&previous).await.unwrap().unwrap();
        assert_eq!(info.serial_number.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn reconnect_without_candidate_is_noop() {
        let session = session_with(&[&epson("A")]);

        let result = session
            .reconnect(&DeviceDescriptor::new(STAR_VENDOR_ID, 0x0003))
            .await;
        assert_eq!(result, Ok(None));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn failed_reconnect_falls_back_to_selection() {
        let stranger = MockDevice::new(DeviceDescriptor::new(0x1234, 0x5678));
        let printer = epson("A");
        let session = session_with(&[&stranger, &printer]);

        let info = session
            .reconnect_or_connect(Some(&DeviceDescriptor::new(0x1234, 0x5678)))
            .await
            .unwrap();
        assert_eq!(info.vendor_id, EPSON_VENDOR_ID);
        assert!(!stranger.snapshot().opened);

        session.disconnect().await.unwrap();
        let info = session
            .reconnect_or_connect(Some(&DeviceDescriptor::new(STAR_VENDOR_ID, 0x0003)))
            .await
            .unwrap();
        assert_eq!(info.serial_number.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn print_sends_one_transfer_to_output() {
        let device = epson("A");
        let session = session_with(&[&device]);
        session.connect().await.unwrap();

        let written = session.print(&b"\x1b@hello"[..]).await.unwrap();
        assert_eq!(written, 7);

        let state = device.snapshot();
        assert_eq!(state.written, vec![(2, Bytes::from_static(b"\x1b@hello"))]);
    }

    #[tokio::test]
    async fn print_without_printer_is_not_connected() {
        let session = session_with(&[]);
        assert_eq!(
            session.print(vec![0x0a]).await,
            Err(PrinterError::NotConnected)
        );
    }

    #[tokio::test]
    async fn print_failure_is_reported_and_session_survives() {
        let device = epson("A").failing_writes();
        let session = session_with(&[&device]);
        session.connect().await.unwrap();

        let result = session.print(vec![0x0a]).await;
        assert!(matches!(result, Err(PrinterError::Transfer(_))));
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn disconnect_when_idle_emits_nothing() {
        let session = session_with(&[]);
        let (tx, mut rx) = collect::<()>();
        session.on_disconnected(move || {
            let _ = tx.send(());
        });

        assert_eq!(session.disconnect().await, Ok(()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_clears_everything_together() {
        let device = star_tsp143();
        let session = session_with(&[&device]);
        let (tx, mut rx) = collect::<()>();
        session.on_disconnected(move || {
            let _ = tx.send(());
        });

        session.connect().await.unwrap();
        assert!(session.profile().is_some());
        assert!(session.endpoints().is_some());
        assert!(session.device_descriptor().is_some());

        session.disconnect().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.profile().is_none());
        assert!(session.endpoints().is_none());
        assert!(session.device_descriptor().is_none());
        assert_eq!(device.snapshot().closes, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn listen_delivers_non_empty_data_in_order() {
        let device = epson("A");
        let session = session_with(&[&device]);
        session.connect().await.unwrap();

        let (tx, mut rx) = collect();
        session.on_data(move |data| {
            let _ = tx.send(data.clone());
        });

        assert!(session.listen().await);
        assert!(session.is_listening());

        device.push_incoming(vec![0x01, 0x02]);
        device.push_incoming(Vec::new());
        device.push_incoming(vec![0x03]);

        let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        let second = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&first[..], &[0x01, 0x02]);
        assert_eq!(&second[..], &[0x03]);

        let reads = device.snapshot().reads;
        assert!(reads.iter().all(|&(ep, len)| ep == 1 && len == DEFAULT_READ_SIZE));
    }

    #[tokio::test]
    async fn listen_without_input_endpoint_returns_false() {
        let device = epson("A").with_endpoints(
            0,
            vec![EndpointInfo {
                address: 0x01,
                direction: Direction::Out,
                kind: TransferKind::Bulk,
            }],
        );
        let session = session_with(&[&device]);
        session.connect().await.unwrap();

        assert_eq!(session.endpoints().unwrap().input, None);
        assert!(!session.listen().await);
    }

    #[tokio::test]
    async fn listen_when_idle_returns_false() {
        let session = session_with(&[]);
        assert!(!session.listen().await);
    }

    #[tokio::test]
    async fn read_failure_reports_listen_stopped() {
        let device = epson("A");
        let session = session_with(&[&device]);
        session.connect().await.unwrap();

        let (tx, mut rx) = collect();
        session.on_listen_stopped(move |reason| {
            let _ = tx.send(reason.clone());
        });

        assert!(session.listen().await);
        device.fail_incoming(PrinterError::Transfer("babble".into()));

        let reason = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            reason,
            ListenStopped::Failed(PrinterError::Transfer("babble".into()))
        );
        assert!(session.is_open());
        assert!(!session.is_listening());
    }

    #[tokio::test]
    async fn disconnect_ends_read_loop_as_released() {
        let device = epson("A");
        let session = session_with(&[&device]);
        session.connect().await.unwrap();

        let (tx, mut rx) = collect();
        session.on_listen_stopped(move |reason| {
            let _ = tx.send(reason.clone());
        });

        assert!(session.listen().await);
        tokio::task::yield_now().await;
        session.disconnect().await.unwrap();

        let reason = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(reason, ListenStopped::Released);
    }

    #[tokio::test]
    async fn unplug_clears_state_and_notifies() {
        let device = star_tsp143();
        let other = epson("A");
        let session = session_with(&[&device, &other]);
        let watcher = session.watch_disconnects().unwrap();

        let (tx, mut rx) = collect::<()>();
        session.on_disconnected(move || {
            let _ = tx.send(());
        });

        session.connect().await.unwrap();

        session.host().unplug(&other);
        tokio::task::yield_now().await;
        assert!(session.is_open());

        session.host().unplug(&device);
        timeout(WAIT, rx.recv()).await.unwrap().unwrap();

        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.profile().is_none());
        assert!(session.endpoints().is_none());
        assert!(rx.try_recv().is_err());

        watcher.abort();
    }

    #[tokio::test]
    async fn removal_of_unrelated_device_is_ignored() {
        let device = epson("A");
        let session = session_with(&[&device]);
        session.connect().await.unwrap();

        assert!(!session.handle_device_removed(&(device.id() + 1000)).await);
        assert!(session.is_open());
        assert!(session.handle_device_removed(&device.id()).await);
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn failed_open_closes_device_and_stays_idle() {
        let device = epson("A").failing_open();
        let session = session_with(&[&device]);

        let (tx, mut rx) = collect::<()>();
        session.on_connected(move |_| {
            let _ = tx.send(());
        });

        assert!(matches!(session.connect().await, Err(PrinterError::Usb(_))));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(device.snapshot().closes, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reset_can_be_disabled() {
        let device = epson("A");
        let host = MockHost::new();
        host.attach(device.clone());
        let session = PrinterSession::with_options(
            host,
            SessionOptions {
                reset_on_open: false,
                ..Default::default()
            },
        );

        session.connect().await.unwrap();
        assert_eq!(device.snapshot().resets, 0);
        assert_eq!(device.snapshot().opens, 1);
    }

    #[tokio::test]
    async fn reset_device_is_reopened_before_use() {
        let device = epson("A");
        let session = session_with(&[&device]);
        session.connect().await.unwrap();

        let (tx, mut rx) = collect();
        session.on_data(move |data| {
            let _ = tx.send(data.clone());
        });

        session.print(vec![0x1b, 0x40]).await.unwrap();
        assert!(session.listen().await);
        device.push_incoming(vec![0x10]);
        let data = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&data[..], &[0x10]);

        let state = device.snapshot();
        assert_eq!(state.resets, 1);
        assert_eq!(state.opens, 2);
        assert_eq!(state.closes, 0);
        assert_eq!(state.written.len(), 1);
    }

    #[tokio::test]
    async fn connect_attempts_take_turns() {
        let device = epson("A");
        let stranger = MockDevice::new(DeviceDescriptor::new(0x1234, 0x5678));
        let session = session_with(&[&device, &stranger]);
        session.host().hold_selection(true);

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.connect().await }
        });
        while session.state() != SessionState::Connecting {
            tokio::task::yield_now().await;
        }

        let second = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .reconnect(&DeviceDescriptor::new(0x1234, 0x5678))
                    .await
            }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!second.is_finished());

        session.host().hold_selection(false);
        let info = timeout(WAIT, first).await.unwrap().unwrap().unwrap();
        assert_eq!(info.serial_number.as_deref(), Some("A"));

        let rejected = timeout(WAIT, second).await.unwrap().unwrap();
        assert!(matches!(
            rejected,
            Err(PrinterError::NoMatchingProfile { .. })
        ));
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.profile().unwrap().name, "Epson");
    }

    #[tokio::test]
    async fn opening_another_printer_replaces_the_first() {
        let a = epson("A");
        let b = star_tsp143();
        let session = session_with(&[&a, &b]);

        let (tx, mut rx) = collect::<()>();
        session.on_disconnected(move || {
            let _ = tx.send(());
        });

        session.connect().await.unwrap();
        let info = session.reconnect(b.descriptor()).await.unwrap().unwrap();

        assert_eq!(info.vendor_id, STAR_VENDOR_ID);
        assert!(!a.snapshot().opened);
        assert!(b.snapshot().opened);
        assert!(rx.try_recv().is_ok());
        assert_eq!(session.profile().unwrap().name, "Star");
    }

    static FIXED_ENDPOINT: &[DeviceProfile] = &[DeviceProfile {
        name: "fixed",
        filters: &[Filter::vendor(EPSON_VENDOR_ID)],
        configuration: 1,
        interface: 0,
        endpoint: Some(3),
        language: LanguageSource::Fixed(CommandLanguage::EscPos),
        codepage_mapping: CodepageMapping::Epson,
    }];

    #[tokio::test]
    async fn fixed_endpoint_overrides_discovery() {
        let device = epson("A");
        let host = MockHost::new();
        host.attach(device.clone());
        let session = PrinterSession::with_catalog(host, FIXED_ENDPOINT, SessionOptions::default());

        session.connect().await.unwrap();
        assert_eq!(session.endpoints().unwrap().output, 3);
        assert_eq!(session.endpoints().unwrap().input, Some(1));

        session.print(vec![0x0a]).await.unwrap();
        assert_eq!(device.snapshot().written[0].0, 3);
    }

    #[test]
    fn discovery_skips_non_bulk_endpoints() {
        let available = [
            EndpointInfo {
                address: 0x83,
                direction: Direction::In,
                kind: TransferKind::Interrupt,
            },
            EndpointInfo {
                address: 0x82,
                direction: Direction::In,
                kind: TransferKind::Bulk,
            },
            EndpointInfo {
                address: 0x01,
                direction: Direction::Out,
                kind: TransferKind::Bulk,
            },
        ];

        assert_eq!(
            discover_endpoints(&available, None),
            Some(Endpoints {
                input: Some(2),
                output: 1
            })
        );
        assert_eq!(discover_endpoints(&available[..2], None), None);
        assert_eq!(
            discover_endpoints(&available[..2], Some(5)).map(|e| e.output),
            Some(5)
        );
    }
}
