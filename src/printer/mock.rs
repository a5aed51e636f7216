//! In-memory host for testing sessions without hardware

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{broadcast, mpsc, watch, Notify};

use crate::error::{PrinterError, PrinterResult};
use crate::printer::host::{
    DeviceDescriptor, DeviceId, Direction, EndpointInfo, TransferKind, UsbDevice, UsbHost,
};
use crate::printer::profiles::Filter;

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Everything a session did to a [`MockDevice`].
#[derive(Debug, Default, Clone)]
pub struct MockDeviceState {
    pub opened: bool,
    pub opens: usize,
    pub configuration: Option<u8>,
    pub claimed: Vec<u8>,
    pub resets: usize,
    pub closes: usize,
    pub written: Vec<(u8, Bytes)>,
    pub reads: Vec<(u8, usize)>,
    pub unplugged: bool,
    pub fail_open: bool,
    pub fail_out: bool,
    interfaces: HashMap<u8, Vec<EndpointInfo>>,
}

struct MockDeviceInner {
    id: u32,
    descriptor: DeviceDescriptor,
    state: Mutex<MockDeviceState>,
    incoming_tx: mpsc::UnboundedSender<PrinterResult<Bytes>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PrinterResult<Bytes>>>,
    closed: watch::Sender<bool>,
}

/// A scripted printer. Clones share state.
#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<MockDeviceInner>,
}

impl MockDevice {
    /// A device with bulk IN 0x81 and bulk OUT 0x02 on interface 0.
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(true);

        let device = Self {
            inner: Arc::new(MockDeviceInner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                descriptor,
                state: Mutex::new(MockDeviceState::default()),
                incoming_tx,
                incoming_rx: tokio::sync::Mutex::new(incoming_rx),
                closed,
            }),
        };

        device.with_endpoints(
            0,
            vec![bulk(0x81, Direction::In), bulk(0x02, Direction::Out)],
        )
    }

    pub fn with_endpoints(self, interface: u8, endpoints: Vec<EndpointInfo>) -> Self {
        self.state().interfaces.insert(interface, endpoints);
        self
    }

    pub fn failing_open(self) -> Self {
        self.state().fail_open = true;
        self
    }

    pub fn failing_writes(self) -> Self {
        self.state().fail_out = true;
        self
    }

    pub fn state(&self) -> MutexGuard<'_, MockDeviceState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> MockDeviceState {
        self.state().clone()
    }

    /// Queue bytes for the next inbound transfer.
    pub fn push_incoming(&self, data: impl Into<Bytes>) {
        let _ = self.inner.incoming_tx.send(Ok(data.into()));
    }

    /// Make the next inbound transfer fail.
    pub fn fail_incoming(&self, error: PrinterError) {
        let _ = self.inner.incoming_tx.send(Err(error));
    }

    fn check_present(&self) -> PrinterResult<()> {
        if self.state().unplugged {
            return Err(PrinterError::Usb("device disconnected".into()));
        }
        Ok(())
    }

    fn check_open(&self) -> PrinterResult<()> {
        self.check_present()?;
        if !self.state().opened {
            return Err(PrinterError::Closed);
        }
        Ok(())
    }
}

fn bulk(address: u8, direction: Direction) -> EndpointInfo {
    EndpointInfo {
        address,
        direction,
        kind: TransferKind::Bulk,
    }
}

#[async_trait]
impl UsbDevice for MockDevice {
    type Id = u32;

    fn id(&self) -> u32 {
        self.inner.id
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.inner.descriptor
    }

    async fn open(&self) -> PrinterResult<()> {
        self.check_present()?;
        let mut state = self.state();
        if state.fail_open {
            return Err(PrinterError::Usb("access denied".into()));
        }
        state.opened = true;
        state.opens += 1;
        self.inner.closed.send_replace(false);
        Ok(())
    }

    async fn select_configuration(&self, configuration: u8) -> PrinterResult<()> {
        self.check_open()?;
        self.state().configuration = Some(configuration);
        Ok(())
    }

    async fn claim_interface(&self, interface: u8) -> PrinterResult<()> {
        self.check_open()?;
        let mut state = self.state();
        if !state.interfaces.contains_key(&interface) {
            return Err(PrinterError::InterfaceNotFound(interface));
        }
        state.claimed.push(interface);
        Ok(())
    }

    fn interface_endpoints(&self, interface: u8) -> PrinterResult<Vec<EndpointInfo>> {
        self.state()
            .interfaces
            .get(&interface)
            .cloned()
            .ok_or(PrinterError::InterfaceNotFound(interface))
    }

    /// Like real hardware, the handle is dead afterwards until reopened.
    async fn reset(&self) -> PrinterResult<()> {
        self.check_open()?;
        {
            let mut state = self.state();
            state.resets += 1;
            state.opened = false;
            state.claimed.clear();
        }
        self.inner.closed.send_replace(true);
        Ok(())
    }

    async fn transfer_in(&self, endpoint: u8, length: usize) -> PrinterResult<Bytes> {
        self.check_open()?;
        self.state().reads.push((endpoint, length));

        let mut closed = self.inner.closed.subscribe();
        let cancelled = async move {
            while !*closed.borrow_and_update() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
        };
        let mut incoming = self.inner.incoming_rx.lock().await;

        tokio::select! {
            next = incoming.recv() => match next {
                Some(Ok(mut data)) => Ok(data.split_to(data.len().min(length))),
                Some(Err(e)) => Err(e),
                None => Err(PrinterError::Closed),
            },
            _ = cancelled => Err(PrinterError::Transfer("transfer cancelled".into())),
        }
    }

    async fn transfer_out(&self, endpoint: u8, data: Bytes) -> PrinterResult<usize> {
        self.check_open()?;
        let mut state = self.state();
        if state.fail_out {
            return Err(PrinterError::Transfer("stall".into()));
        }
        let len = data.len();
        state.written.push((endpoint, data));
        Ok(len)
    }

    async fn close(&self) -> PrinterResult<()> {
        {
            let mut state = self.state();
            state.opened = false;
            state.claimed.clear();
            state.closes += 1;
        }
        self.inner.closed.send_replace(true);
        Ok(())
    }
}

#[derive(Default)]
struct MockHostInner {
    attached: Mutex<Vec<MockDevice>>,
    offered: Mutex<Vec<Filter>>,
    cancel_selection: Mutex<bool>,
    hold_selection: Mutex<bool>,
    selection_released: Notify,
    removed: Mutex<Option<broadcast::Sender<u32>>>,
}

/// A host whose picker returns the first attached device matching the filters.
#[derive(Clone, Default)]
pub struct MockHost {
    inner: Arc<MockHostInner>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, device: MockDevice) {
        lock(&self.inner.attached).push(device);
    }

    /// Pull the cable: the device disappears and its pending transfers fail.
    pub fn unplug(&self, device: &MockDevice) {
        lock(&self.inner.attached).retain(|d| d.id() != device.id());
        device.state().unplugged = true;
        device.inner.closed.send_replace(true);

        if let Some(tx) = lock(&self.inner.removed).as_ref() {
            let _ = tx.send(device.id());
        }
    }

    /// Make the picker behave as if the user dismissed it.
    pub fn cancel_selection(&self, cancel: bool) {
        *lock(&self.inner.cancel_selection) = cancel;
    }

    /// Keep `request_device` pending until called again with `false`.
    pub fn hold_selection(&self, hold: bool) {
        *lock(&self.inner.hold_selection) = hold;
        if !hold {
            self.inner.selection_released.notify_waiters();
        }
    }

    /// Filters passed to the last `request_device` call.
    pub fn offered_filters(&self) -> Vec<Filter> {
        lock(&self.inner.offered).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl UsbHost for MockHost {
    type Device = MockDevice;

    async fn request_device(&self, filters: &[Filter]) -> PrinterResult<MockDevice> {
        *lock(&self.inner.offered) = filters.to_vec();

        loop {
            let released = self.inner.selection_released.notified();
            let held = *lock(&self.inner.hold_selection);
            if !held {
                break;
            }
            released.await;
        }

        if *lock(&self.inner.cancel_selection) {
            return Err(PrinterError::NoDeviceSelected);
        }

        lock(&self.inner.attached)
            .iter()
            .find(|d| {
                let desc = d.descriptor();
                filters.iter().any(|f| f.matches(desc.vendor_id, desc.product_id))
            })
            .cloned()
            .ok_or(PrinterError::NoDeviceSelected)
    }

    async fn authorized_devices(&self) -> PrinterResult<Vec<MockDevice>> {
        Ok(lock(&self.inner.attached).clone())
    }

    fn disconnect_events(&self) -> PrinterResult<BoxStream<'static, DeviceId<Self>>> {
        let rx = lock(&self.inner.removed)
            .get_or_insert_with(|| broadcast::channel(16).0)
            .subscribe();

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(id) => return Some((id, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }
}
