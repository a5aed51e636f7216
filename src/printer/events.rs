use std::fmt;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde::Serialize;

use crate::error::PrinterError;
use crate::printer::profiles::{CodepageMapping, CommandLanguage};

/// Payload of the `connected` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedInfo {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub manufacturer_name: Option<String>,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
    pub vendor_id: u16,
    pub product_id: u16,
    pub language: CommandLanguage,
    pub codepage_mapping: CodepageMapping,
}

/// Why a read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenStopped {
    /// The session let go of the device the loop was reading from.
    Released,
    Failed(PrinterError),
}

impl fmt::Display for ListenStopped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Released => f.write_str("device released"),
            Self::Failed(e) => write!(f, "{e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrinterEvent {
    Connected(ConnectedInfo),
    Disconnected,
    Data(Bytes),
    ListenStopped(ListenStopped),
}

impl PrinterEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected(_) => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::Data(_) => EventKind::Data,
            Self::ListenStopped(_) => EventKind::ListenStopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Data,
    ListenStopped,
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// One subscriber list per notification kind, called in registration order.
#[derive(Default)]
pub struct EventListeners {
    connected: RwLock<Vec<Handler<ConnectedInfo>>>,
    disconnected: RwLock<Vec<Handler<()>>>,
    data: RwLock<Vec<Handler<Bytes>>>,
    listen_stopped: RwLock<Vec<Handler<ListenStopped>>>,
}

impl EventListeners {
    pub fn on_connected(&self, f: impl Fn(&ConnectedInfo) + Send + Sync + 'static) {
        push(&self.connected, Arc::new(f));
    }

    pub fn on_disconnected(&self, f: impl Fn() + Send + Sync + 'static) {
        push(&self.disconnected, Arc::new(move |_: &()| f()));
    }

    pub fn on_data(&self, f: impl Fn(&Bytes) + Send + Sync + 'static) {
        push(&self.data, Arc::new(f));
    }

    pub fn on_listen_stopped(&self, f: impl Fn(&ListenStopped) + Send + Sync + 'static) {
        push(&self.listen_stopped, Arc::new(f));
    }

    /// Register a handler that receives the whole event for one kind.
    pub fn add(&self, kind: EventKind, f: impl Fn(&PrinterEvent) + Send + Sync + 'static) {
        match kind {
            EventKind::Connected => {
                self.on_connected(move |info| f(&PrinterEvent::Connected(info.clone())))
            }
            EventKind::Disconnected => self.on_disconnected(move || f(&PrinterEvent::Disconnected)),
            EventKind::Data => self.on_data(move |data| f(&PrinterEvent::Data(data.clone()))),
            EventKind::ListenStopped => {
                self.on_listen_stopped(move |reason| f(&PrinterEvent::ListenStopped(reason.clone())))
            }
        }
    }

    pub fn emit(&self, event: &PrinterEvent) {
        tracing::debug!(kind = ?event.kind(), "Emitting printer event");
        match event {
            PrinterEvent::Connected(info) => call(&self.connected, info),
            PrinterEvent::Disconnected => call(&self.disconnected, &()),
            PrinterEvent::Data(data) if data.is_empty() => {}
            PrinterEvent::Data(data) => call(&self.data, data),
            PrinterEvent::ListenStopped(reason) => call(&self.listen_stopped, reason),
        }
    }
}

fn push<T>(list: &RwLock<Vec<Handler<T>>>, handler: Handler<T>) {
    list.write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(handler);
}

/// Handlers are cloned out first so one may register another without deadlocking.
fn call<T>(list: &RwLock<Vec<Handler<T>>>, value: &T) {
    let handlers: Vec<Handler<T>> = list
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    for handler in handlers {
        handler(value);
    }
}
