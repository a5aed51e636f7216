pub mod discovery;
pub mod events;
pub mod host;
pub mod mock;
pub mod native;
pub mod profiles;
pub mod session;
pub mod star;

pub use events::{ConnectedInfo, EventKind, ListenStopped, PrinterEvent};
pub use host::{DeviceDescriptor, UsbDevice, UsbHost};
pub use native::NusbHost;
pub use profiles::{CodepageMapping, CommandLanguage, DeviceProfile, DEVICE_PROFILES};
pub use session::{PrinterSession, SessionOptions, SessionState};
