pub mod port;
pub mod serial_link;

pub use port::{NativeOpener, PortOpener, SerialIo};
pub use serial_link::{LinkEvent, LinkState, LinkStatus, SerialLink};
