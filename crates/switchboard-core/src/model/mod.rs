// Domain model: devices, connection views, and the event vocabulary.

mod device;
mod event;

pub use device::{ConnectionInfo, Device, Generation, Transport};
pub use event::{Event, EventFilter, EventKind, StatusSource};
