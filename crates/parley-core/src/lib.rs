pub mod bus;
pub mod id;
pub mod kind;

pub use bus::{Bus, BusEvent, BusEventDef};
pub use kind::ErrorKind;
