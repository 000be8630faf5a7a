pub mod signal;

pub use signal::{ClientIdentity, Signal, SignalAction};
