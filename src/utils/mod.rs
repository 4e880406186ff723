pub mod sos;

pub use sos::SignalOfStop;
