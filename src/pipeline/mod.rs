//! Pipeline module: word tracking and ordered delivery to the transport

mod sender;
mod words;

pub use sender::WordSender;
pub use words::WordTracker;
