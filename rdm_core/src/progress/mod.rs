pub mod notifier;
pub mod observer;
pub mod snapshot;

pub use notifier::{ProgressEvent, ProgressNotifier};
pub use observer::ProgressObserver;
pub use snapshot::{format_bytes, ProgressSnapshot};
