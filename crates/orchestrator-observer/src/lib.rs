//! Change-data-capture observer: polls the store for task-status transitions and
//! fans them out to registered callbacks.

pub mod config;
pub mod error;
pub mod event;
pub mod observer;

pub use config::ObserverConfig;
pub use error::ObserverError;
pub use event::StatusChangeEvent;
pub use observer::{CallbackError, CallbackHandle, DbObserver, StatusChangeCallback};
