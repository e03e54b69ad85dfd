//! Background tasks

pub mod autoscan;

pub use autoscan::{AutoscanManager, AutoscanProcess, MailboxScanner};
