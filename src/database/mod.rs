//! Database Module - lokale Persistenz
//!
//! Aktuell nur die Anrufhistorie (`calls.db`).

mod call_log;

pub use call_log::{CallLog, CallOutcome, CallRecord, DatabaseError};
