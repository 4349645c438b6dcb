//! `nanobot-sessions` — per-session JSONL logs.
//!
//! # File format
//!
//! One file per session under the sessions directory, named from a sanitized
//! form of the session key. Line 1 is the metadata header:
//!
//! ```text
//! {"_type":"metadata","key":"telegram:42#main","created_at":"…","updated_at":"…","metadata":{}}
//! ```
//!
//! Every following line is one message in chronological order. Readers
//! tolerate a missing header and blank lines; writers always emit the header
//! first.

pub mod error;
pub mod router;
pub mod store;
pub mod types;

pub use error::{Result, SessionError};
pub use router::SessionRouter;
pub use store::SessionStore;
pub use types::Session;
