//! # Audio Uplink Buffering
//!
//! Decouples the chunking of inbound network frames from the chunking the
//! conversation service wants on its uplink.
//!
//! ## Key Components:
//! - **Audio Format**: sample rate / channels / bit depth, and the byte sizes
//!   derived from them
//! - **Ring Buffer**: fixed-capacity circular byte buffer with a lost-oldest
//!   overflow policy
//! - **Audio Source**: ring buffer fed by a background socket receive loop and
//!   drained through a blocking, exact-size `read`

pub mod buffer; // Audio format and circular byte buffer
pub mod source; // Socket-fed, blocking audio source

pub use buffer::AudioFormat;
pub use source::{AudioSource, SourceOptions};
