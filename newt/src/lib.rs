//! `newt` is a Rust CoAP endpoint that aims to be:
//! - Small
//! - Deterministic
//! - Testable without a network
//!
//! ## CoAP
//! CoAP is an application-level network protocol that copies the semantics of HTTP
//! to an environment conducive to **constrained** devices. (weak hardware, small battery capacity, etc.)
//!
//! Like HTTP, communication is request/response with GET/POST/PUT/DELETE
//! verbs, headers (renamed to Options) and response status codes.
//! Unlike HTTP, CoAP customarily sits on top of UDP, which means the
//! protocol carries its own message layer: confirmable messages with
//! retransmission & exponential backoff, duplicate detection, and 16-bit
//! message IDs matching acknowledgements to the messages they confirm.
//!
//! ## Architecture
//! The runtime is an [`endpoint::Endpoint`] owning:
//! - an exchange [`store`] (the two indices `(peer, id)` and
//!   `(peer, token)` over in-flight exchanges, plus duplicate detection),
//! - a single [`time::Timers`] priority queue (retransmission, sweep,
//!   re-registration and block-wise lifetime entries all live there),
//! - an ordered [`layer`] list (observe, block-wise, reliability) that
//!   messages traverse top-down on send and bottom-up on receive.
//!
//! Everything is driven by polling: APIs return [`nb::Result`], and the
//! blocking [`blocking::Client`] turns that into plain `Result`s.
//!
//! The wire codec lives in [`newt_msg`].

// style
#![allow(clippy::unused_unit)]
// deny
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(not(test), deny(unsafe_code))]
// warnings
#![cfg_attr(not(test), warn(unreachable_pub))]
// features
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(any(docsrs, feature = "docs"), feature(doc_cfg))]

extern crate alloc as std_alloc;

#[cfg(test)]
pub(crate) mod test;

/// Blocking CoAP client
pub mod blocking;

/// customizable retrying of fallible operations
pub mod retry;

/// runtime errors
pub mod error;

/// responses
pub mod resp;

/// requests
pub mod req;

/// the exchange record and its typed per-layer slots
pub mod exchange;

/// the exchange store & matcher
pub mod store;

/// # The exchange pipeline
///
/// The CoAP runtime is an explicit ordered list of [`layer::Layer`]s.
/// On send, a message visits each layer from the application side down
/// towards the wire; on receive it climbs back up. Any layer may stop
/// propagation (e.g. the block-wise layer swallows a partial block and
/// emits the request for the next one instead).
///
/// Layers do not perform IO. They mutate the exchange record and push
/// [`layer::Effect`]s which the endpoint executes once the traversal is
/// done. This keeps every layer a deterministic state machine that can
/// be tested by calling it with a mock clock and asserting on the
/// effects it asked for.
pub mod layer;

/// the endpoint event loop
pub mod endpoint;

/// network abstractions
pub mod net;

/// time abstractions & the timer queue
pub mod time;

/// configuring runtime behavior
pub mod config;

/// `coap://` URI handling
pub mod uri;

/// `std`-only newt stuff
#[cfg(feature = "std")]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
pub mod std;

pub use newt_msg::ContentFormat;
