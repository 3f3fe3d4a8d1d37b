/// the blocking client
pub mod client;

#[doc(inline)]
pub use client::Client;
