//! Low-level representation of CoAP messages.
//!
//! The most notable item in `newt_msg` is `Message`;
//! a CoAP message very close to the actual byte layout.
//!
//! ## Structure
//! A [`Message`] stores its payload in a `Vec<u8>` and its options in a
//! `BTreeMap` keyed by [`OptNumber`]. Keeping options in an ordered map
//! means serialization is always in ascending option-number order, which
//! is what the delta encoding of RFC7252 requires.
//!
//! ```rust
//! use newt_msg::{Code, Id, Message, Token, Type};
//!
//! let msg = Message::new(Type::Con, Code::GET, Id(1), Token::from_bytes(&[0xAB]));
//! assert_eq!(msg.code, Code::GET);
//! ```
//!
//! ## Serialization
//! [`TryFromBytes`] and [`TryIntoBytes`] implement the binary format of
//! [RFC7252 section 3](https://datatracker.ietf.org/doc/html/rfc7252#section-3),
//! including the extended option delta/length encodings and the `0xFF`
//! payload marker.

#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(not(test), forbid(missing_debug_implementations, unreachable_pub))]
#![cfg_attr(not(test), deny(unsafe_code, missing_copy_implementations))]
#![cfg_attr(any(docsrs, feature = "docs"), feature(doc_cfg))]
#![deny(missing_docs)]

extern crate alloc as std_alloc;

pub(crate) mod cursor;

#[doc(hidden)]
pub mod from_bytes;

/// Message structs
pub mod msg;

#[doc(hidden)]
pub mod to_bytes;

#[doc(inline)]
pub use from_bytes::TryFromBytes;
#[doc(inline)]
pub use msg::*;
#[doc(inline)]
pub use to_bytes::TryIntoBytes;

#[cfg(test)]
pub(crate) fn test_msg() -> (Message, std_alloc::vec::Vec<u8>) {
  use std_alloc::vec::Vec;

  let header: [u8; 4] = 0b0100_0001_0100_0101_0000_0000_0000_0001_u32.to_be_bytes();
  let token: [u8; 1] = [254u8];
  let content_format: &[u8] = b"application/json";
  let options: [&[u8]; 2] = [&[0b_1100_1101u8, 0b00000011u8], content_format];
  let payload: [&[u8]; 2] = [&[0b1111_1111_u8], b"hello, world!"];
  let bytes: Vec<u8> = [header.as_ref(),
                        token.as_ref(),
                        options.concat().as_ref(),
                        payload.concat().as_ref()].concat();

  let mut msg = Message::new(Type::Con,
                             Code { class: 2,
                                    detail: 5 },
                             Id(1),
                             Token::from_bytes(&[254]));
  msg.set(OptNumber(12), OptValue(content_format.to_vec()));
  msg.payload = Payload(b"hello, world!".to_vec());

  (msg, bytes)
}
