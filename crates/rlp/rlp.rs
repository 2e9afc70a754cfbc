//! Canonical, length-prefixed encoding (functionally equivalent to Ethereum's RLP) used by
//! `state-trie`'s hasher to compute node hashes. This is *not* the on-disk record format:
//! node storage is fixed-width and packed directly by the `stock` module.

mod constants;
mod encode;

pub use constants::{RLP_EMPTY_LIST, RLP_NULL};
pub use encode::{BigEndianInt, EMPTY_STRING, RLPEncode, bytes_length, encode_list, list_length};
