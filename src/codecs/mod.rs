//! Cache Codec Implementations
//!
//! Built-in implementations of [`CacheCodec`](crate::traits::CacheCodec).
//! JSON is the default; MessagePack trades readability for smaller slot
//! payloads.

mod json;
pub use json::JsonCodec;

#[cfg(feature = "msgpack")]
mod msgpack;
#[cfg(feature = "msgpack")]
#[cfg_attr(docsrs, doc(cfg(feature = "msgpack")))]
pub use msgpack::MsgPackCodec;
