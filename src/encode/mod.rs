pub mod base58;
pub mod buffer;

pub use self::base58::{base58_decode, base58_encode, base58check_decode, base58check_encode};
pub use self::buffer::{ByteReader, ByteWriter};
