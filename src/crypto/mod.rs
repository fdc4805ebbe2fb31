pub mod aes;
pub mod hash;
pub mod kdf;
pub mod prng;
pub mod secp;
pub mod secure;

pub use self::hash::{compute_data_id, hash160, hash256, hmac256, hmac512, sha256};
pub use self::kdf::KdfRomix;
pub use self::prng::{os_random, FortunaPrng};
pub use self::secure::{SecretVec, SecureBytes};
