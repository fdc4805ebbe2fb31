//! Secret byte buffers that scrub their storage on drop.

use std::fmt;

use zeroize::{Zeroize, Zeroizing};

/// Owned secret bytes. The backing storage is overwritten when the value is
/// dropped. There is deliberately no `Clone` impl; copies must go through
/// [`SecureBytes::to_owned_secret`] so they are visible in the code.
#[derive(Default)]
pub struct SecureBytes(Vec<u8>);

impl SecureBytes {
    pub fn new(data: Vec<u8>) -> Self {
        SecureBytes(data)
    }

    pub fn from_slice(data: &[u8]) -> Self {
        SecureBytes(data.to_vec())
    }

    pub fn zeroed(len: usize) -> Self {
        SecureBytes(vec![0u8; len])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Explicit secret copy.
    pub fn to_owned_secret(&self) -> SecureBytes {
        SecureBytes(self.0.clone())
    }

    /// Wipe now, before the drop point.
    pub fn wipe(&mut self) {
        self.0.zeroize();
        self.0.clear();
    }
}

impl Drop for SecureBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl AsRef<[u8]> for SecureBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for SecureBytes {
    fn from(data: Vec<u8>) -> Self {
        SecureBytes(data)
    }
}

impl PartialEq for SecureBytes {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SecureBytes {}

// Never print the contents, even in debug output.
impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBytes({} bytes)", self.0.len())
    }
}

/// Alias for transient secret vectors in function-local scopes.
pub type SecretVec = Zeroizing<Vec<u8>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_leaks_contents() {
        let secret = SecureBytes::from_slice(b"super secret seed");
        let printed = format!("{:?}", secret);
        assert!(!printed.contains("super"));
        assert!(printed.contains("17 bytes"));
    }

    #[test]
    fn wipe_clears_buffer() {
        let mut secret = SecureBytes::from_slice(&[0xAA; 32]);
        secret.wipe();
        assert!(secret.is_empty());
    }

    #[test]
    fn explicit_copy_matches() {
        let secret = SecureBytes::from_slice(b"abc");
        assert_eq!(secret.to_owned_secret(), secret);
    }
}
