//! Password-based key expansion for the CFB ciphers.

use md5::{Digest, Md5};

/// OpenSSL `EVP_BytesToKey` with MD5, a single iteration and no salt.
///
/// Each round hashes the previous digest followed by the password; digests
/// are concatenated until `key_len` bytes are available.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_block_is_md5_of_password() {
        let key = evp_bytes_to_key(b"foobar", 16);
        let digest = Md5::digest(b"foobar");
        assert_eq!(key, digest.to_vec());
    }

    #[test]
    fn test_second_block_chains_previous_digest() {
        let key = evp_bytes_to_key(b"foobar", 32);
        let first = Md5::digest(b"foobar");

        let mut hasher = Md5::new();
        hasher.update(first);
        hasher.update(b"foobar");
        let second = hasher.finalize();

        assert_eq!(&key[..16], first.as_slice());
        assert_eq!(&key[16..], second.as_slice());
    }

    #[test]
    fn test_truncates_to_requested_length() {
        assert_eq!(evp_bytes_to_key(b"secret", 24).len(), 24);
        assert_eq!(
            &evp_bytes_to_key(b"secret", 24)[..16],
            &evp_bytes_to_key(b"secret", 32)[..16]
        );
    }
}
