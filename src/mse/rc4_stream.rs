//! RC4-drop1024 keystream, as MSE/PE's chosen stream cipher (spec.md §4.4
//! step 3: "first 1024 bytes of each keystream are discarded").

use rc4::{KeyInit, Rc4, StreamCipher};

pub struct Rc4Drop1024 {
    cipher: Rc4<rc4::consts::U20>,
}

impl Rc4Drop1024 {
    #[must_use]
    pub fn new(key: &[u8; 20]) -> Self {
        let mut cipher = Rc4::new_from_slice(key).expect("a 20-byte SHA-1 digest is always a valid RC4 key");
        let mut discard = [0u8; 1024];
        cipher.apply_keystream(&mut discard);
        Self { cipher }
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }
}

#[cfg(test)]
mod tests {
    use super::Rc4Drop1024;

    #[test]
    fn should_decrypt_what_it_encrypted() {
        let mut encryptor = Rc4Drop1024::new(&[1u8; 20]);
        let mut decryptor = Rc4Drop1024::new(&[1u8; 20]);

        let mut data = b"hello peer".to_vec();
        let plaintext = data.clone();
        encryptor.apply(&mut data);
        assert_ne!(data, plaintext);
        decryptor.apply(&mut data);
        assert_eq!(data, plaintext);
    }

    #[test]
    fn should_continue_the_keystream_across_multiple_calls() {
        let mut one_shot = Rc4Drop1024::new(&[2u8; 20]);
        let mut chunked = Rc4Drop1024::new(&[2u8; 20]);

        let mut one_shot_buf = b"abcdefgh".to_vec();
        one_shot.apply(&mut one_shot_buf);

        let mut first_half = b"abcd".to_vec();
        let mut second_half = b"efgh".to_vec();
        chunked.apply(&mut first_half);
        chunked.apply(&mut second_half);

        let mut combined = first_half;
        combined.extend_from_slice(&second_half);
        assert_eq!(one_shot_buf, combined);
    }
}
