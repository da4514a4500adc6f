//! Room code generation — the 6-character, 32-symbol unambiguous codes
//! exchanged out-of-band (read aloud, typed) so two devices can join the
//! same broadcast channel.

use rand::Rng;
use timer_types::{ROOM_CODE_ALPHABET, ROOM_CODE_LEN};

pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use timer_types::is_valid_room_code;

    #[test]
    fn generated_codes_are_valid() {
        for _ in 0..100 {
            assert!(is_valid_room_code(&generate_room_code()));
        }
    }
}
