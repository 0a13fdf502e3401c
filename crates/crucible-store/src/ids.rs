//! Identifier generation.
//!
//! All primary keys are 12-character base-36 strings drawn from a
//! cryptographic RNG. A collision surfaces as a primary-key constraint
//! error; it is never retried silently.

const ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Generate a new 12-character base-36 identifier.
pub fn new_id() -> String {
    nanoid::nanoid!(12, &ALPHABET)
}
