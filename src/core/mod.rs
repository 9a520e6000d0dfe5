//! Core helpers.
//!
//! Seeded randomness and the keypad tables shared by the game rules.

pub mod keypad;
pub mod rng;

// Re-export core types
pub use keypad::{ComboKey, ALPHABET, VOWELS, PAD_DIGITS, is_letter, is_vowel, pad_digit};
pub use rng::DeterministicRng;
