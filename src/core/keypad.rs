//! Phone Keypad Tables
//!
//! Letters map onto the standard 2-9 telephone keypad. Each played letter
//! charges its digit; full columns unlock combos.
//!
//! ```text
//!   1     2abc   3def
//!   4ghi  5jkl   6mno
//!   7pqrs 8tuv   9wxyz
//!   *     0      #
//! ```

use serde::{Serialize, Deserialize};

/// The 26 playable letters.
pub const ALPHABET: [char; 26] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm',
    'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Letters that carry vowel power.
pub const VOWELS: [char; 6] = ['a', 'e', 'i', 'o', 'u', 'y'];

/// Keypad digits that hold letters.
pub const PAD_DIGITS: [u8; 8] = [2, 3, 4, 5, 6, 7, 8, 9];

/// Check whether a character is a playable letter.
#[inline]
pub fn is_letter(c: char) -> bool {
    c.is_ascii_lowercase()
}

/// Check whether a letter is a vowel.
#[inline]
pub fn is_vowel(c: char) -> bool {
    VOWELS.contains(&c)
}

/// Keypad digit for a letter.
pub fn pad_digit(letter: char) -> Option<u8> {
    let digit = match letter {
        'a'..='c' => 2,
        'd'..='f' => 3,
        'g'..='i' => 4,
        'j'..='l' => 5,
        'm'..='o' => 6,
        'p'..='s' => 7,
        't'..='v' => 8,
        'w'..='z' => 9,
        _ => return None,
    };
    Some(digit)
}

/// All letters printed on a digit.
pub fn letters_on(digit: u8) -> impl Iterator<Item = char> {
    ALPHABET.into_iter().filter(move |&c| pad_digit(c) == Some(digit))
}

/// Combo unlocked by charging one keypad column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComboKey {
    /// `*` column (7, 4): clears every cursed letter.
    Purge,
    /// `0` column (2, 5, 8): refills the activator's vowel power.
    Recharge,
    /// `#` column (3, 6, 9): handicaps the next holder.
    Attaque,
}

impl ComboKey {
    /// All combos, in keypad order.
    pub const ALL: [ComboKey; 3] = [ComboKey::Purge, ComboKey::Recharge, ComboKey::Attaque];

    /// Digits that must be charged to fire this combo.
    pub fn column(self) -> &'static [u8] {
        match self {
            ComboKey::Purge => &[7, 4],
            ComboKey::Recharge => &[2, 5, 8],
            ComboKey::Attaque => &[3, 6, 9],
        }
    }

    /// Keypad symbol under the column.
    pub fn symbol(self) -> char {
        match self {
            ComboKey::Purge => '*',
            ComboKey::Recharge => '0',
            ComboKey::Attaque => '#',
        }
    }

    /// Parse a combo key from its keypad symbol or its name.
    pub fn parse(raw: &str) -> Option<ComboKey> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "*" | "purge" => Some(ComboKey::Purge),
            "0" | "recharge" => Some(ComboKey::Recharge),
            "#" | "attaque" | "attack" => Some(ComboKey::Attaque),
            _ => None,
        }
    }
}
