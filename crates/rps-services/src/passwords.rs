//! Random AMT passwords
//!
//! AMT accepts 8 to 32 characters with at least one upper case letter,
//! one lower case letter, one digit and one non-alphanumeric character.
//! Quotes, commas and colons are refused.

use rand::seq::SliceRandom;
use rand::Rng;

pub const GENERATED_PASSWORD_LEN: usize = 16;

const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
const DIGITS: &[u8] = b"23456789";
const SYMBOLS: &[u8] = b"!@#$%^&*()-_=+";

/// Generate a password meeting AMT's complexity rules
pub fn generate_password(len: usize) -> String {
    let len = len.clamp(8, 32);
    let mut rng = rand::thread_rng();
    let classes = [UPPER, LOWER, DIGITS, SYMBOLS];
    let all: Vec<u8> = classes.concat();

    let mut chars: Vec<u8> = classes
        .iter()
        .filter_map(|class| class.choose(&mut rng).copied())
        .collect();
    while chars.len() < len {
        chars.push(all[rng.gen_range(0..all.len())]);
    }
    chars.shuffle(&mut rng);

    chars.into_iter().map(char::from).collect()
}

/// Whether AMT would accept the password
pub fn is_strong_password(password: &str) -> bool {
    let len = password.chars().count();
    (8..=32).contains(&len)
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(|c| !c.is_ascii_alphanumeric())
        && !password.contains(['"', ',', ':'])
}
