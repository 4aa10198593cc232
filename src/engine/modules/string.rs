//! `string` module constants

use crate::value::{Module, Value};

pub const ASCII_LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";
pub const ASCII_UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
pub const DIGITS: &str = "0123456789";
pub const PUNCTUATION: &str = r##"!"#$%&'()*+,-./:;<=>?@[\]^_`{|}~"##;

pub fn module() -> Module {
    let letters = format!("{}{}", ASCII_LOWERCASE, ASCII_UPPERCASE);
    let printable = format!("{}{}{} \t\n\r\x0b\x0c", DIGITS, letters, PUNCTUATION);
    Module::new("string")
        .with("ascii_lowercase", Value::str(ASCII_LOWERCASE))
        .with("ascii_uppercase", Value::str(ASCII_UPPERCASE))
        .with("ascii_letters", Value::str(letters))
        .with("digits", Value::str(DIGITS))
        .with("hexdigits", Value::str("0123456789abcdefABCDEF"))
        .with("octdigits", Value::str("01234567"))
        .with("punctuation", Value::str(PUNCTUATION))
        .with("whitespace", Value::str(" \t\n\r\x0b\x0c"))
        .with("printable", Value::str(printable))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printable_length_matches_python() {
        let module = module();
        assert_eq!(module.get("printable").unwrap().len().unwrap(), 100);
        assert_eq!(module.get("punctuation").unwrap().len().unwrap(), 32);
    }
}
