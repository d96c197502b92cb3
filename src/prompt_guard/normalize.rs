//! Marker-canonical text form
//!
//! Pipeline: canonical decomposition (NFD), strip combining marks, fold a
//! fixed table of confusables to ASCII, strip zero-width characters, then
//! canonical composition (NFC).
//!
//! The confusable table covers known Cyrillic and Greek look-alikes plus
//! fullwidth ASCII and angle-bracket variants. It is not a general
//! confusable-skeleton algorithm. The output is only ever compared against
//! markers; it is never shown to anyone.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Canonicalize `text` for marker comparison.
pub fn normalize(text: &str) -> String {
    let folded: String = text
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(fold_confusable)
        .filter(|c| !is_zero_width(*c))
        .collect();
    folded.nfc().collect()
}

/// Fold a single character, appending its canonical form to `out`.
///
/// A character may fold to nothing (zero-width, combining mark) or to more
/// than one character (decomposed compatibility forms are kept as-is).
pub(crate) fn fold_char_into(c: char, out: &mut Vec<char>) {
    for d in std::iter::once(c).nfd() {
        if is_combining_mark(d) {
            continue;
        }
        let folded = fold_confusable(d);
        if !is_zero_width(folded) {
            out.push(folded);
        }
    }
}

/// Invisible characters that can split or hide a marker token.
pub fn is_zero_width(c: char) -> bool {
    matches!(
        c,
        '\u{200B}' // zero width space
            | '\u{200C}' // zero width non-joiner
            | '\u{200D}' // zero width joiner
            | '\u{2060}' // word joiner
            | '\u{FEFF}' // byte order mark
            | '\u{00AD}' // soft hyphen
    )
}

/// Map a known confusable to its ASCII look-alike.
pub fn fold_confusable(c: char) -> char {
    match c {
        // Fullwidth ASCII
        '\u{FF21}'..='\u{FF3A}' => offset_char(b'A', c, 0xFF21),
        '\u{FF41}'..='\u{FF5A}' => offset_char(b'a', c, 0xFF41),
        '\u{FF10}'..='\u{FF19}' => offset_char(b'0', c, 0xFF10),
        '\u{FF3F}' => '_',

        // Angle bracket variants
        '\u{FF1C}' | '\u{3008}' | '\u{27E8}' | '\u{2039}' | '\u{FE64}' | '\u{2329}' => '<',
        '\u{FF1E}' | '\u{3009}' | '\u{27E9}' | '\u{203A}' | '\u{FE65}' | '\u{232A}' => '>',

        // Cyrillic uppercase
        'А' => 'A',
        'В' => 'B',
        'Е' => 'E',
        'К' => 'K',
        'М' => 'M',
        'Н' => 'H',
        'О' => 'O',
        'Р' => 'P',
        'С' => 'C',
        'Т' => 'T',
        'У' => 'Y',
        'Х' => 'X',
        'Ѕ' => 'S',
        'І' => 'I',
        'Ј' => 'J',
        'Ԛ' => 'Q',
        'Ԝ' => 'W',

        // Cyrillic lowercase
        'а' => 'a',
        'с' => 'c',
        'ԁ' => 'd',
        'е' => 'e',
        'һ' => 'h',
        'і' => 'i',
        'ј' => 'j',
        'о' => 'o',
        'р' => 'p',
        'ԛ' => 'q',
        'ѕ' => 's',
        'у' => 'y',
        'х' => 'x',
        'ԝ' => 'w',

        // Greek uppercase
        'Α' => 'A',
        'Β' => 'B',
        'Ε' => 'E',
        'Ζ' => 'Z',
        'Η' => 'H',
        'Ι' => 'I',
        'Κ' => 'K',
        'Μ' => 'M',
        'Ν' => 'N',
        'Ο' => 'O',
        'Ρ' => 'P',
        'Τ' => 'T',
        'Υ' => 'Y',
        'Χ' => 'X',

        // Greek lowercase
        'ο' => 'o',
        'ι' => 'i',
        'κ' => 'k',
        'ν' => 'v',
        'ρ' => 'p',
        'υ' => 'u',

        _ => c,
    }
}

fn offset_char(base: u8, c: char, start: u32) -> char {
    // Callers only pass ranges of at most 26 code points.
    let offset = u8::try_from(u32::from(c) - start).unwrap_or(0);
    char::from(base + offset)
}
