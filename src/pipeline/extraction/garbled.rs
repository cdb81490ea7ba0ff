//! Heuristic for mis-decoded parser output.

const CJK_MIN_RATIO: f64 = 0.2;
const SYMBOL_MAX_RATIO: f64 = 0.3;
const NON_ASCII_MAX_RATIO: f64 = 0.3;

fn is_cjk(c: char) -> bool {
    ('\u{4E00}'..='\u{9FFF}').contains(&c)
}

/// Control characters, ASCII space, ideographic space and the replacement character.
fn is_symbol_noise(c: char) -> bool {
    c <= '\u{20}' || c == '\u{3000}' || c == '\u{FFFD}'
}

/// Whether `text` looks like the product of a wrong decoding.
///
/// With CJK present: garbled if CJK chars are under 20% of the sample or
/// noise chars exceed 30%. Without CJK: garbled if non-ASCII exceeds 30%.
pub fn is_garbled(text: &str) -> bool {
    let total = text.chars().count();
    if total == 0 {
        return false;
    }
    let total = total as f64;

    let cjk = text.chars().filter(|c| is_cjk(*c)).count() as f64;
    if cjk > 0.0 {
        let noise = text.chars().filter(|c| is_symbol_noise(*c)).count() as f64;
        return cjk / total < CJK_MIN_RATIO || noise / total > SYMBOL_MAX_RATIO;
    }

    let non_ascii = text.chars().filter(|c| !c.is_ascii()).count() as f64;
    non_ascii / total > NON_ASCII_MAX_RATIO
}
