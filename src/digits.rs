/// Fold Arabic-Indic (U+0660–U+0669) and Eastern Arabic-Indic
/// (U+06F0–U+06F9) digit glyphs into ASCII digits.
///
/// Free text coming back from assistants or pasted by users routinely mixes
/// digit scripts; amounts must round-trip through parsing as `0-9`. Pure and
/// stateless, deliberately not a store concern.
pub fn to_latin_digits(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\u{0660}'..='\u{0669}' => char::from(b'0' + (c as u32 - 0x0660) as u8),
            '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (c as u32 - 0x06F0) as u8),
            other => other,
        })
        .collect()
}
