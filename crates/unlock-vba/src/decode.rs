/// UTF-8 punctuation that was decoded as Windows-1252, paired with the intended character.
const MOJIBAKE: &[(&str, &str)] = &[
    ("\u{e2}\u{20ac}\u{153}", "\u{201c}"),
    ("\u{e2}\u{20ac}\u{9d}", "\u{201d}"),
    ("\u{e2}\u{20ac}\u{2dc}", "\u{2018}"),
    ("\u{e2}\u{20ac}\u{2122}", "\u{2019}"),
    ("\u{e2}\u{20ac}\u{201c}", "\u{2013}"),
    ("\u{e2}\u{20ac}\u{201d}", "\u{2014}"),
    ("\u{e2}\u{20ac}\u{a6}", "\u{2026}"),
    ("\u{c2}\u{a0}", "\u{a0}"),
];

/// Normalize recovered module source for display and export.
///
/// Repairs known mojibake, converts CRLF/CR to LF, drops trailing NULs and strips control
/// characters other than tab and newline. Lossy and infallible.
pub fn clean_code(raw: &str) -> String {
    let mut text = raw.trim_end_matches('\0').to_owned();
    for (broken, fixed) in MOJIBAKE {
        if text.contains(broken) {
            text = text.replace(broken, fixed);
        }
    }
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    text.chars()
        .filter(|&c| c == '\t' || c == '\n' || !c.is_control())
        .collect()
}
