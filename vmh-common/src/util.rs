//! Small helpers shared by steps and backends.

/// Random lowercase ASCII letters, e.g. for throwaway volume names.
pub fn random_alpha_string(len: usize) -> String {
    (0..len)
        .map(|_| char::from(b'a' + rand::random_range(0..26u8)))
        .collect()
}

/// Length of the value starting at `s`: up to the first unquoted whitespace.
fn value_len(s: &str) -> usize {
    let mut quote = None;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            _ if escaped => escaped = false,
            (_, '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (None, '"' | '\'') => quote = Some(c),
            (None, c) if c.is_whitespace() => return i,
            _ => {}
        }
    }
    s.len()
}

const SECRET_MARKERS: &[&str] = &[
    "PASSWORD=",
    "PASSPHRASE=",
    "SECRET=",
    "TOKEN=",
    "--password ",
    "--password=",
    "--passphrase ",
    "--passphrase=",
    "--token ",
    "--token=",
];

/// Hide passwords and tokens in a guest command before it is logged.
///
/// Any `...PASSWORD=value` style assignment or `--password value` style flag
/// keeps its key and loses its value. Markers are matched case-sensitively.
pub fn mask_secrets(command: &str) -> String {
    let mut out = command.to_string();
    for marker in SECRET_MARKERS {
        let mut from = 0;
        while let Some(found) = out[from..].find(marker) {
            let value_start = from + found + marker.len();
            let value_end = value_start + value_len(&out[value_start..]);
            if value_end == value_start {
                from = value_start;
                continue;
            }
            out.replace_range(value_start..value_end, "***");
            from = value_start + 3;
        }
    }
    out
}
