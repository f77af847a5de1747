//! Minimal POSIX-shell word splitting for the mock guest.

/// Split `line` into words, honoring single quotes, double quotes and
/// backslash escapes. Unterminated quotes run to the end of the line.
pub fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            if let Some(next) = chars.next() {
                                current.push(next);
                            }
                        }
                        other => current.push(other),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::quote;

    #[test]
    fn test_split_plain_and_quoted() {
        assert_eq!(split_words("test -e /etc/motd"), ["test", "-e", "/etc/motd"]);
        assert_eq!(split_words(r#"cp "a b" 'c d'"#), ["cp", "a b", "c d"]);
        assert_eq!(split_words("printf '%s' '' > /x"), ["printf", "%s", "", ">", "/x"]);
    }

    #[test]
    fn test_split_inverts_quote() {
        for raw in ["it's", "a b\tc", "$HOME", "semi;colon", "back\\slash", ""] {
            let line = format!("echo {}", quote(raw));
            assert_eq!(split_words(&line), vec!["echo".to_string(), raw.to_string()]);
        }
    }
}
