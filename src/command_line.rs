//! POSIX-shell-ish quoting/splitting for a user-supplied command override
//! (§4.3). Unquoted whitespace splits; single quotes preserve literally; in
//! double quotes, backslash escapes `"`, `\`, `$`, backtick, and newline; a
//! bare backslash escapes the next character.

use thiserror::Error;

/// Why a command line failed to split (§4.3 scenario 4).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidCommandLineCause {
    #[error("it contains an unbalanced double quote")]
    UnbalancedDoubleQuote,
    #[error("it contains an unbalanced single quote")]
    UnbalancedSingleQuote,
    #[error(
        "it ends with a backslash (backslashes always escape the following character, for a \
         literal backslash, use '\\\\')"
    )]
    TrailingBackslash,
}

/// Raised by [`split_command_line`]. `Display` matches §4.3's required
/// message shape exactly: `` Command line `…` is invalid: <cause> ``.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Command line `{command_line}` is invalid: {cause}")]
pub struct InvalidCommandLineError {
    pub command_line: String,
    pub cause: InvalidCommandLineCause,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Unquoted,
    Single,
    Double,
}

/// Splits `command_line` into argv-style words using POSIX-shell quoting
/// rules (§4.3).
pub fn split_command_line(command_line: &str) -> Result<Vec<String>, InvalidCommandLineError> {
    let err = |cause: InvalidCommandLineCause| InvalidCommandLineError {
        command_line: command_line.to_owned(),
        cause,
    };

    let mut words = Vec::new();
    let mut current = String::new();
    let mut have_current = false;
    let mut mode = Mode::Unquoted;

    let mut chars = command_line.chars().peekable();
    while let Some(c) = chars.next() {
        match mode {
            Mode::Unquoted => match c {
                c if c.is_whitespace() => {
                    if have_current {
                        words.push(std::mem::take(&mut current));
                        have_current = false;
                    }
                }
                '\'' => {
                    mode = Mode::Single;
                    have_current = true;
                }
                '"' => {
                    mode = Mode::Double;
                    have_current = true;
                }
                '\\' => match chars.next() {
                    Some(escaped) => {
                        current.push(escaped);
                        have_current = true;
                    }
                    None => return Err(err(InvalidCommandLineCause::TrailingBackslash)),
                },
                c => {
                    current.push(c);
                    have_current = true;
                }
            },
            Mode::Single => match c {
                '\'' => mode = Mode::Unquoted,
                c => current.push(c),
            },
            Mode::Double => match c {
                '"' => mode = Mode::Unquoted,
                '\\' => match chars.peek() {
                    Some(&next) if matches!(next, '"' | '\\' | '$' | '`' | '\n') => {
                        current.push(next);
                        chars.next();
                    }
                    _ => current.push('\\'),
                },
                c => current.push(c),
            },
        }
    }

    match mode {
        Mode::Unquoted => {}
        Mode::Single => return Err(err(InvalidCommandLineCause::UnbalancedSingleQuote)),
        Mode::Double => return Err(err(InvalidCommandLineCause::UnbalancedDoubleQuote)),
    }

    if have_current {
        words.push(current);
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_unquoted_whitespace() {
        assert_eq!(
            split_command_line("echo hello world").unwrap(),
            vec!["echo", "hello", "world"]
        );
    }

    #[test]
    fn single_quotes_preserve_literally() {
        assert_eq!(
            split_command_line(r#"echo 'a\nb $HOME'"#).unwrap(),
            vec!["echo", r"a\nb $HOME"]
        );
    }

    #[test]
    fn double_quotes_allow_selective_escapes() {
        assert_eq!(
            split_command_line(r#"echo "a \"b\" \$c \\d \`e\` f""#).unwrap(),
            vec!["echo", r#"a "b" $c \d `e` f"#]
        );
    }

    #[test]
    fn bare_backslash_escapes_next_char() {
        assert_eq!(
            split_command_line(r"echo a\ b").unwrap(),
            vec!["echo", "a b"]
        );
    }

    #[test]
    fn unbalanced_double_quote_is_rejected() {
        let err = split_command_line(r#"echo "hello"#).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Command line `echo \"hello` is invalid: it contains an unbalanced double quote"
        );
    }

    #[test]
    fn unbalanced_single_quote_is_rejected() {
        let err = split_command_line("echo 'hello").unwrap_err();
        assert_eq!(err.cause, InvalidCommandLineCause::UnbalancedSingleQuote);
    }

    #[test]
    fn trailing_backslash_is_rejected() {
        let err = split_command_line(r"echo hello\").unwrap_err();
        assert_eq!(err.cause, InvalidCommandLineCause::TrailingBackslash);
        assert!(err.to_string().contains("ends with a backslash"));
    }

    /// Adjacent quoted segments of different kinds concatenate into a single
    /// word, as in `sh -c '...'` style invocations (§4.3 scenario 3).
    #[test]
    fn adjacent_differently_quoted_segments_concatenate() {
        assert_eq!(
            split_command_line(r#"a'b'"c"d"#).unwrap(),
            vec!["abcd".to_owned()]
        );
    }

    #[test]
    fn single_quote_preserves_double_quotes_literally() {
        assert_eq!(
            split_command_line(r#"echo 'say "hi"'"#).unwrap(),
            vec!["echo".to_owned(), r#"say "hi""#.to_owned()]
        );
    }
}
