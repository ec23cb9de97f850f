//! Command-line tokenizer for text commands
//!
//! Connectionless requests, reliable commands and operator commands all use the
//! same grammar: whitespace separated words, with double quotes grouping a word
//! that contains spaces. Quotes never nest and are not escaped.

/// Splits a command line into arguments
pub fn tokenize(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let Some(&first) = chars.peek() else {
            break;
        };

        let mut word = String::new();
        if first == '"' {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                word.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                word.push(c);
                chars.next();
            }
        }
        args.push(word);
    }

    args
}

/// Returns the raw text following the first `skip` words, untouched
///
/// Used for `rcon <password> <command...>` so the forwarded command keeps its
/// own quoting.
pub fn args_from(line: &str, skip: usize) -> &str {
    let mut rest = line.trim_start();
    for _ in 0..skip {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        rest = rest[end..].trim_start();
    }
    rest
}

/// Wraps a value in quotes for a reliable command, stripping embedded quotes
pub fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_plain_words() {
        assert_eq!(tokenize("  getinfo  xyz "), vec!["getinfo", "xyz"]);
    }

    #[test]
    fn test_tokenize_quoted_argument() {
        let args = tokenize("connect \"\\name\\A B\\rate\\25000\"");
        assert_eq!(args, vec!["connect", "\\name\\A B\\rate\\25000"]);
    }

    #[test]
    fn test_tokenize_unterminated_quote() {
        assert_eq!(tokenize("say \"hello"), vec!["say", "hello"]);
    }

    #[test]
    fn test_tokenize_empty() {
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_args_from_keeps_spacing() {
        assert_eq!(args_from("rcon  secret kick  \"a b\"", 2), "kick  \"a b\"");
        assert_eq!(args_from("rcon", 2), "");
    }

    #[test]
    fn test_quote_strips_inner_quotes() {
        assert_eq!(quote("say \"hi\""), "\"say 'hi'\"");
    }
}
