//! Splits configuration text into statements and block delimiters.

/// A unit of configuration text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Item {
    /// A keyword and its arguments, from a single line.
    Statement { line: usize, words: Vec<String> },
    Open { line: usize },
    Close { line: usize },
}

impl Item {
    pub(crate) fn line(&self) -> usize {
        match self {
            Item::Statement { line, .. } | Item::Open { line } | Item::Close { line } => *line,
        }
    }
}

/// Tokenizes configuration text.
///
/// Words are separated by whitespace. Braces are always tokens of their
/// own, even when attached to a word. A word starting with `#` or `!`
/// comments out the rest of the line. Line numbers start at 1.
pub(crate) fn tokenize(text: &str) -> Vec<Item> {
    let mut items = vec![];
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let mut words = vec![];
        for word in raw.split_whitespace() {
            if word.starts_with('#') || word.starts_with('!') {
                break;
            }
            let mut rest = word;
            while !rest.is_empty() {
                match rest.find(['{', '}']) {
                    Some(0) => {
                        flush(&mut items, &mut words, line);
                        items.push(if rest.starts_with('{') {
                            Item::Open { line }
                        } else {
                            Item::Close { line }
                        });
                        rest = &rest[1..];
                    }
                    Some(at) => {
                        words.push(rest[..at].to_string());
                        rest = &rest[at..];
                    }
                    None => {
                        words.push(rest.to_string());
                        rest = "";
                    }
                }
            }
        }
        flush(&mut items, &mut words, line);
    }
    items
}

fn flush(items: &mut Vec<Item>, words: &mut Vec<String>, line: usize) {
    if !words.is_empty() {
        items.push(Item::Statement {
            line,
            words: std::mem::take(words),
        });
    }
}
