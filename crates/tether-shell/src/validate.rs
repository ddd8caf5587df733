//! Command validation before anything reaches a shell.
//!
//! This is a structural check, not a sandbox. It refuses input that would
//! break the supervisor's bookkeeping:
//!
//!   1. nothing to run (blank line, comment only);
//!   2. a bare `&` that would push work into the background, where its output
//!      and exit status can no longer be tied to a checkpoint;
//!   3. an unterminated quote, which would leave the shell waiting for more
//!      input and swallow the checkpoint fragments.
//!
//! The tokenizer understands single quotes, double quotes, backslash escapes
//! and `#` comments. Unquoted `( ) ; < > | &` become operator tokens, with
//! two-character operators such as `&&`, `>&`, `&>` and `|&` kept distinct
//! from `&`.

use thiserror::Error;
use tracing::info;

/// Characters that form operator tokens when unquoted.
const PUNCTUATION: &[char] = &['(', ')', ';', '<', '>', '|', '&'];

/// Two-character operators. Any other punctuation stands alone, so `&)` in
/// `(cmd &)` is a background `&` followed by `)`.
const OPERATORS: &[&str] = &["&&", "||", ";;", ">&", "&>", "|&", ">>", "<<", "<&", ">|"];

/// Words after which the next word is in command position.
const COMMAND_PREFIXES: &[&str] = &[
    "then", "do", "else", "elif", "{", "!", "time", "if", "while", "until",
];

/// Why a command line was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("no command passed")]
    Empty,

    #[error("trying to hang up: background execution with `&`")]
    Background,

    #[error("unterminated quote")]
    Unbalanced,
}

/// Validate one command line.
///
/// Returns the line unchanged when it may be sent to a shell.
pub fn validate(line: &str) -> Result<&str, Rejection> {
    let tokens = tokenize(line).inspect_err(|reason| {
        info!(%reason, "command check failed");
    })?;

    let rejection = if tokens.is_empty() {
        Some(Rejection::Empty)
    } else if tokens.iter().any(|t| t.operator && t.text == "&") {
        Some(Rejection::Background)
    } else {
        None
    };

    match rejection {
        Some(reason) => {
            info!(%reason, "command check failed");
            Err(reason)
        }
        None => Ok(line),
    }
}

/// `true` when the command is the bare `exit` builtin that ends a session.
pub fn is_exit(command: &str) -> bool {
    command.trim() == "exit"
}

/// Rewrite every unquoted `exit` in command position to `Exit`.
///
/// A session must only end through [`crate::session::Session::exit`], which
/// collects the final output. An `exit` buried in a compound command
/// (`make || exit 1`) would otherwise kill the shell mid-checkpoint; after
/// the rewrite the shell reports `Exit: command not found` instead.
/// Arguments (`echo exit`), quoted text and longer words (`./exit_all`) are
/// left alone. `exit` reached through `eval`, functions or a nested shell is
/// not detected.
pub fn neutralize_exit(command: &str) -> String {
    let Ok(tokens) = tokenize(command) else {
        return command.to_string();
    };

    let mut output = command.to_string();
    let mut command_position = true;
    let mut ranges = Vec::new();

    for token in &tokens {
        if token.operator {
            command_position = true;
            continue;
        }
        if command_position && !token.quoted && token.text == "exit" {
            ranges.push(token.start..token.end);
        }
        command_position = !token.quoted && COMMAND_PREFIXES.contains(&token.text.as_str());
    }

    // Same length replacement, but walk backwards anyway so offsets stay valid.
    for range in ranges.into_iter().rev() {
        output.replace_range(range, "Exit");
    }
    output
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    /// Token text with quotes and escapes removed.
    pub text: String,
    /// Byte offsets of the token in the source line.
    pub start: usize,
    pub end: usize,
    /// Any part of the word was quoted or escaped.
    pub quoted: bool,
    /// A shell operator such as `;`, `&&` or `>&`.
    pub operator: bool,
}

#[derive(Default)]
struct Word {
    text: String,
    start: Option<usize>,
    quoted: bool,
}

impl Word {
    fn begin(&mut self, at: usize) {
        self.start.get_or_insert(at);
    }

    fn flush(&mut self, end: usize, tokens: &mut Vec<Token>) {
        if let Some(start) = self.start.take() {
            tokens.push(Token {
                text: std::mem::take(&mut self.text),
                start,
                end,
                quoted: self.quoted,
                operator: false,
            });
        }
        self.quoted = false;
    }
}

pub(crate) fn tokenize(line: &str) -> Result<Vec<Token>, Rejection> {
    let mut tokens = Vec::new();
    let mut word = Word::default();
    let mut chars = line.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => word.flush(i, &mut tokens),

            c if PUNCTUATION.contains(&c) => {
                word.flush(i, &mut tokens);
                let mut text = String::from(c);
                if let Some(&(_, next)) = chars.peek() {
                    let pair = [c, next];
                    if OPERATORS.iter().any(|op| op.chars().eq(pair)) {
                        text.push(next);
                        chars.next();
                    }
                }
                tokens.push(Token {
                    start: i,
                    end: i + text.len(),
                    text,
                    quoted: false,
                    operator: true,
                });
            }

            '#' if word.start.is_none() => break,

            '\\' => {
                word.begin(i);
                word.quoted = true;
                // A trailing backslash is kept literally.
                match chars.next() {
                    Some((_, escaped)) => word.text.push(escaped),
                    None => word.text.push('\\'),
                }
            }

            '\'' => {
                word.begin(i);
                word.quoted = true;
                loop {
                    match chars.next() {
                        Some((_, '\'')) => break,
                        Some((_, inner)) => word.text.push(inner),
                        None => return Err(Rejection::Unbalanced),
                    }
                }
            }

            '"' => {
                word.begin(i);
                word.quoted = true;
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, escaped @ ('"' | '\\' | '$' | '`'))) => {
                                word.text.push(escaped)
                            }
                            Some((_, other)) => {
                                word.text.push('\\');
                                word.text.push(other);
                            }
                            None => return Err(Rejection::Unbalanced),
                        },
                        Some((_, inner)) => word.text.push(inner),
                        None => return Err(Rejection::Unbalanced),
                    }
                }
            }

            other => {
                word.begin(i);
                word.text.push(other);
            }
        }
    }

    let end = chars.peek().map_or(line.len(), |&(i, _)| i);
    word.flush(end, &mut tokens);
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
