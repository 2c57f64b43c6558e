//! SMTP reply parsing.

use super::error::{ClientError, Result};

/// A single line of a (possibly multi-line) reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub code: u16,
    /// `true` for the final line (`250 ...`), `false` for continuations (`250-...`).
    pub is_last: bool,
    pub message: String,
}

/// A complete SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// All reply lines joined with newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 3xx: the server wants more input (DATA, AUTH challenges).
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Whether an EHLO reply advertises `keyword` (case-insensitive).
    ///
    /// The first line of an EHLO reply is the server's greeting name and is
    /// never treated as a keyword.
    #[must_use]
    pub fn supports(&self, keyword: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|first| first.eq_ignore_ascii_case(keyword))
        })
    }

    /// Mechanisms listed on the `AUTH` line of an EHLO reply, uppercased.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<String> {
        self.lines
            .iter()
            .skip(1)
            .filter_map(|line| {
                let mut words = line.split_whitespace();
                let keyword = words.next()?;
                // Some servers still use the pre-standard `AUTH=PLAIN LOGIN` form.
                let rest = if keyword.eq_ignore_ascii_case("AUTH") {
                    words.map(str::to_ascii_uppercase).collect::<Vec<_>>()
                } else if let Some(first) = keyword
                    .get(..5)
                    .filter(|prefix| prefix.eq_ignore_ascii_case("AUTH="))
                    .and_then(|_| keyword.get(5..))
                {
                    std::iter::once(first)
                        .chain(words)
                        .map(str::to_ascii_uppercase)
                        .collect()
                } else {
                    return None;
                };
                Some(rest)
            })
            .flatten()
            .filter(|mechanism| !mechanism.is_empty())
            .collect()
    }

    /// Turns a non-2xx reply into [`ClientError::SmtpError`].
    ///
    /// # Errors
    ///
    /// Returns the reply as an error unless it is a success.
    pub fn ensure_success(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }

    #[must_use]
    pub fn into_error(self) -> ClientError {
        ClientError::SmtpError {
            code: self.code,
            message: self.message(),
        }
    }

    /// Parses a single reply line (without its line terminator).
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the line doesn't match SMTP format.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        let code_str = line
            .get(..3)
            .ok_or_else(|| ClientError::ParseError(format!("Response line too short: '{line}'")))?;

        let code = code_str
            .parse::<u16>()
            .map_err(|_| ClientError::ParseError(format!("Invalid status code: '{code_str}'")))?;

        let is_last = match line.as_bytes().get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(c) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{}'",
                    char::from(*c)
                )));
            }
        };

        let message = line.get(4..).unwrap_or_default().to_string();

        Ok(ResponseLine {
            code,
            is_last,
            message,
        })
    }

    /// Parses one complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes it occupied, or `None` if
    /// more data is needed.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the reply is malformed.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut lines = Vec::new();
        let mut first_code = None;

        while let Some(newline) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + newline];
            consumed += newline + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let parsed = Self::parse_line(std::str::from_utf8(raw)?)?;

            match first_code {
                Some(code) if parsed.code != code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {code}, got {}",
                        parsed.code
                    )));
                }
                Some(_) => {}
                None => first_code = Some(parsed.code),
            }

            lines.push(parsed.message);

            if parsed.is_last {
                return Ok(Some((Self::new(parsed.code, lines), consumed)));
            }
        }

        Ok(None)
    }
}
