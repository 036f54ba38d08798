use std::fmt::Write as _;

/// One protocol-level message, independent of transport encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Open,
    Heartbeat,
    Messages(Vec<String>),
    Close { code: u16, reason: String },
}

impl Frame {
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close {
            code,
            reason: reason.into(),
        }
    }

    /// Base wire form: a single marker character, followed by a JSON body
    /// for the message and close variants. Transports wrap this further.
    pub fn render(&self) -> String {
        match self {
            Frame::Open => "o".to_string(),
            Frame::Heartbeat => "h".to_string(),
            Frame::Messages(payloads) => {
                let body = serde_json::to_string(payloads).unwrap_or_else(|_| "[]".to_string());
                format!("a{body}")
            }
            Frame::Close { code, reason } => {
                let body = serde_json::to_string(&(*code, reason))
                    .unwrap_or_else(|_| format!("[{code},\"\"]"));
                format!("c{body}")
            }
        }
    }
}

/// Render a wire string as a JavaScript string literal, for transports that
/// pass frames through `<script>` bodies. Escapes quotes, backslashes,
/// control characters, and the line separators JSON allows but JS does not.
pub fn js_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
