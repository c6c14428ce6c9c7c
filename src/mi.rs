//! GDB/MI record parser.
//!
//! A pure function from one line of MI output to an [`MIResponse`]. No
//! global state, no I/O — [`controller`](crate::controller) owns the
//! socket/pipe plumbing and hands this module one line at a time.
//!
//! Record grammar (GDB/MI, `interpreter=mi3`):
//!
//! ```text
//! [token] "^" result-class ["," result]*        -- result record
//! [token] "*" async-class ["," result]*          -- exec-async (running/stopped)
//! [token] "=" async-class ["," result]*          -- notify-async (thread-group-*, etc.)
//! [token] "~" c-string                           -- console stream
//! [token] "@" c-string                           -- target (inferior) stdout
//! [token] "&" c-string                           -- log stream
//! "(gdb)"                                        -- prompt, not a record
//! ```
//!
//! `*` and `=` async records are both surfaced as [`RecordKind::Notify`];
//! spec.md treats them as one category (distinguished by `message`, not by
//! which sigil produced them).

use serde_json::{Map, Value};

/// The kind of one parsed MI record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Console,
    Output,
    Log,
    Notify,
    Result,
}

/// One parsed MI record.
#[derive(Debug, Clone, PartialEq)]
pub struct MIResponse {
    pub kind: RecordKind,
    /// The correlation id GDB echoed back, if the line carried one.
    pub correlation_id: Option<u64>,
    /// `done`, `running`, `error`, `stopped`, `thread-group-started`, ...
    /// Empty for console/output/log streams (their content lives in `text`).
    pub message: String,
    /// Structured payload for result/notify records (empty object if none).
    pub payload: Value,
    /// Raw text for console/output/log stream records.
    pub text: Option<String>,
}

/// Parse one line of MI output. Returns `None` for lines that carry no
/// record (the `(gdb)` prompt, blank lines).
///
/// Parse failures on the *payload* degrade to an empty payload rather than
/// dropping the record — callers still learn the record happened (e.g. a
/// `stopped` notify) even if its detail couldn't be decoded. Lines that
/// don't match the grammar at all return `None`; the caller logs and moves
/// on (spec.md §4.1: "parse failure on a record ... never crashes the
/// reader").
pub fn parse_line(line: &str) -> Option<MIResponse> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() || line == "(gdb)" {
        return None;
    }

    let mut chars = line.char_indices().peekable();
    let mut token_end = 0;
    while let Some(&(idx, c)) = chars.peek() {
        if c.is_ascii_digit() {
            token_end = idx + 1;
            chars.next();
        } else {
            break;
        }
    }
    let correlation_id = if token_end > 0 {
        line[..token_end].parse::<u64>().ok()
    } else {
        None
    };
    let rest = &line[token_end..];

    let mut iter = rest.char_indices();
    let (_, sigil) = iter.next()?;
    let body = &rest[sigil.len_utf8()..];

    match sigil {
        '~' => Some(MIResponse {
            kind: RecordKind::Console,
            correlation_id,
            message: String::new(),
            payload: Value::Null,
            text: Some(parse_c_string(body).unwrap_or_else(|| body.to_string())),
        }),
        '@' => Some(MIResponse {
            kind: RecordKind::Output,
            correlation_id,
            message: String::new(),
            payload: Value::Null,
            text: Some(parse_c_string(body).unwrap_or_else(|| body.to_string())),
        }),
        '&' => Some(MIResponse {
            kind: RecordKind::Log,
            correlation_id,
            message: String::new(),
            payload: Value::Null,
            text: Some(parse_c_string(body).unwrap_or_else(|| body.to_string())),
        }),
        '^' => {
            let (message, payload) = split_class_and_results(body);
            Some(MIResponse {
                kind: RecordKind::Result,
                correlation_id,
                message,
                payload,
                text: None,
            })
        }
        '*' | '=' => {
            let (message, payload) = split_class_and_results(body);
            Some(MIResponse {
                kind: RecordKind::Notify,
                correlation_id,
                message,
                payload,
                text: None,
            })
        }
        _ => None,
    }
}

/// Split `"done,reason=\"x\",foo=\"bar\""` into `("done", {reason: "x", foo: "bar"})`.
/// Unparseable remainders collapse into an empty object rather than failing
/// the whole record.
fn split_class_and_results(body: &str) -> (String, Value) {
    let mut p = Parser::new(body);
    let class = p.take_while(|c| c != ',');
    let mut map = Map::new();
    while p.eat(',') {
        if let Some((key, value)) = p.parse_result() {
            map.insert(key, value);
        } else {
            break;
        }
    }
    (class.to_string(), Value::Object(map))
}

/// Recursive-descent parser over MI's value grammar: c-strings, `{tuple}`,
/// `[list]`, and bare result lists (`key=value,key=value` inside a tuple).
struct Parser<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(s: &'a str) -> Self {
        Self { s, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.s[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if pred(c) {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        &self.s[start..self.pos]
    }

    /// Parse one `key=value` pair.
    fn parse_result(&mut self) -> Option<(String, Value)> {
        let key = self.take_while(|c| c != '=').to_string();
        if key.is_empty() || !self.eat('=') {
            return None;
        }
        let value = self.parse_value()?;
        Some((key, value))
    }

    fn parse_value(&mut self) -> Option<Value> {
        match self.peek()? {
            '"' => self.parse_string_value(),
            '{' => self.parse_tuple(),
            '[' => self.parse_list(),
            _ => None,
        }
    }

    fn parse_string_value(&mut self) -> Option<Value> {
        let raw = self.consume_c_string()?;
        Some(Value::String(unescape(raw)))
    }

    /// Consume a `"..."` literal (handling `\"` and `\\`) and return its
    /// interior, unescaped-quote text.
    fn consume_c_string(&mut self) -> Option<&'a str> {
        if !self.eat('"') {
            return None;
        }
        let start = self.pos;
        let bytes = self.s.as_bytes();
        let mut i = self.pos;
        let mut escaped = false;
        while i < bytes.len() {
            let c = bytes[i] as char;
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                break;
            }
            i += 1;
        }
        let text = &self.s[start..i];
        self.pos = (i + 1).min(self.s.len());
        Some(text)
    }

    fn parse_tuple(&mut self) -> Option<Value> {
        self.eat('{');
        let mut map = Map::new();
        if self.peek() == Some('}') {
            self.pos += 1;
            return Some(Value::Object(map));
        }
        loop {
            if let Some((key, value)) = self.parse_result() {
                map.insert(key, value);
            } else {
                // Tuples can also hold bare values (rare); skip to the next
                // separator rather than aborting the whole parse.
                let _ = self.take_while(|c| c != ',' && c != '}');
            }
            if self.eat(',') {
                continue;
            }
            break;
        }
        self.eat('}');
        Some(Value::Object(map))
    }

    fn parse_list(&mut self) -> Option<Value> {
        self.eat('[');
        let mut items = Vec::new();
        if self.peek() == Some(']') {
            self.pos += 1;
            return Some(Value::Array(items));
        }
        loop {
            // List elements are either bare values or `key=value` pairs
            // (GDB emits both forms depending on the command).
            let item = match self.peek() {
                Some('{') => self.parse_tuple(),
                Some('[') => self.parse_list(),
                Some('"') => self.parse_string_value(),
                _ => self.parse_result().map(|(k, v)| {
                    let mut m = Map::new();
                    m.insert(k, v);
                    Value::Object(m)
                }),
            };
            if let Some(v) = item {
                items.push(v);
            } else {
                let _ = self.take_while(|c| c != ',' && c != ']');
            }
            if self.eat(',') {
                continue;
            }
            break;
        }
        self.eat(']');
        Some(Value::Array(items))
    }
}

/// Parse a full `"..."` c-string token (used for console/output/log
/// streams, which are nothing but one c-string each).
fn parse_c_string(body: &str) -> Option<String> {
    let mut p = Parser::new(body);
    let raw = p.consume_c_string()?;
    Some(unescape(raw))
}

/// Decode MI's c-string escapes (`\n`, `\t`, `\"`, `\\`, octal `\nnn`).
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(d) if d.is_ascii_digit() => {
                let mut octal = String::from(d);
                for _ in 0..2 {
                    if chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                        octal.push(chars.next().unwrap());
                    }
                }
                if let Ok(byte) = u8::from_str_radix(&octal, 8) {
                    out.push(byte as char);
                }
            }
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_result_done() {
        let r = parse_line("42^done").unwrap();
        assert_eq!(r.kind, RecordKind::Result);
        assert_eq!(r.correlation_id, Some(42));
        assert_eq!(r.message, "done");
    }

    #[test]
    fn parses_result_with_tuple_payload() {
        let r = parse_line(r#"7^done,bkpt={number="1",type="breakpoint",enabled="y"}"#).unwrap();
        assert_eq!(r.message, "done");
        assert_eq!(r.payload["bkpt"]["number"], "1");
        assert_eq!(r.payload["bkpt"]["enabled"], "y");
    }

    #[test]
    fn parses_error_result() {
        let r = parse_line(r#"3^error,msg="No symbol table is loaded.""#).unwrap();
        assert_eq!(r.message, "error");
        assert_eq!(r.payload["msg"], "No symbol table is loaded.");
    }

    #[test]
    fn parses_exec_async_stopped() {
        let r = parse_line(r#"*stopped,reason="breakpoint-hit",bkptno="1",thread-id="1""#).unwrap();
        assert_eq!(r.kind, RecordKind::Notify);
        assert_eq!(r.correlation_id, None);
        assert_eq!(r.message, "stopped");
        assert_eq!(r.payload["reason"], "breakpoint-hit");
    }

    #[test]
    fn parses_notify_async() {
        let r = parse_line(r#"=thread-group-started,id="i1",pid="12345""#).unwrap();
        assert_eq!(r.kind, RecordKind::Notify);
        assert_eq!(r.message, "thread-group-started");
        assert_eq!(r.payload["pid"], "12345");
    }

    #[test]
    fn parses_console_stream() {
        let r = parse_line(r#"~"Breakpoint 1 at 0x1234: file main.c, line 10.\n""#).unwrap();
        assert_eq!(r.kind, RecordKind::Console);
        assert_eq!(
            r.text.unwrap(),
            "Breakpoint 1 at 0x1234: file main.c, line 10.\n"
        );
    }

    #[test]
    fn parses_target_output_stream() {
        let r = parse_line(r#"@"hello from inferior\n""#).unwrap();
        assert_eq!(r.kind, RecordKind::Output);
        assert_eq!(r.text.unwrap(), "hello from inferior\n");
    }

    #[test]
    fn parses_log_stream() {
        let r = parse_line(r#"&"warning: something\n""#).unwrap();
        assert_eq!(r.kind, RecordKind::Log);
    }

    #[test]
    fn ignores_prompt_and_blank_lines() {
        assert!(parse_line("(gdb)").is_none());
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
    }

    #[test]
    fn parses_list_payload() {
        let r = parse_line(r#"9^done,register-names=["rax","rbx","rip"]"#).unwrap();
        assert_eq!(r.payload["register-names"][0], "rax");
        assert_eq!(r.payload["register-names"][2], "rip");
    }

    #[test]
    fn handles_token_without_correlation() {
        let r = parse_line("^running").unwrap();
        assert_eq!(r.correlation_id, None);
        assert_eq!(r.message, "running");
    }

    #[test]
    fn malformed_payload_does_not_panic() {
        // Truncated tuple: parser should not crash, just give what it can.
        let r = parse_line(r#"5^done,bkpt={number="1""#).unwrap();
        assert_eq!(r.message, "done");
        assert_eq!(r.payload["bkpt"]["number"], "1");
    }
}
