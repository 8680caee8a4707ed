//! Prompt lexer for the interactive shell byte stream.
//!
//! Raw output is cut into two token kinds: partial output that belongs to the
//! running command, and the prompt that marks its completion. Text that might
//! be the start of a prompt is held back until the next read decides it.

use regex::Regex;

use crate::storage::settings::PromptStyle;

/// Longest fragment held back as a possible prompt prefix
const MAX_HOLDBACK: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Output of the running command, forwarded as it arrives
    Partial(String),
    /// A prompt was seen; carries the command output preceding it with
    /// escape sequences removed and trailing whitespace trimmed
    Prompt(String),
}

/// Incremental tokenizer, one per session
#[derive(Debug)]
pub struct PromptLexer {
    style: PromptStyle,
    prompt: Regex,
    ansi: Regex,
    /// undecoded tail of an incomplete UTF-8 sequence
    raw_tail: Vec<u8>,
    /// decoded text not yet emitted
    pending: String,
}

impl PromptLexer {
    pub fn new(style: PromptStyle) -> Self {
        let prompt = match style {
            PromptStyle::Redhat => r"\[[^\[\]\n]+?@[^\[\]\n]+? [^\[\]\n]+?\]\$",
            PromptStyle::Debian => r"[^\s@\[\]]+@[^\s:]+:[^\n]*?\$ ?$",
        };
        Self {
            style,
            prompt: Regex::new(prompt).unwrap_or_else(|e| panic!("{e}")),
            ansi: Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
                .unwrap_or_else(|e| panic!("{e}")),
            raw_tail: Vec::new(),
            pending: String::new(),
        }
    }

    /// Forget everything buffered, used once a prompt closed a command
    pub fn reset(&mut self) {
        self.raw_tail.clear();
        self.pending.clear();
    }

    /// Feed raw bytes, returning the tokens they complete
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Token> {
        let text = self.decode(bytes);
        let combined = std::mem::take(&mut self.pending) + &text;
        self.pending = normalize(&combined);

        let mut tokens = Vec::new();
        if let Some(found) = self.prompt.find(&self.pending) {
            let before = &self.pending[..found.start()];
            let cleaned = self.ansi.replace_all(before, "");
            tokens.push(Token::Prompt(cleaned.trim_end().to_string()));
            // whatever trails the prompt is the shell waiting for input
            self.pending.clear();
            return tokens;
        }

        let keep_from = self.holdback_start();
        if keep_from > 0 {
            let emitted: String = self.pending.drain(..keep_from).collect();
            tokens.push(Token::Partial(emitted));
        }
        tokens
    }

    fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.raw_tail);
        buf.extend(bytes.iter().copied().filter(|b| *b != 0));
        match std::str::from_utf8(&buf) {
            Ok(s) => s.to_string(),
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                self.raw_tail = buf[valid..].to_vec();
                String::from_utf8_lossy(&buf[..valid]).into_owned()
            }
            Err(_) => String::from_utf8_lossy(&buf).into_owned(),
        }
    }

    /// Byte index where the possible prompt prefix starts
    fn holdback_start(&self) -> usize {
        let text = &self.pending;
        // a carriage return may be the first half of a CRLF
        if text.ends_with('\r') {
            return text.len() - 1;
        }
        let line_start = text.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let last_line = &text[line_start..];
        let candidate = match self.style {
            PromptStyle::Redhat => last_line.rfind('[').map(|i| line_start + i),
            PromptStyle::Debian => last_line.contains('@').then_some(line_start),
        };
        match candidate {
            Some(start) if text.len() - start <= MAX_HOLDBACK => start,
            _ => text.len(),
        }
    }
}

/// Fold CRLF into LF and keep only what a terminal would show after a bare CR
fn normalize(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    if !text.contains('\r') {
        return text;
    }
    let mut out = String::with_capacity(text.len());
    let mut lines = text.split('\n').peekable();
    while let Some(line) = lines.next() {
        let is_last = lines.peek().is_none();
        // a trailing CR is kept so the next chunk can complete a CRLF
        let (body, trailing_cr) = match line.strip_suffix('\r') {
            Some(body) if is_last => (body, true),
            _ => (line, false),
        };
        out.push_str(body.rsplit('\r').next().unwrap_or(body));
        if trailing_cr {
            out.push('\r');
        }
        if !is_last {
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(lexer: &mut PromptLexer, chunks: &[&[u8]]) -> Vec<Token> {
        chunks.iter().flat_map(|c| lexer.feed(c)).collect()
    }

    #[test]
    fn test_output_then_prompt() {
        let mut lexer = PromptLexer::new(PromptStyle::Redhat);
        let tokens = collect(&mut lexer, &[b"hi\r\n", b"[alice@web1 public_html]$ "]);
        assert_eq!(
            tokens,
            vec![Token::Partial("hi\n".into()), Token::Prompt(String::new())]
        );
    }

    #[test]
    fn test_dollar_then_prompt_resolves_once() {
        let mut lexer = PromptLexer::new(PromptStyle::Redhat);
        let tokens = lexer.feed(b"$ [alice@web1 ~]$ ");
        assert_eq!(tokens, vec![Token::Prompt("$".into())]);

        // nothing buffered is attributed to the finished command
        assert!(lexer.feed(b"").is_empty());
    }

    #[test]
    fn test_prompt_split_across_reads() {
        let mut lexer = PromptLexer::new(PromptStyle::Redhat);
        let mut tokens = lexer.feed(b"done\n[alice@we");
        assert_eq!(tokens, vec![Token::Partial("done\n".into())]);

        tokens = lexer.feed(b"b1 ~]$ ");
        assert_eq!(tokens, vec![Token::Prompt(String::new())]);
    }

    #[test]
    fn test_null_bytes_and_escapes_stripped_from_final_chunk() {
        let mut lexer = PromptLexer::new(PromptStyle::Redhat);
        let tokens = lexer.feed(b"ok\0\x1b[32m green\x1b[0m  \n\x1b]0;alice@web1:~\x07[alice@web1 ~]$ ");
        assert_eq!(tokens, vec![Token::Prompt("ok green".into())]);
    }

    #[test]
    fn test_bracket_output_is_not_held_forever() {
        let mut lexer = PromptLexer::new(PromptStyle::Redhat);
        let tokens = lexer.feed(b"[INFO] building\n");
        assert_eq!(tokens, vec![Token::Partial("[INFO] building\n".into())]);
    }

    #[test]
    fn test_utf8_split() {
        let mut lexer = PromptLexer::new(PromptStyle::Redhat);
        let bytes = "héllo\n".as_bytes();
        let mut tokens = lexer.feed(&bytes[..2]);
        tokens.extend(lexer.feed(&bytes[2..]));
        let text: String = tokens
            .into_iter()
            .map(|t| match t {
                Token::Partial(s) | Token::Prompt(s) => s,
            })
            .collect();
        assert_eq!(text, "héllo\n");
    }

    #[test]
    fn test_carriage_return_progress() {
        let mut lexer = PromptLexer::new(PromptStyle::Redhat);
        let tokens = lexer.feed(b"10%\r50%\r100%\nok\r");
        assert_eq!(tokens, vec![Token::Partial("100%\nok".into())]);
        let tokens = lexer.feed(b"\n");
        assert_eq!(tokens, vec![Token::Partial("\n".into())]);
    }

    #[test]
    fn test_debian_prompt() {
        let mut lexer = PromptLexer::new(PromptStyle::Debian);
        let tokens = collect(&mut lexer, &[b"v20.1.0\n", b"alice@web1:~/public_html$ "]);
        assert_eq!(
            tokens,
            vec![Token::Partial("v20.1.0\n".into()), Token::Prompt(String::new())]
        );
    }
}
