//! Minimal parser for the line-oriented text exposition format.
//!
//! The parser only locates structure: metric name, labels and the closing
//! brace. Rewriting splices new labels into the original text, so everything
//! outside the inserted segment survives byte for byte.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::ops::Range;

/// A `name="value"` pair of a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label<'a> {
    pub name: &'a str,
    /// Unescaped value.
    pub value: Cow<'a, str>,
}

/// A parsed data line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample<'a> {
    line: &'a str,
    name: Range<usize>,
    labels: Vec<Label<'a>>,
    /// Byte offset of `}`; `None` when the sample has no label set.
    closing_brace: Option<usize>,
    value: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line<'a> {
    Blank,
    Comment,
    Sample(Sample<'a>),
    /// Anything that is not a well-formed sample; passed through untouched.
    Unparsed,
}

impl<'a> Line<'a> {
    /// Parses one line without its line terminator.
    pub fn parse(line: &'a str) -> Self {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            Line::Blank
        } else if trimmed.starts_with('#') {
            Line::Comment
        } else {
            Parser::new(line)
                .sample()
                .map_or(Line::Unparsed, Line::Sample)
        }
    }
}

impl<'a> Sample<'a> {
    pub fn name(&self) -> &'a str {
        &self.line[self.name.clone()]
    }

    pub fn labels(&self) -> &[Label<'a>] {
        &self.labels
    }

    /// Unescaped value of the first label called `name`.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|label| label.name == name)
            .map(|label| label.value.as_ref())
    }

    /// The sample value (and timestamp, if any) as written.
    pub fn value(&self) -> &'a str {
        &self.line[self.value.clone()]
    }

    /// The original line with `extra` labels inserted right before the
    /// closing brace. Samples without a label set gain one after the name.
    pub fn with_labels(&self, extra: &[(&str, String)]) -> String {
        if extra.is_empty() {
            return self.line.to_string();
        }

        let mut inserted = String::new();
        for (i, (name, value)) in extra.iter().enumerate() {
            if i > 0 {
                inserted.push(',');
            }
            let _ = write!(inserted, "{name}=\"{}\"", escape_label_value(value));
        }

        match self.closing_brace {
            Some(brace) => {
                let before = &self.line[..brace];
                let separator = match before.trim_end().chars().last() {
                    Some('{') | Some(',') => "",
                    _ => ",",
                };
                format!("{before}{separator}{inserted}{}", &self.line[brace..])
            }
            None => {
                let end = self.name.end;
                format!("{}{{{inserted}}}{}", &self.line[..end], &self.line[end..])
            }
        }
    }
}

/// Escapes `\`, `"` and newlines as required inside label values.
pub fn escape_label_value(value: &str) -> Cow<'_, str> {
    if !value.contains(['\\', '"', '\n']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

struct Parser<'a> {
    line: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(line: &'a str) -> Self {
        Self { line, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.line.as_bytes().get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: u8) -> Option<()> {
        (self.peek()? == expected).then(|| self.pos += 1)
    }

    fn identifier(&mut self, allow_colon: bool) -> Option<Range<usize>> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            let valid = b.is_ascii_alphabetic()
                || b == b'_'
                || (allow_colon && b == b':')
                || (self.pos > start && b.is_ascii_digit());
            if !valid {
                break;
            }
            self.pos += 1;
        }
        (self.pos > start).then_some(start..self.pos)
    }

    fn quoted(&mut self) -> Option<Cow<'a, str>> {
        self.eat(b'"')?;
        let start = self.pos;
        let mut escaped = false;
        loop {
            match self.peek()? {
                b'\\' => {
                    escaped = true;
                    self.pos += 2;
                }
                b'"' => break,
                _ => self.pos += 1,
            }
        }
        let raw = self.line.get(start..self.pos)?;
        self.pos += 1;
        Some(if escaped { Cow::Owned(unescape(raw)) } else { Cow::Borrowed(raw) })
    }

    fn sample(mut self) -> Option<Sample<'a>> {
        self.skip_whitespace();
        let name = self.identifier(true)?;
        self.skip_whitespace();

        let mut labels = Vec::new();
        let mut closing_brace = None;
        if self.eat(b'{').is_some() {
            loop {
                self.skip_whitespace();
                if self.peek()? == b'}' {
                    closing_brace = Some(self.pos);
                    self.pos += 1;
                    break;
                }
                let label_name = self.identifier(false)?;
                self.skip_whitespace();
                self.eat(b'=')?;
                self.skip_whitespace();
                let value = self.quoted()?;
                labels.push(Label {
                    name: &self.line[label_name],
                    value,
                });
                self.skip_whitespace();
                match self.peek()? {
                    b',' => self.pos += 1,
                    b'}' => {}
                    _ => return None,
                }
            }
        } else if closing_brace.is_none() && self.pos == name.end {
            // a bare name must be followed by whitespace before the value
            return None;
        }

        let value_start = self.pos;
        let value = self.line[value_start..].trim();
        if value.is_empty() {
            return None;
        }

        Some(Sample {
            line: self.line,
            name,
            labels,
            closing_brace,
            value: value_start..self.line.len(),
        })
    }
}

fn unescape(raw: &str) -> String {
    let mut value = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            value.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => value.push('\n'),
            Some(other) => value.push(other),
            None => value.push('\\'),
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn sample(line: &str) -> Sample<'_> {
        match Line::parse(line) {
            Line::Sample(sample) => sample,
            other => panic!("expected a sample for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn classifies_lines() {
        assert_eq!(Line::parse(""), Line::Blank);
        assert_eq!(Line::parse("   "), Line::Blank);
        assert_eq!(Line::parse("# HELP dcgm_fb_used Framebuffer memory used (in MiB)."), Line::Comment);
        assert_eq!(Line::parse("# TYPE dcgm_fb_used gauge"), Line::Comment);
        assert_eq!(Line::parse("dcgm_fb_used{gpu=\"0\""), Line::Unparsed);
        assert_eq!(Line::parse("dcgm_fb_used{gpu=\"0\"}"), Line::Unparsed);
        assert_eq!(Line::parse("{gpu=\"0\"} 1"), Line::Unparsed);
    }

    #[test]
    fn parses_labels_and_value() {
        let s = sample(r#"dcgm_fb_used{gpu="0",uuid="GPU-abc"} 1024"#);
        assert_eq!(s.name(), "dcgm_fb_used");
        assert_eq!(s.label("gpu"), Some("0"));
        assert_eq!(s.label("uuid"), Some("GPU-abc"));
        assert_eq!(s.label("pod_name"), None);
        assert_eq!(s.value(), " 1024");
        assert_eq!(s.labels().len(), 2);
    }

    #[test]
    fn tolerates_whitespace_and_reordered_labels() {
        let s = sample(r#"dcgm_gpu_temp { uuid = "GPU-abc" , gpu="3" }   57 1700000000"#);
        assert_eq!(s.label("uuid"), Some("GPU-abc"));
        assert_eq!(s.label("gpu"), Some("3"));
        assert_eq!(s.value(), "   57 1700000000");
    }

    #[test]
    fn unescapes_label_values() {
        let s = sample(r#"m{path="C:\\dir",msg="say \"hi\"\n"} 1"#);
        assert_eq!(s.label("path"), Some("C:\\dir"));
        assert_eq!(s.label("msg"), Some("say \"hi\"\n"));
    }

    #[test]
    fn with_labels_inserts_before_closing_brace() {
        let line = r#"dcgm_fb_used{gpu="0",uuid="GPU-abc"} 1024"#;
        let rewritten = sample(line).with_labels(&[
            ("pod_name", "p1".to_string()),
            ("pod_namespace", "default".to_string()),
            ("container_name", "c1".to_string()),
        ]);
        assert_eq!(
            rewritten,
            r#"dcgm_fb_used{gpu="0",uuid="GPU-abc",pod_name="p1",pod_namespace="default",container_name="c1"} 1024"#
        );
    }

    #[test]
    fn with_labels_preserves_surrounding_bytes() {
        let line = r#"m { uuid="GPU-abc" , }   7 1700000000"#;
        let rewritten = sample(line).with_labels(&[("pod_name", "p1".to_string())]);
        assert_eq!(rewritten, r#"m { uuid="GPU-abc" , pod_name="p1"}   7 1700000000"#);
    }

    #[test]
    fn with_labels_handles_empty_and_missing_label_sets() {
        let rewritten = sample("m{} 1").with_labels(&[("pod_name", "p1".to_string())]);
        assert_eq!(rewritten, r#"m{pod_name="p1"} 1"#);

        let rewritten = sample("m 1").with_labels(&[("pod_name", "p1".to_string())]);
        assert_eq!(rewritten, r#"m{pod_name="p1"} 1"#);
    }

    #[test]
    fn with_labels_escapes_values() {
        let rewritten = sample("m{a=\"b\"} 1").with_labels(&[("pod_name", "we\"ird\\".to_string())]);
        assert_eq!(rewritten, r#"m{a="b",pod_name="we\"ird\\"} 1"#);
    }

    #[test]
    fn escape_borrows_clean_values() {
        assert!(matches!(escape_label_value("plain"), Cow::Borrowed("plain")));
        assert_eq!(escape_label_value("a\nb"), "a\\nb");
    }
}
