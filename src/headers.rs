use std::fmt;

/// One header as it appeared on the wire, folding included.
#[derive(Debug, Clone)]
pub struct HeaderLine {
    key: String,
    line: String,
}

impl HeaderLine {
    fn new(line: String) -> Self {
        let key = line
            .split(':')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        Self { key, line }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The unfolded value with the key prefix stripped.
    pub fn value(&self) -> String {
        let value = match self.line.split_once(':') {
            Some((_, value)) => value,
            None => "",
        };

        value
            .split("\r\n")
            .map(str::trim)
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string()
    }

    pub fn raw(&self) -> &str {
        &self.line
    }
}

/// An ordered, mutable snapshot of a message's header block in wire form.
///
/// Mutations keep the original lines byte for byte; new headers are inserted
/// at the top of the block, which is the single insertion point the
/// downstream serializer relies on.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    lines: Vec<HeaderLine>,
}

impl Headers {
    /// Parse a raw header block (everything before the CRLF CRLF separator).
    /// Folded continuation lines are kept attached to their header.
    pub fn parse(block: &[u8]) -> Self {
        let text = String::from_utf8_lossy(block);
        let mut lines: Vec<HeaderLine> = Vec::new();

        for raw in text.split("\r\n").filter(|l| !l.is_empty()) {
            if raw.starts_with(' ') || raw.starts_with('\t') {
                if let Some(last) = lines.last_mut() {
                    last.line.push_str("\r\n");
                    last.line.push_str(raw);
                    continue;
                }
            }
            lines.push(HeaderLine::new(raw.to_string()));
        }

        Self { lines }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.lines.iter().any(|l| l.key == key)
    }

    pub fn get_first(&self, key: &str) -> Option<String> {
        let key = key.to_ascii_lowercase();
        self.lines.iter().find(|l| l.key == key).map(|l| l.value())
    }

    pub fn get_all(&self, key: &str) -> Vec<String> {
        let key = key.to_ascii_lowercase();
        self.lines
            .iter()
            .filter(|l| l.key == key)
            .map(|l| l.value())
            .collect()
    }

    /// Headers in wire order, for matching that must honor last-to-first
    /// precedence.
    pub fn lines(&self) -> &[HeaderLine] {
        &self.lines
    }

    /// Insert a header at the top of the block.
    pub fn prepend(&mut self, key: &str, value: &str) {
        self.lines.insert(0, HeaderLine::new(format!("{key}: {value}")));
    }

    /// Append a header at the bottom of the block.
    pub fn append(&mut self, key: &str, value: &str) {
        self.lines.push(HeaderLine::new(format!("{key}: {value}")));
    }

    /// Drop every occurrence of a header.
    pub fn remove(&mut self, key: &str) {
        let key = key.to_ascii_lowercase();
        self.lines.retain(|l| l.key != key);
    }

    /// Serialize back to wire form, terminating CRLF included but without
    /// the blank separator line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for line in &self.lines {
            out.extend_from_slice(line.line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{}", line.line)?;
        }
        Ok(())
    }
}
