use base64ct::{Base64, Encoding};

/// Content-Transfer-Encoding of a MIME node, as far as the rewrite plumbing
/// cares: identity encodings are passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    #[default]
    Identity,
    QuotedPrintable,
    Base64,
}

impl TransferEncoding {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "quoted-printable" => Self::QuotedPrintable,
            "base64" => Self::Base64,
            _ => Self::Identity,
        }
    }

    pub fn decoder(self) -> Decoder {
        match self {
            Self::Identity => Decoder::Identity,
            Self::QuotedPrintable => Decoder::QuotedPrintable(QpDecoder::default()),
            Self::Base64 => Decoder::Base64(B64Decoder::default()),
        }
    }

    pub fn encoder(self) -> Encoder {
        match self {
            Self::Identity => Encoder::Identity,
            Self::QuotedPrintable => Encoder::QuotedPrintable(QpEncoder::default()),
            Self::Base64 => Encoder::Base64(B64Encoder::default()),
        }
    }
}

pub enum Decoder {
    Identity,
    QuotedPrintable(QpDecoder),
    Base64(B64Decoder),
}

impl Decoder {
    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Identity => data.to_vec(),
            Self::QuotedPrintable(qp) => qp.update(data),
            Self::Base64(b64) => b64.update(data),
        }
    }

    pub fn finish(&mut self) -> Vec<u8> {
        match self {
            Self::Identity => Vec::new(),
            Self::QuotedPrintable(qp) => qp.finish(),
            Self::Base64(b64) => b64.finish(),
        }
    }
}

pub enum Encoder {
    Identity,
    QuotedPrintable(QpEncoder),
    Base64(B64Encoder),
}

impl Encoder {
    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Identity => data.to_vec(),
            Self::QuotedPrintable(qp) => qp.update(data),
            Self::Base64(b64) => b64.update(data),
        }
    }

    pub fn finish(&mut self) -> Vec<u8> {
        match self {
            Self::Identity => Vec::new(),
            Self::QuotedPrintable(qp) => qp.finish(),
            Self::Base64(b64) => b64.finish(),
        }
    }
}

const LINE_LENGTH: usize = 76;

/// Incremental base64 decoder, tolerant of line breaks and stray whitespace.
#[derive(Default)]
pub struct B64Decoder {
    carry: Vec<u8>,
}

impl B64Decoder {
    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        self.carry
            .extend(data.iter().copied().filter(|b| !b.is_ascii_whitespace()));

        let usable = self.carry.len() - self.carry.len() % 4;
        if usable == 0 {
            return Vec::new();
        }

        let chunk: Vec<u8> = self.carry.drain(..usable).collect();
        Base64::decode_vec(std::str::from_utf8(&chunk).unwrap_or("")).unwrap_or_default()
    }

    pub fn finish(&mut self) -> Vec<u8> {
        if self.carry.is_empty() {
            return Vec::new();
        }

        // a trailing group shorter than four chars lost its padding somewhere
        let mut chunk: Vec<u8> = self.carry.drain(..).collect();
        while chunk.len() % 4 != 0 {
            chunk.push(b'=');
        }
        Base64::decode_vec(std::str::from_utf8(&chunk).unwrap_or("")).unwrap_or_default()
    }
}

/// Incremental base64 encoder wrapping output at 76 characters.
#[derive(Default)]
pub struct B64Encoder {
    carry: Vec<u8>,
    line: usize,
}

impl B64Encoder {
    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        self.carry.extend_from_slice(data);

        let usable = self.carry.len() - self.carry.len() % 3;
        let chunk: Vec<u8> = self.carry.drain(..usable).collect();

        self.wrap(Base64::encode_string(&chunk).into_bytes())
    }

    pub fn finish(&mut self) -> Vec<u8> {
        let chunk: Vec<u8> = self.carry.drain(..).collect();
        let mut out = self.wrap(Base64::encode_string(&chunk).into_bytes());
        if self.line > 0 {
            out.extend_from_slice(b"\r\n");
            self.line = 0;
        }
        out
    }

    fn wrap(&mut self, encoded: Vec<u8>) -> Vec<u8> {
        let mut out = Vec::with_capacity(encoded.len() + encoded.len() / LINE_LENGTH * 2);
        for byte in encoded {
            if self.line == LINE_LENGTH {
                out.extend_from_slice(b"\r\n");
                self.line = 0;
            }
            out.push(byte);
            self.line += 1;
        }
        out
    }
}

/// Incremental quoted-printable decoder. An escape split across chunk
/// borders is carried over to the next call.
#[derive(Default)]
pub struct QpDecoder {
    pending: Vec<u8>,
}

impl QpDecoder {
    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(data);

        let mut out = Vec::with_capacity(input.len());
        let mut i = 0;

        while i < input.len() {
            let byte = input[i];
            if byte != b'=' {
                out.push(byte);
                i += 1;
                continue;
            }

            if input.len() - i < 3 {
                // possibly an incomplete escape, wait for more data
                self.pending.extend_from_slice(&input[i..]);
                break;
            }

            match (input[i + 1], input[i + 2]) {
                (b'\r', b'\n') => i += 3, // soft line break
                (hi, lo) => match (hex_value(hi), hex_value(lo)) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        // not a valid escape, pass the '=' through
                        out.push(b'=');
                        i += 1;
                    }
                },
            }
        }

        out
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        _ => None,
    }
}

/// Incremental quoted-printable encoder with soft wrapping. The current
/// output line is buffered so trailing whitespace before a hard break can
/// still be escaped.
#[derive(Default)]
pub struct QpEncoder {
    line: Vec<u8>,
    saw_cr: bool,
}

impl QpEncoder {
    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());

        for &byte in data {
            if self.saw_cr {
                self.saw_cr = false;
                if byte == b'\n' {
                    self.flush_line(&mut out);
                    continue;
                }
                self.push_encoded(b'\r', &mut out);
            }

            if byte == b'\r' {
                self.saw_cr = true;
                continue;
            }

            match byte {
                b'\t' | b' ' | 33..=60 | 62..=126 => self.push_literal(byte, &mut out),
                _ => self.push_encoded(byte, &mut out),
            }
        }

        out
    }

    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.saw_cr {
            self.saw_cr = false;
            self.push_encoded(b'\r', &mut out);
        }
        self.escape_trailing_whitespace();
        out.extend_from_slice(&self.line);
        self.line.clear();
        out
    }

    fn flush_line(&mut self, out: &mut Vec<u8>) {
        self.escape_trailing_whitespace();
        out.extend_from_slice(&self.line);
        out.extend_from_slice(b"\r\n");
        self.line.clear();
    }

    fn escape_trailing_whitespace(&mut self) {
        if let Some(&last @ (b' ' | b'\t')) = self.line.last() {
            self.line.pop();
            self.line.extend_from_slice(format!("={last:02X}").as_bytes());
        }
    }

    fn push_literal(&mut self, byte: u8, out: &mut Vec<u8>) {
        self.soft_wrap(1, out);
        self.line.push(byte);
    }

    fn push_encoded(&mut self, byte: u8, out: &mut Vec<u8>) {
        self.soft_wrap(3, out);
        self.line.extend_from_slice(format!("={byte:02X}").as_bytes());
    }

    fn soft_wrap(&mut self, next: usize, out: &mut Vec<u8>) {
        // leave room for the trailing '=' of a soft break
        if self.line.len() + next > LINE_LENGTH - 1 {
            out.extend_from_slice(&self.line);
            out.extend_from_slice(b"=\r\n");
            self.line.clear();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_all(encoding: TransferEncoding, chunks: &[&[u8]]) -> Vec<u8> {
        let mut decoder = encoding.decoder();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(decoder.update(chunk));
        }
        out.extend(decoder.finish());
        out
    }

    #[test]
    fn base64_decode_across_chunks() {
        let out = decode_all(
            TransferEncoding::Base64,
            &[b"aGVsbG8g", b"d29y\r\nbGQ="],
        );
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn base64_encode_wraps_lines() {
        let mut encoder = TransferEncoding::Base64.encoder();
        let mut out = encoder.update(&[b'x'; 100]);
        out.extend(encoder.finish());

        let text = String::from_utf8(out).unwrap();
        for line in text.trim_end().split("\r\n") {
            assert!(line.len() <= LINE_LENGTH);
        }
        assert_eq!(decode_all(TransferEncoding::Base64, &[text.as_bytes()]), [b'x'; 100]);
    }

    #[test]
    fn qp_decode_handles_split_escapes() {
        let out = decode_all(
            TransferEncoding::QuotedPrintable,
            &[b"caf=", b"C3=A9 soft=\r\n break"],
        );
        assert_eq!(out, "café soft break".as_bytes());
    }

    #[test]
    fn qp_encoder_escapes_trailing_whitespace() {
        let mut encoder = TransferEncoding::QuotedPrintable.encoder();
        let mut out = encoder.update(b"line \r\nnext");
        out.extend(encoder.finish());
        assert_eq!(out, b"line=20\r\nnext");
    }

    #[test]
    fn qp_roundtrip() {
        let input = "ünïcode text with = signs\r\nand lines\r\n".as_bytes();
        let mut encoder = TransferEncoding::QuotedPrintable.encoder();
        let mut encoded = encoder.update(input);
        encoded.extend(encoder.finish());

        assert_eq!(decode_all(TransferEncoding::QuotedPrintable, &[&encoded]), input);
    }
}
