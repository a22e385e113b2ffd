use mail_parser::MessageParser;

/// A parsed mailbox: optional display name plus the address proper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub name: Option<String>,
    pub address: String,
}

/// Normalize an RFC 5321 address: trim the local part (case preserving),
/// ASCII-fold the domain, reassemble. Anything that does not look like
/// `local@domain` normalizes to the empty string, which callers treat as
/// "no address".
pub fn normalize(address: &str) -> String {
    let address = address.trim();

    let Some((local, domain)) = address.rsplit_once('@') else {
        return String::new();
    };

    let local = local.trim();
    let domain = normalize_domain(domain);

    if local.is_empty() || domain.is_empty() {
        return String::new();
    }

    format!("{local}@{domain}")
}

/// ASCII-fold a domain name via IDNA, lowercased. An unmappable domain is
/// passed through lowercased so the caller can still key on it.
pub fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim().trim_matches('.');

    idna::domain_to_ascii(domain).unwrap_or_else(|_| domain.to_lowercase())
}

/// The domain part of a normalized address, or an empty string.
pub fn domain_of(address: &str) -> &str {
    address.rsplit_once('@').map(|(_, d)| d).unwrap_or("")
}

/// Parse an RFC 5322 address list (display names, comments, groups) into a
/// flat list of mailboxes with normalized addresses. Group constructs are
/// flattened recursively; entries without a usable address are dropped.
pub fn parse_address_list(input: &str) -> Vec<Mailbox> {
    let synthetic = format!("To: {input}\r\n\r\n");

    let Some(message) = MessageParser::new().parse(synthetic.as_bytes()) else {
        return Vec::new();
    };

    let Some(list) = message.to() else {
        return Vec::new();
    };

    list.iter()
        .filter_map(|addr| {
            let address = normalize(addr.address()?);
            if address.is_empty() {
                return None;
            }
            Some(Mailbox {
                name: addr
                    .name()
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(String::from),
                address,
            })
        })
        .collect()
}

// Characters that may appear in a display name without any quoting.
fn is_plain_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ' ' || c == '\''
}

/// Render a display name for an outbound header. Plain names pass through,
/// 7-bit names are quote-escaped, anything else becomes MIME encoded words
/// (Q encoding, 52 encoded characters per word).
pub fn encode_display_name(name: &str) -> String {
    if name.chars().all(is_plain_name_char) {
        return name.to_string();
    }

    if name.is_ascii() {
        let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
        return format!("\"{escaped}\"");
    }

    encode_words(name)
}

const ENCODED_WORD_BUDGET: usize = 52;

fn encode_words(name: &str) -> String {
    let mut words = Vec::new();
    let mut current = String::new();

    for byte in name.bytes() {
        let encoded = match byte {
            b' ' => "_".to_string(),
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'!' | b'*' | b'+' | b'-' | b'/' => {
                (byte as char).to_string()
            }
            _ => format!("={byte:02X}"),
        };

        // never split an =XX escape across words
        if current.len() + encoded.len() > ENCODED_WORD_BUDGET {
            words.push(current);
            current = String::new();
        }
        current.push_str(&encoded);
    }
    if !current.is_empty() {
        words.push(current);
    }

    words
        .into_iter()
        .map(|w| format!("=?UTF-8?Q?{w}?="))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render `name <address>` (or just the address) for an outbound header.
pub fn format_mailbox(mailbox: &Mailbox) -> String {
    match &mailbox.name {
        Some(name) => format!("{} <{}>", encode_display_name(name), mailbox.address),
        None => mailbox.address.clone(),
    }
}
