//! SIP Nachrichten für den WebSocket-Transport
//!
//! Bewusst minimal: Start-Line, Header-Liste und Body. Genug für
//! REGISTER, INVITE, ACK, CANCEL und BYE eines einzelnen Clients.

use super::stack::SignalingError;
use std::fmt;

// ============================================================================
// METHOD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Other(String),
}

impl Method {
    fn parse(raw: &str) -> Self {
        match raw {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            other => Method::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Other(name) => name,
        };
        f.write_str(name)
    }
}

// ============================================================================
// HEADERS
// ============================================================================

/// Geordnete Header-Liste, Namen case-insensitive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Erster Header mit diesem Namen (inklusive Kurzform)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).next()
    }

    pub fn get_all<'a: 'n, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + 'n {
        let compact = compact_form(name);
        self.0
            .iter()
            .filter(move |(n, _)| {
                n.eq_ignore_ascii_case(name) || compact.is_some_and(|c| n.eq_ignore_ascii_case(c))
            })
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

fn compact_form(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "via" => Some("v"),
        "from" => Some("f"),
        "to" => Some("t"),
        "call-id" => Some("i"),
        "contact" => Some("m"),
        "content-length" => Some("l"),
        "content-type" => Some("c"),
        _ => None,
    }
}

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    pub method: Method,
    pub uri: String,
    pub headers: Headers,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Headers::default(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: String) -> Self {
        self.headers.push("Content-Type", content_type);
        self.body = body;
        self
    }

    /// Antwort auf diesen Request mit den Pflicht-Headern
    pub fn response(&self, status: u16, reason: &str) -> SipResponse {
        let mut headers = Headers::default();
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            for value in self.headers.get_all(name) {
                headers.push(name, value);
            }
        }
        SipResponse {
            status,
            reason: reason.to_string(),
            headers,
            body: String::new(),
        }
    }
}

impl SipResponse {
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_auth_challenge(&self) -> bool {
        self.status == 401 || self.status == 407
    }
}

impl SipMessage {
    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(r) => &r.headers,
            SipMessage::Response(r) => &r.headers,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers().get("Call-ID")
    }

    /// Branch-Parameter des obersten Via-Headers
    pub fn branch(&self) -> Option<&str> {
        self.headers().get("Via").and_then(|via| param(via, "branch"))
    }

    /// Parst eine SIP-Nachricht aus einem WebSocket-Frame
    pub fn parse(raw: &str) -> Result<Self, SignalingError> {
        let (head, body) = match raw.split_once("\r\n\r\n") {
            Some((head, body)) => (head, body),
            None => (raw.trim_end(), ""),
        };

        let mut lines = head.split("\r\n");
        let start = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| SignalingError::Protocol("empty message".into()))?;

        let mut headers = Headers::default();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| SignalingError::Protocol(format!("bad header line: {}", line)))?;
            headers.push(name.trim(), value.trim());
        }

        if let Some(rest) = start.strip_prefix("SIP/2.0 ") {
            let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
            let status = code
                .parse()
                .map_err(|_| SignalingError::Protocol(format!("bad status line: {}", start)))?;
            Ok(SipMessage::Response(SipResponse {
                status,
                reason: reason.to_string(),
                headers,
                body: body.to_string(),
            }))
        } else {
            let mut parts = start.split(' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(method), Some(uri), Some("SIP/2.0")) => {
                    Ok(SipMessage::Request(SipRequest {
                        method: Method::parse(method),
                        uri: uri.to_string(),
                        headers,
                        body: body.to_string(),
                    }))
                }
                _ => Err(SignalingError::Protocol(format!(
                    "bad request line: {}",
                    start
                ))),
            }
        }
    }
}

fn write_message(
    f: &mut fmt::Formatter<'_>,
    start: fmt::Arguments<'_>,
    headers: &Headers,
    body: &str,
) -> fmt::Result {
    write!(f, "{}\r\n", start)?;
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        write!(f, "{}: {}\r\n", name, value)?;
    }
    write!(f, "Content-Length: {}\r\n\r\n{}", body.len(), body)
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_message(
            f,
            format_args!("{} {} SIP/2.0", self.method, self.uri),
            &self.headers,
            &self.body,
        )
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_message(
            f,
            format_args!("SIP/2.0 {} {}", self.status, self.reason),
            &self.headers,
            &self.body,
        )
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Liest einen `;name=value` Parameter aus einem Header-Wert
pub fn param<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').skip(1).find_map(|p| {
        let (key, value) = p.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

/// Extrahiert den URI aus einem Name-Addr Header (`"Bob" <sip:bob@x>;tag=1`)
pub fn addr_uri(header: &str) -> &str {
    match (header.find('<'), header.find('>')) {
        (Some(start), Some(end)) if start < end => &header[start + 1..end],
        _ => header.split(';').next().unwrap_or(header).trim(),
    }
}

// ============================================================================
// DIGEST AUTH
// ============================================================================

/// Challenge aus `WWW-Authenticate` / `Proxy-Authenticate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop_auth: bool,
}

impl DigestChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header.trim().strip_prefix("Digest")?;
        let realm = auth_param(rest, "realm")?;
        let nonce = auth_param(rest, "nonce")?;
        let qop_auth = auth_param(rest, "qop")
            .map(|qop| qop.split(',').any(|q| q.trim() == "auth"))
            .unwrap_or(false);

        Some(Self {
            realm,
            nonce,
            opaque: auth_param(rest, "opaque"),
            qop_auth,
        })
    }

    /// Baut den `Authorization` Header-Wert (RFC 2617, MD5)
    pub fn authorization(
        &self,
        method: &Method,
        uri: &str,
        username: &str,
        password: &str,
        cnonce: &str,
    ) -> String {
        let ha1 = md5_hex(&format!("{}:{}:{}", username, self.realm, password));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));

        let mut value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm=MD5",
            username, self.realm, self.nonce, uri
        );

        let response = if self.qop_auth {
            let nc = "00000001";
            value.push_str(&format!(", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce));
            md5_hex(&format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, self.nonce, nc, cnonce, ha2
            ))
        } else {
            md5_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2))
        };
        value.push_str(&format!(", response=\"{}\"", response));

        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        value
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input))
}

/// Parameter aus einer Auth-Header Liste, mit oder ohne Anführungszeichen
fn auth_param(header: &str, name: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (key, value) = part.split_once('=')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_with_compact_headers() {
        let raw = "SIP/2.0 180 Ringing\r\n\
                   v: SIP/2.0/WSS client.invalid;branch=z9hG4bK-abc\r\n\
                   i: call-1\r\n\
                   t: <sip:bob@example.com>;tag=xyz\r\n\
                   CSeq: 1 INVITE\r\n\
                   l: 0\r\n\r\n";
        let msg = SipMessage::parse(raw).unwrap();

        assert_eq!(msg.call_id(), Some("call-1"));
        assert_eq!(msg.branch(), Some("z9hG4bK-abc"));
        let SipMessage::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.status, 180);
        assert!(resp.is_provisional());
        assert_eq!(param(resp.headers.get("To").unwrap(), "tag"), Some("xyz"));
    }

    #[test]
    fn test_request_serializes_content_length() {
        let req = SipRequest::new(Method::Invite, "sip:bob@example.com")
            .header("Call-ID", "c1")
            .with_body("application/sdp", "v=0\r\n".to_string());
        let text = req.to_string();

        assert!(text.starts_with("INVITE sip:bob@example.com SIP/2.0\r\n"));
        assert!(text.contains("Content-Length: 5\r\n\r\nv=0\r\n"));

        let SipMessage::Request(parsed) = SipMessage::parse(&text).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(parsed.method, Method::Invite);
        assert_eq!(parsed.body, "v=0\r\n");
    }

    #[test]
    fn test_response_copies_dialog_headers() {
        let bye = SipRequest::new(Method::Bye, "sip:alice@client.invalid")
            .header("Via", "SIP/2.0/WSS proxy;branch=z9hG4bK-1")
            .header("From", "<sip:bob@example.com>;tag=b")
            .header("To", "<sip:alice@example.com>;tag=a")
            .header("Call-ID", "c1")
            .header("CSeq", "2 BYE")
            .header("Max-Forwards", "70");
        let ok = bye.response(200, "OK");

        assert_eq!(ok.headers.get("CSeq"), Some("2 BYE"));
        assert!(ok.headers.get("Max-Forwards").is_none());
    }

    #[test]
    fn test_digest_rfc2617_example() {
        // Beispielwerte aus RFC 2617 Abschnitt 3.5
        let challenge = DigestChallenge::parse(
            "Digest realm=\"testrealm@host.com\", qop=\"auth,auth-int\", \
             nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", \
             opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"",
        )
        .unwrap();
        assert!(challenge.qop_auth);

        let header = challenge.authorization(
            &Method::Other("GET".into()),
            "/dir/index.html",
            "Mufasa",
            "Circle Of Life",
            "0a4f113b",
        );
        assert!(header.contains("response=\"6629fae49393a05397450978507c4ef1\""));
        assert!(header.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
    }

    #[test]
    fn test_addr_uri() {
        assert_eq!(
            addr_uri("\"Bob\" <sip:bob@example.com>;tag=1"),
            "sip:bob@example.com"
        );
        assert_eq!(addr_uri("sip:bob@example.com;tag=1"), "sip:bob@example.com");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SipMessage::parse("").is_err());
        assert!(SipMessage::parse("HELLO\r\n\r\n").is_err());
    }
}
