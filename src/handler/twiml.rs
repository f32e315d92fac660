//! Carrier control markup. The carrier consumes a small XML vocabulary as
//! the response body of its HTTP callbacks; only the three verbs this
//! service uses are built here.

const HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Answer to the incoming-call webhook: connect the call leg to our
/// bidirectional media socket.
pub fn connect_stream(stream_url: &str) -> String {
    format!(
        r#"{}<Response><Connect><Stream url="{}"/></Connect></Response>"#,
        HEADER,
        escape(stream_url)
    )
}

/// Answer to the transfer-complete webhook when a transfer is pending:
/// redirect this call leg to the target address.
pub fn redirect(target_address: &str) -> String {
    format!(
        r#"{}<Response><Dial>{}</Dial></Response>"#,
        HEADER,
        escape(target_address)
    )
}

/// Safe default when there is nothing left to do with the call leg.
pub fn hangup() -> String {
    format!(r#"{}<Response><Hangup/></Response>"#, HEADER)
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_stream_markup() {
        let xml = connect_stream("wss://pbx.example.com/media-stream/CA123");
        assert!(xml.starts_with(HEADER));
        assert!(xml.contains(r#"<Stream url="wss://pbx.example.com/media-stream/CA123"/>"#));
    }

    #[test]
    fn test_redirect_markup() {
        let xml = redirect("+390200000000");
        assert!(xml.contains("<Dial>+390200000000</Dial>"));
    }

    #[test]
    fn test_hangup_markup() {
        assert!(hangup().contains("<Hangup/>"));
    }

    #[test]
    fn test_escaping() {
        let xml = connect_stream("wss://host/path?a=1&b=\"2\"");
        assert!(xml.contains("a=1&amp;b=&quot;2&quot;"));
    }
}
