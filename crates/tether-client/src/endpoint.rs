use url::Url;

/// Normalize user input into the server's WebSocket endpoint.
///
/// `https://host/` becomes `wss://host/ws`, `host:3000` becomes
/// `ws://host:3000/ws`, and an existing `/ws` suffix is not doubled.
pub fn format_websocket_url(input: &str) -> String {
    let mut base = input.trim();
    base = base.strip_suffix('/').unwrap_or(base);
    base = base.strip_suffix("/ws").unwrap_or(base);
    base = base.strip_suffix('/').unwrap_or(base);

    let with_scheme = if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base}")
    };
    format!("{with_scheme}/ws")
}

/// Whether `input` formats to a `ws`/`wss` URL with a host.
pub fn is_valid_websocket_url(input: &str) -> bool {
    if input.trim().is_empty() {
        return false;
    }
    match Url::parse(&format_websocket_url(input)) {
        Ok(url) => {
            matches!(url.scheme(), "ws" | "wss") && url.host_str().is_some_and(|h| !h.is_empty())
        }
        Err(_) => false,
    }
}
