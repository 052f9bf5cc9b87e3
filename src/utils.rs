use nostr_sdk::prelude::*;

/// Checks whether a string is a valid hex encoded 32-byte Nostr public key.
pub fn is_valid_hex_pubkey(pubkey: &str) -> bool {
    pubkey.len() == 64
        && pubkey.chars().all(|c| c.is_ascii_hexdigit())
        && PublicKey::from_hex(pubkey).is_ok()
}

/// Checks whether a string parses as a websocket relay URL (`ws://` or `wss://`).
pub fn is_valid_relay_url(url: &str) -> bool {
    match RelayUrl::parse(url) {
        Ok(parsed) => {
            let s = parsed.to_string();
            s.starts_with("ws://") || s.starts_with("wss://")
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_hex_pubkey() {
        assert!(is_valid_hex_pubkey(
            "aa4fc8665f5696e33db7e1a572e3b0f5b3d615837b0f362dcb1c8068b098c7b4"
        ));
        assert!(!is_valid_hex_pubkey("not-a-key"));
        assert!(!is_valid_hex_pubkey("abcd"));
        // npub form is not hex
        assert!(!is_valid_hex_pubkey(
            "npub1drvpzev3syqt0kjrls50050uzf25gehpz9vgdw08hvex7e0vgfeq0eseet"
        ));
    }

    #[test]
    fn test_is_valid_relay_url() {
        assert!(is_valid_relay_url("wss://relay.damus.io"));
        assert!(is_valid_relay_url("ws://localhost:8080"));
        assert!(!is_valid_relay_url("https://example.com"));
        assert!(!is_valid_relay_url("not a url"));
    }
}
