//! VLESS subscription URL rendering.
//!
//! Grounded in `internal/node/app_sub.go::vlessSub.vlessURL`: each
//! configured subscription address becomes one `vless://` URL, carrying
//! the early-data path hint (`?ed=2560`) documented at
//! https://xtls.github.io/config/transports/websocket.html#websocketobject.

/// Render the `/wsv/{uid}` subscription URLs for every address in
/// `sub_addresses`. `security=tls` iff the address ends in `:443`.
pub fn vless_urls(uid: &str, sub_addresses: &[String]) -> Vec<String> {
    sub_addresses
        .iter()
        .map(|addr| vless_url(uid, addr))
        .collect()
}

/// Percent-encode the handful of characters the `path` query value can
/// contain (`/`, `?`, `=`); everything else in a VLESS subscription path is
/// already URL-safe (UUIDs and digits).
fn percent_encode_path(path: &str) -> String {
    path.chars()
        .map(|c| match c {
            '/' => "%2F".to_string(),
            '?' => "%3F".to_string(),
            '=' => "%3D".to_string(),
            other => other.to_string(),
        })
        .collect()
}

fn vless_url(uid: &str, addr_with_port: &str) -> String {
    let is_tls = addr_with_port.ends_with(":443");
    let path = format!("/wsv/{uid}?ed=2560");
    let encoded_path = percent_encode_path(&path);

    let mut query = format!(
        "encryption=none&allowInsecure=1&type=ws&path={}",
        encoded_path
    );
    if is_tls {
        query.push_str("&security=tls");
    } else {
        query.push_str("&security=none");
    }

    format!("vless://{uid}@{addr_with_port}?{query}#{addr_with_port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_selected_for_443() {
        let urls = vless_urls("u1", &["node.example.com:443".to_string()]);
        assert_eq!(urls.len(), 1);
        assert!(urls[0].contains("security=tls"));
        assert!(urls[0].starts_with("vless://u1@node.example.com:443?"));
    }

    #[test]
    fn plaintext_selected_for_non_443() {
        let urls = vless_urls("u1", &["node.example.com:80".to_string()]);
        assert!(urls[0].contains("security=none"));
    }
}
