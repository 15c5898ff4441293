//! Socket endpoint construction.

use url::Url;

use crate::types::Error;

/// Derive the websocket endpoint for a (session, topic) pair.
///
/// The scheme mirrors the backend base URL (`http` → `ws`, `https` → `wss`)
/// and the bearer token travels as a query credential: the browser clients
/// this protocol was designed for cannot set custom handshake headers.
pub(crate) fn build_ws_url(
    base: &Url,
    session_id: &str,
    topic_id: &str,
    token: &str,
) -> Result<Url, Error> {
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(Error::InvalidBaseUrl(format!("unsupported scheme `{other}`")));
        }
    };
    let host = base
        .host_str()
        .ok_or_else(|| Error::InvalidBaseUrl("missing host".to_string()))?;
    let authority = match base.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let mut url = Url::parse(&format!(
        "{scheme}://{authority}/xyzen/ws/v1/chat/sessions/{session_id}/topics/{topic_id}"
    ))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("token", token);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_base_maps_to_wss() {
        let base = Url::parse("https://api.xyzen.dev").unwrap();
        let url = build_ws_url(&base, "sess-1", "topic-1", "tok").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://api.xyzen.dev/xyzen/ws/v1/chat/sessions/sess-1/topics/topic-1?token=tok"
        );
    }

    #[test]
    fn http_base_maps_to_ws_and_keeps_port() {
        let base = Url::parse("http://127.0.0.1:8000").unwrap();
        let url = build_ws_url(&base, "s", "t", "tok").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://127.0.0.1:8000/xyzen/ws/v1/chat/sessions/s/topics/t?token=tok"
        );
    }

    #[test]
    fn ws_schemes_pass_through() {
        let base = Url::parse("wss://api.xyzen.dev").unwrap();
        let url = build_ws_url(&base, "s", "t", "tok").unwrap();
        assert!(url.as_str().starts_with("wss://api.xyzen.dev/"));
    }

    #[test]
    fn token_is_query_encoded() {
        let base = Url::parse("https://api.xyzen.dev").unwrap();
        let url = build_ws_url(&base, "s", "t", "a b+c").unwrap();
        assert_eq!(url.query(), Some("token=a+b%2Bc"));
    }

    #[test]
    fn base_path_is_ignored() {
        // The websocket route is absolute; a base URL path does not prefix it.
        let base = Url::parse("https://api.xyzen.dev/app/v2").unwrap();
        let url = build_ws_url(&base, "s", "t", "tok").unwrap();
        assert_eq!(url.path(), "/xyzen/ws/v1/chat/sessions/s/topics/t");
    }

    #[test]
    fn unsupported_scheme_rejected() {
        let base = Url::parse("ftp://files.example.com").unwrap();
        let err = build_ws_url(&base, "s", "t", "tok");
        assert!(matches!(err, Err(Error::InvalidBaseUrl(_))));
    }
}
