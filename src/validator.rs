//! Classifies completed HTTP(S) responses as proof of a working proxy.

use crate::probe::ProbeOutcome;

const STATUS_OK: u16 = 200;
const STATUS_FOUND: u16 = 302;

/// Classifies a finished response.
///
/// `raw` short-circuits everything and hands the body back verbatim on
/// 200/302; it is used by the egress-IP discovery probes. Otherwise success
/// needs an acceptable status and, when `validate_content` is set, a body
/// that passes the playlist heuristics.
pub fn check_response(status: u16, body: &[u8], validate_content: bool, raw: bool) -> ProbeOutcome {
    if raw {
        if status == STATUS_OK || status == STATUS_FOUND {
            return ProbeOutcome::ok(String::from_utf8_lossy(body).into_owned());
        }
        return ProbeOutcome::fail(format!("status not 200/302: {}", status));
    }

    let content = String::from_utf8_lossy(body);
    let content_ok = !validate_content || is_playable_playlist(&content);
    let detail = format!(
        "status {}, content {}",
        status,
        if content_ok { "matched" } else { "mismatched" }
    );
    if (status == STATUS_OK || status == STATUS_FOUND) && content_ok {
        ProbeOutcome::ok(detail)
    } else {
        ProbeOutcome::fail(detail)
    }
}

/// Structural judgment of whether a body looks like a servable media
/// playlist. The not-playable skeleton rules run first and win: a master
/// playlist that references variants without independent segments, points at
/// a default vhost, or carries absolute http:// entries is a dead giveaway
/// for a stub server.
pub fn is_playable_playlist(content: &str) -> bool {
    let has_version = content.contains("EXT-X-VERSION");
    let has_stream_inf = content.contains("EXT-X-STREAM-INF");
    let has_default_vhost = content.contains("_defaultVhost_");
    let has_independent = content.contains("EXT-X-INDEPENDENT-SEGMENTS");
    let has_extinf = content.contains("EXTINF");
    let has_http = content.contains("http://");
    let has_error_envelope = content.contains(r#""Ret":20102,"Reason":""#);

    if (has_version && has_stream_inf && !has_independent)
        || (has_stream_inf && has_default_vhost)
        || (has_stream_inf && has_http)
    {
        return false;
    }

    if (has_version && has_extinf)
        || has_stream_inf
        || has_error_envelope
        || (has_version && has_independent)
    {
        return true;
    }

    false
}

/// Media file targets are judged by status alone; their bodies are streams,
/// not playlists.
pub fn is_media_url(url: &str) -> bool {
    let url = url.to_lowercase();
    url.ends_with(".flv") || url.ends_with(".ts") || url.ends_with(".mp4")
}

/// A proxy answering a plain GET with a WebSocket upgrade is a disguised
/// endpoint, never a usable proxy.
pub fn is_disguised_upgrade(status: u16, upgrade_header: Option<&str>) -> bool {
    status == 101
        && upgrade_header
            .map(|v| v.to_lowercase().contains("websocket"))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_mode_returns_body_verbatim() {
        let outcome = check_response(200, b"1.2.3.4\n", true, true);
        assert!(outcome.ok);
        assert_eq!(outcome.detail, "1.2.3.4\n");

        let outcome = check_response(404, b"ignored", true, true);
        assert!(!outcome.ok);
        assert!(outcome.detail.contains("404"));
    }

    #[test]
    fn status_only_when_validation_disabled() {
        assert!(check_response(200, b"<html>junk</html>", false, false).ok);
        assert!(check_response(302, b"", false, false).ok);
        assert!(!check_response(500, b"", false, false).ok);
    }

    #[test]
    fn stream_inf_alone_is_playable() {
        assert!(is_playable_playlist(
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=128000\nlow/index.m3u8\n"
        ));
    }

    #[test]
    fn skeleton_master_playlist_is_not_playable() {
        // VERSION + STREAM-INF without INDEPENDENT-SEGMENTS: the structural
        // skeleton rule takes priority over the playable STREAM-INF rule.
        let body = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-STREAM-INF:BANDWIDTH=1\nv/index.m3u8\n";
        assert!(!is_playable_playlist(body));
        assert!(!check_response(200, body.as_bytes(), true, false).ok);
    }

    #[test]
    fn default_vhost_and_absolute_urls_are_not_playable() {
        assert!(!is_playable_playlist(
            "#EXT-X-STREAM-INF:BANDWIDTH=1\nhttp://live/_defaultVhost_/x.m3u8\n"
        ));
        assert!(!is_playable_playlist(
            "#EXT-X-STREAM-INF:BANDWIDTH=1\nhttp://other.host/x.m3u8\n"
        ));
    }

    #[test]
    fn media_playlists_and_error_envelopes_are_playable() {
        assert!(is_playable_playlist(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXTINF:10.0,\nseg0.ts\n"
        ));
        assert!(is_playable_playlist(
            "#EXT-X-VERSION:7\n#EXT-X-INDEPENDENT-SEGMENTS\n"
        ));
        assert!(is_playable_playlist(r#"{"Ret":20102,"Reason":"expired"}"#));
        assert!(!is_playable_playlist("plain text"));
    }

    #[test]
    fn media_suffixes() {
        assert!(is_media_url("http://x/y/video.MP4"));
        assert!(is_media_url("http://x/live.flv"));
        assert!(is_media_url("http://x/seg.ts"));
        assert!(!is_media_url("http://x/index.m3u8"));
    }

    #[test]
    fn websocket_upgrade_is_disguised() {
        assert!(is_disguised_upgrade(101, Some("Websocket")));
        assert!(!is_disguised_upgrade(101, None));
        assert!(!is_disguised_upgrade(200, Some("websocket")));
    }
}
