//! Minimal RTSP client driven over an already-established proxy tunnel.
//!
//! OPTIONS -> DESCRIBE -> SETUP (interleaved TCP) -> PLAY, CSeq-tracked.
//! A target only counts as working when its SDP advertises at least one
//! recognized video codec; an RTSP server with nothing playable is as
//! useless as a dead proxy.

use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

use super::ProbeOutcome;

const VIDEO_CODECS: [&str; 5] = ["H264", "H265", "VP8", "VP9", "MP2T"];
/// Static RTP payload type for MPEG transport streams.
const PT_MP2T: &str = "33";

pub(crate) async fn probe<S>(stream: S, url: &str, t: Duration) -> ProbeOutcome
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = RtspSession {
        stream,
        cseq: 0,
        session: None,
    };

    let options = match session.request("OPTIONS", url, &[], t).await {
        Ok(response) => response,
        Err(e) => return ProbeOutcome::fail(format!("RTSP handshake failed: {}", e)),
    };
    if options.code / 100 != 2 {
        return ProbeOutcome::fail(format!("RTSP handshake failed: status {}", options.code));
    }

    let describe = match session
        .request("DESCRIBE", url, &[("Accept", "application/sdp")], t)
        .await
    {
        Ok(response) => response,
        Err(e) => return ProbeOutcome::fail(format!("RTSP DESCRIBE failed: {}", e)),
    };
    if describe.code != 200 {
        return ProbeOutcome::fail(format!("RTSP DESCRIBE failed: status {}", describe.code));
    }

    let sdp = String::from_utf8_lossy(&describe.body).into_owned();
    let medias = parse_sdp(&sdp);
    if !has_supported_video(&medias) {
        return ProbeOutcome::fail("no supported video stream (H264/H265/VP8/VP9/MPEGTS)");
    }

    let base_url = describe
        .header("content-base")
        .map(str::to_string)
        .unwrap_or_else(|| url.to_string());

    let mut channel = 0u8;
    for media in &medias {
        let setup_url = setup_url(&base_url, media.control.as_deref());
        let transport = format!(
            "RTP/AVP/TCP;unicast;interleaved={}-{}",
            channel,
            channel + 1
        );
        let response = match session
            .request("SETUP", &setup_url, &[("Transport", &transport)], t)
            .await
        {
            Ok(response) => response,
            Err(e) => return ProbeOutcome::fail(format!("SETUP failed: {}", e)),
        };
        if response.code / 100 != 2 {
            return ProbeOutcome::fail(format!("SETUP failed: status {}", response.code));
        }
        if session.session.is_none() {
            if let Some(id) = response.header("session") {
                let id = id.split(';').next().unwrap_or(id).trim().to_string();
                session.session = Some(id);
            }
        }
        channel = channel.wrapping_add(2);
    }

    let play = match session.request("PLAY", &base_url, &[], t).await {
        Ok(response) => response,
        Err(e) => return ProbeOutcome::fail(format!("PLAY failed: {}", e)),
    };
    if play.code / 100 != 2 {
        return ProbeOutcome::fail(format!("PLAY failed: status {}", play.code));
    }

    ProbeOutcome::ok("RTSP stream playable")
}

struct RtspSession<S> {
    stream: S,
    cseq: u32,
    session: Option<String>,
}

struct RtspResponse {
    code: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RtspResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl<S> RtspSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn request(
        &mut self,
        method: &str,
        url: &str,
        extra_headers: &[(&str, &str)],
        t: Duration,
    ) -> anyhow::Result<RtspResponse> {
        self.cseq += 1;
        let mut request = format!("{} {} RTSP/1.0\r\nCSeq: {}\r\n", method, url, self.cseq);
        if let Some(id) = &self.session {
            request.push_str(&format!("Session: {}\r\n", id));
        }
        for (name, value) in extra_headers {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
        request.push_str("User-Agent: relayscan\r\n\r\n");

        match timeout(t, self.stream.write_all(request.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => anyhow::bail!("timed out sending {}", method),
        }

        let head_buf = super::read_head(&mut self.stream, t).await?;
        let (code, headers, body_offset) = parse_rtsp_head(&head_buf)?;

        let mut body = head_buf[body_offset..].to_vec();
        if let Some(length) = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        {
            if body.len() > length {
                body.truncate(length);
            } else if body.len() < length {
                let mut rest = vec![0u8; length - body.len()];
                match timeout(t, self.stream.read_exact(&mut rest)).await {
                    Ok(Ok(_)) => body.extend_from_slice(&rest),
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => anyhow::bail!("timed out reading {} body", method),
                }
            }
        }
        Ok(RtspResponse {
            code,
            headers,
            body,
        })
    }
}

fn parse_rtsp_head(buf: &[u8]) -> anyhow::Result<(u16, Vec<(String, String)>, usize)> {
    let end = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow::anyhow!("incomplete RTSP response head"))?;
    let head = std::str::from_utf8(&buf[..end])?;
    let mut lines = head.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty RTSP response"))?;
    let mut parts = status_line.split_whitespace();
    let proto = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("malformed status line"))?;
    if !proto.starts_with("RTSP/") {
        anyhow::bail!("not an RTSP response: {}", status_line);
    }
    let code = parts
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("malformed status line: {}", status_line))?;

    let headers = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect();
    Ok((code, headers, end + 4))
}

#[derive(Debug, Default)]
struct SdpMedia {
    control: Option<String>,
    codecs: Vec<String>,
    payload_types: Vec<String>,
}

fn parse_sdp(sdp: &str) -> Vec<SdpMedia> {
    let mut medias: Vec<SdpMedia> = Vec::new();
    for line in sdp.lines() {
        let line = line.trim_end();
        if let Some(desc) = line.strip_prefix("m=") {
            let mut media = SdpMedia::default();
            // m=<type> <port> <proto> <payload types...>
            media.payload_types = desc.split_whitespace().skip(3).map(str::to_string).collect();
            medias.push(media);
        } else if let Some(media) = medias.last_mut() {
            if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
                if let Some(name) = rtpmap.split_whitespace().nth(1) {
                    let codec = name.split('/').next().unwrap_or(name);
                    media.codecs.push(codec.to_uppercase());
                }
            } else if let Some(control) = line.strip_prefix("a=control:") {
                media.control = Some(control.trim().to_string());
            }
        }
    }
    medias
}

fn has_supported_video(medias: &[SdpMedia]) -> bool {
    medias.iter().any(|media| {
        media
            .codecs
            .iter()
            .any(|codec| VIDEO_CODECS.contains(&codec.as_str()))
            || media.payload_types.iter().any(|pt| pt == PT_MP2T)
    })
}

fn setup_url(base: &str, control: Option<&str>) -> String {
    match control {
        None | Some("*") => base.to_string(),
        Some(control) if control.starts_with("rtsp://") => control.to_string(),
        Some(control) => format!("{}/{}", base.trim_end_matches('/'), control),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_head_and_headers() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: 4\r\n\r\nv=0\n";
        let (code, headers, offset) = parse_rtsp_head(raw).unwrap();
        assert_eq!(code, 200);
        assert_eq!(
            headers
                .iter()
                .find(|(k, _)| k == "Content-Length")
                .map(|(_, v)| v.as_str()),
            Some("4")
        );
        assert_eq!(&raw[offset..], b"v=0\n");
    }

    #[test]
    fn rejects_http_head() {
        assert!(parse_rtsp_head(b"HTTP/1.1 200 OK\r\n\r\n").is_err());
    }

    #[test]
    fn detects_h264_video() {
        let sdp = "v=0\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:trackID=0\r\nm=audio 0 RTP/AVP 97\r\na=rtpmap:97 mpeg4-generic/44100\r\n";
        let medias = parse_sdp(sdp);
        assert_eq!(medias.len(), 2);
        assert!(has_supported_video(&medias));
        assert_eq!(medias[0].control.as_deref(), Some("trackID=0"));
    }

    #[test]
    fn audio_only_is_unsupported() {
        let sdp = "m=audio 0 RTP/AVP 97\r\na=rtpmap:97 MPEG4-GENERIC/44100\r\n";
        assert!(!has_supported_video(&parse_sdp(sdp)));
    }

    #[test]
    fn static_payload_33_counts_as_mpegts() {
        let sdp = "m=video 0 RTP/AVP 33\r\n";
        assert!(has_supported_video(&parse_sdp(sdp)));
    }

    #[test]
    fn setup_url_resolution() {
        assert_eq!(
            setup_url("rtsp://cam/stream", Some("trackID=1")),
            "rtsp://cam/stream/trackID=1"
        );
        assert_eq!(
            setup_url("rtsp://cam/stream", Some("rtsp://cam/stream/video")),
            "rtsp://cam/stream/video"
        );
        assert_eq!(setup_url("rtsp://cam/stream", Some("*")), "rtsp://cam/stream");
        assert_eq!(setup_url("rtsp://cam/stream", None), "rtsp://cam/stream");
    }
}
