//! Canned test data for relay tests.

use serde_json::{json, Value};
use std::collections::HashMap;

/// Minimal browser SDP offer.
pub const TEST_SDP_OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=recvonly\r\n\
a=mid:0\r\n\
a=rtpmap:96 H264/90000\r\n";

/// SDP answer returned by `MockEngine` unless overridden.
pub const TEST_SDP_ANSWER: &str = "v=0\r\n\
o=- 3883943731 3883943731 IN IP4 127.0.0.1\r\n\
s=Kurento Media Server\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=sendonly\r\n\
a=mid:0\r\n";

/// RTSP origin used by tests.
pub const TEST_RTSP_URL: &str = "rtsp://camera.test:554/stream1";

/// ICE candidate in the client wire format, distinct per `n`.
#[must_use]
pub fn ice_candidate(n: u32) -> Value {
    json!({
        "candidate": format!("candidate:{n} 1 UDP 2122252543 192.168.1.{n} {} typ host", 50000 + n),
        "sdpMid": "0",
        "sdpMLineIndex": 0,
    })
}

/// Relay environment pointing at `engine_url`, with local ephemeral binds
/// and short engine timeouts.
#[must_use]
pub fn relay_env(engine_url: &str) -> HashMap<String, String> {
    [
        ("RTSP_URL", TEST_RTSP_URL),
        ("KURENTO_WS_URL", engine_url),
        ("RELAY_SIGNALING_BIND_ADDRESS", "127.0.0.1:0"),
        ("RELAY_SIGNALING_PATH", "/kurento"),
        ("RELAY_HEALTH_BIND_ADDRESS", "127.0.0.1:0"),
        ("ENGINE_CONNECT_TIMEOUT_SECONDS", "2"),
        ("ENGINE_CONNECT_RETRIES", "2"),
        ("ENGINE_CONNECT_RETRY_DELAY_MS", "50"),
        ("ENGINE_REQUEST_TIMEOUT_SECONDS", "2"),
        ("ENGINE_RECONNECT_INTERVAL_SECONDS", "1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
