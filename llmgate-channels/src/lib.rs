//! Protocol adapters for the upstreams a group can speak: request shaping,
//! weighted upstream selection, and key validation probes.

pub mod adapter;
pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod registry;

pub use adapter::{
    body_requests_stream, classify_validation_status, is_hop_by_hop, is_stream_request,
    join_upstream_url, pick_weighted_upstream, ChannelAdapter, ClientPair, UpstreamRequest,
    HOP_BY_HOP_HEADERS,
};
pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;
pub use registry::AdapterRegistry;

#[cfg(test)]
mod tests {
    use llmgate_types::Upstream;

    use super::adapter::*;

    #[test]
    fn weighted_pick_is_biased_by_weight() {
        let upstreams = vec![
            Upstream { url: "https://a".into(), weight: 1 },
            Upstream { url: "https://b".into(), weight: 99 },
        ];
        let mut b_count = 0;
        for _ in 0..200 {
            let picked = pick_weighted_upstream(&upstreams).unwrap();
            if picked.url == "https://b" {
                b_count += 1;
            }
        }
        assert!(b_count > 150, "expected heavy bias toward the high-weight upstream, got {b_count}/200");
    }

    #[test]
    fn weighted_pick_rejects_empty_upstreams() {
        let upstreams: Vec<Upstream> = Vec::new();
        assert!(pick_weighted_upstream(&upstreams).is_err());
    }

    #[test]
    fn join_upstream_url_avoids_double_slash() {
        let url = join_upstream_url("https://api.example.com/", "/v1/chat", Some("a=1"));
        assert_eq!(url, "https://api.example.com/v1/chat?a=1");
    }

    #[test]
    fn join_upstream_url_handles_empty_tail() {
        let url = join_upstream_url("https://api.example.com", "", None);
        assert_eq!(url, "https://api.example.com");
    }

    #[test]
    fn stream_detection_catches_body_flag_with_whitespace() {
        let body = br#"{"model": "gpt-4", "stream" :  true}"#;
        assert!(body_requests_stream(body));
    }

    #[test]
    fn stream_detection_false_for_ordinary_body() {
        let body = br#"{"model": "gpt-4", "stream": false}"#;
        assert!(!body_requests_stream(body));
    }

    #[test]
    fn stream_detection_via_accept_header() {
        assert!(is_stream_request(b"{}", Some("text/event-stream"), None));
    }

    #[test]
    fn stream_detection_via_query_param() {
        assert!(is_stream_request(b"{}", None, Some("model=gpt-4&stream=true")));
    }

    #[test]
    fn hop_by_hop_is_case_insensitive() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(!is_hop_by_hop("Content-Type"));
    }

    #[test]
    fn validation_status_classifies_success() {
        assert_eq!(classify_validation_status(reqwest::StatusCode::OK).unwrap(), true);
    }

    #[test]
    fn validation_status_classifies_definite_failure() {
        assert_eq!(classify_validation_status(reqwest::StatusCode::UNAUTHORIZED).unwrap(), false);
    }

    #[test]
    fn validation_status_classifies_transient() {
        assert!(classify_validation_status(reqwest::StatusCode::TOO_MANY_REQUESTS).is_err());
        assert!(classify_validation_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR).is_err());
    }
}
