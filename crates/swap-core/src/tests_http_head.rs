use super::{
    parse_http_request_head, parse_http_response_head, HttpBodyMode, HttpHeadError, HttpVersion,
};

#[test]
fn request_head_keeps_raw_bytes_and_header_case() {
    let raw = b"POST /graphql/v2?op=GetUpdatedCloudObjects HTTP/1.1\r\nHost: app.warp.dev\r\nAuthorization: Bearer tok\r\nContent-Length: 12\r\n\r\n";
    let head = parse_http_request_head(raw).expect("request head should parse");
    assert_eq!(head.raw, raw.to_vec());
    assert_eq!(head.method, "POST");
    assert_eq!(head.version, HttpVersion::Http11);
    assert_eq!(head.headers[1].name, "Authorization");
    assert_eq!(head.header("authorization"), Some("Bearer tok"));
    assert_eq!(head.body_mode, HttpBodyMode::ContentLength(12));
    assert_eq!(head.path(), "/graphql/v2?op=GetUpdatedCloudObjects");
    assert!(!head.connection_close);
}

#[test]
fn absolute_form_target_reports_origin_path() {
    let raw = b"GET https://app.warp.dev/ai/multi-agent HTTP/1.1\r\nHost: app.warp.dev\r\n\r\n";
    let head = parse_http_request_head(raw).expect("request head should parse");
    assert_eq!(head.path(), "/ai/multi-agent");
}

#[test]
fn set_header_replaces_first_and_drops_duplicates() {
    let raw = b"GET / HTTP/1.1\r\nAuthorization: Bearer a\r\nX-Other: 1\r\nauthorization: Bearer b\r\n\r\n";
    let mut head = parse_http_request_head(raw).expect("request head should parse");
    head.set_header("Authorization", "Bearer c");
    assert_eq!(
        head.encode(),
        b"GET / HTTP/1.1\r\nAuthorization: Bearer c\r\nX-Other: 1\r\n\r\n".to_vec()
    );
    head.set_header("X-New", "2");
    assert_eq!(head.headers.last().map(|h| h.value.as_str()), Some("2"));
}

#[test]
fn http10_request_without_keep_alive_closes() {
    let head = parse_http_request_head(b"GET / HTTP/1.0\r\n\r\n").expect("parse");
    assert!(head.connection_close);
}

#[test]
fn rejects_folded_headers() {
    let raw = b"GET / HTTP/1.1\r\nX-A: one\r\n two\r\n\r\n";
    assert_eq!(
        parse_http_request_head(raw).expect_err("folded header must fail"),
        HttpHeadError::FoldedHeader
    );
}

#[test]
fn rejects_chunked_with_content_length() {
    let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 4\r\n\r\n";
    assert_eq!(
        parse_http_request_head(raw).expect_err("smuggling shape must fail"),
        HttpHeadError::ConflictingFraming
    );
}

#[test]
fn rejects_conflicting_content_lengths() {
    let raw = b"POST / HTTP/1.1\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\n";
    assert_eq!(
        parse_http_request_head(raw).expect_err("conflicting lengths must fail"),
        HttpHeadError::ConflictingContentLength
    );
}

#[test]
fn rejects_garbage_request_line() {
    let error = parse_http_request_head(b"\x16\x03\x01garbage\r\n\r\n").expect_err("must fail");
    assert!(matches!(
        error,
        HttpHeadError::InvalidRequestLine | HttpHeadError::InvalidUtf8
    ));
    assert_eq!(
        parse_http_request_head(b"GET / HTTP/2.0\r\n\r\n").expect_err("h2 version"),
        HttpHeadError::UnsupportedVersion
    );
}

#[test]
fn response_without_framing_is_close_delimited() {
    let head = parse_http_response_head(b"HTTP/1.1 200 OK\r\nServer: x\r\n\r\n", "GET")
        .expect("response head should parse");
    assert_eq!(head.body_mode, HttpBodyMode::CloseDelimited);
    assert!(head.connection_close);
}

#[test]
fn response_to_head_and_no_content_have_no_body() {
    let head = parse_http_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n", "HEAD")
        .expect("parse");
    assert_eq!(head.body_mode, HttpBodyMode::None);
    let head = parse_http_response_head(b"HTTP/1.1 204 No Content\r\n\r\n", "GET").expect("parse");
    assert_eq!(head.body_mode, HttpBodyMode::None);
    assert!(!head.connection_close);
}

#[test]
fn response_encode_rewrites_length() {
    let mut head = parse_http_response_head(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\n\r\n",
        "POST",
    )
    .expect("parse");
    assert_eq!(head.body_mode, HttpBodyMode::Chunked);
    head.remove_header("transfer-encoding");
    head.set_header("Content-Length", "2");
    assert_eq!(
        head.encode(),
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\n".to_vec()
    );
}
