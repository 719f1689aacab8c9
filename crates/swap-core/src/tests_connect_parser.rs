use super::{
    parse_connect_request_head, parse_connect_request_head_with_mode, parse_connect_request_line,
    parse_connect_request_line_with_mode, ConnectParseError, ConnectParseMode,
};

#[test]
fn parses_connect_line_for_vendor_host() {
    let parsed =
        parse_connect_request_line("CONNECT app.warp.dev:443 HTTP/1.1").expect("must parse");
    assert_eq!(parsed.host, "app.warp.dev");
    assert_eq!(parsed.port, 443);
    assert_eq!(parsed.authority(), "app.warp.dev:443");
}

#[test]
fn parses_bracketed_ipv6_authority() {
    let parsed =
        parse_connect_request_line("CONNECT [2001:db8::1]:8443 HTTP/1.1").expect("must parse");
    assert_eq!(parsed.host, "2001:db8::1");
    assert_eq!(parsed.port, 8443);
    assert_eq!(parsed.authority(), "[2001:db8::1]:8443");
}

#[test]
fn rejects_plain_get_request() {
    let error = parse_connect_request_line("GET / HTTP/1.1").expect_err("must fail");
    assert_eq!(error, ConnectParseError::MethodNotConnect);
    assert_eq!(error.code(), "method_not_connect");
}

#[test]
fn rejects_unbracketed_ipv6_in_strict_mode() {
    let error =
        parse_connect_request_line("CONNECT 2001:db8::1:443 HTTP/1.1").expect_err("must fail");
    assert_eq!(error, ConnectParseError::InvalidAuthority);
}

#[test]
fn rejects_port_zero_and_garbage_ports() {
    assert_eq!(
        parse_connect_request_line("CONNECT example.com:0 HTTP/1.1").expect_err("zero port"),
        ConnectParseError::InvalidPort
    );
    assert_eq!(
        parse_connect_request_line("CONNECT example.com:https HTTP/1.1").expect_err("named port"),
        ConnectParseError::InvalidPort
    );
}

#[test]
fn head_parser_reports_consumed_length() {
    let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n\x16\x03\x01";
    let (parsed, head_len) = parse_connect_request_head(raw).expect("must parse");
    assert_eq!(parsed.host, "example.com");
    assert_eq!(&raw[head_len..], b"\x16\x03\x01");
}

#[test]
fn head_parser_requires_blank_line() {
    let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n";
    assert_eq!(
        parse_connect_request_head(raw).expect_err("must fail"),
        ConnectParseError::IncompleteHeaders
    );
}

#[test]
fn strict_mode_requires_port() {
    assert_eq!(
        parse_connect_request_line("CONNECT example.com HTTP/1.1").expect_err("must fail"),
        ConnectParseError::MissingPort
    );
}

#[test]
fn lenient_mode_defaults_port_and_accepts_lowercase_method() {
    let parsed = parse_connect_request_line_with_mode(
        "connect app.warp.dev HTTP/1.1",
        ConnectParseMode::Lenient,
    )
    .expect("must parse in lenient mode");
    assert_eq!(parsed.host, "app.warp.dev");
    assert_eq!(parsed.port, 443);
}

#[test]
fn lenient_mode_strips_absolute_form() {
    let raw = b"CONNECT https://app.warp.dev:8443/graphql HTTP/1.1\r\n\r\n";
    let (parsed, head_len) =
        parse_connect_request_head_with_mode(raw, ConnectParseMode::Lenient).expect("must parse");
    assert_eq!(parsed.host, "app.warp.dev");
    assert_eq!(parsed.port, 8443);
    assert_eq!(head_len, raw.len());
}
