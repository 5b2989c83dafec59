use std::cell::RefCell;
use std::rc::Rc;

use outpost::buffer::{BufferContext, PollFdHandler, SmartBuffer};
use outpost::http::request::{HttpRequest, Method};

fn test_request() -> HttpRequest {
    let handler = Rc::new(RefCell::new(PollFdHandler::new()));
    let ctx = BufferContext::new(std::env::temp_dir(), 1024 * 1024, handler);
    HttpRequest::new(SmartBuffer::new(&ctx))
}

#[test]
fn test_method_from_str() {
    let methods = [
        ("GET", Method::GET),
        ("POST", Method::POST),
        ("PUT", Method::PUT),
        ("DELETE", Method::DELETE),
        ("HEAD", Method::HEAD),
        ("PATCH", Method::PATCH),
        ("OPTIONS", Method::OPTIONS),
    ];
    for (name, method) in methods {
        assert_eq!(Method::from_str(name), Some(method));
        assert_eq!(method.as_str(), name);
    }

    assert_eq!(Method::from_str("BREW"), None);
    assert_eq!(Method::from_str("get"), None);
}

#[test]
fn test_header_lookup_uses_canonical_names() {
    let mut request = test_request();
    request
        .headers
        .insert("Content-Length".to_string(), "42".to_string());

    assert_eq!(request.header("Content-Length"), Some("42"));
    assert_eq!(request.header("content-length"), None);
    assert_eq!(request.content_length(), 42);
}

#[test]
fn test_content_length_defaults_to_zero() {
    let request = test_request();
    assert_eq!(request.content_length(), 0);
}

#[test]
fn test_keep_alive_semantics() {
    let mut request = test_request();
    // HTTP/1.1 default is keep-alive.
    assert!(request.keep_alive());

    request
        .headers
        .insert("Connection".to_string(), "close".to_string());
    assert!(!request.keep_alive());

    request
        .headers
        .insert("Connection".to_string(), "keep-alive".to_string());
    assert!(request.keep_alive());
}

#[test]
fn test_cookie_header_accessor() {
    let mut request = test_request();
    assert!(request.cookie_header().is_none());

    request
        .headers
        .insert("Cookie".to_string(), "sessionId=abc".to_string());
    assert_eq!(request.cookie_header(), Some("sessionId=abc"));
}
