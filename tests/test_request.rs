use std::io::Read;

use nbhttp::http::parser::ParseError;
use nbhttp::http::request::{Method, RequestBuilder};

#[test]
fn test_request_header_retrieval() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .uri("/")
        .header("Host", "example.com")
        .header("Content-Type", "application/json")
        .build()
        .unwrap();

    assert_eq!(req.header("Host"), Some("example.com"));
    assert_eq!(req.header("content-type"), Some("application/json"));
    assert_eq!(req.header("Missing"), None);
}

#[test]
fn test_request_content_length_parsing() {
    let mut req = RequestBuilder::new()
        .method(Method::POST)
        .uri("/api")
        .body(b"0123456789".to_vec())
        .build()
        .unwrap();

    assert_eq!(req.content_length(), 10);
    let mut body = String::new();
    req.body().read_to_string(&mut body).unwrap();
    assert_eq!(body, "0123456789");
}

#[test]
fn test_request_content_length_missing() {
    let mut req = RequestBuilder::new().method(Method::GET).uri("/").build().unwrap();
    assert_eq!(req.content_length(), 0);
    assert!(req.body().to_vec().unwrap().is_empty());
}

#[test]
fn test_request_content_type_strips_parameters() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .uri("/")
        .header("Content-Type", "Text/HTML; charset=utf-8")
        .build()
        .unwrap();
    assert_eq!(req.content_type().as_deref(), Some("text/html"));
}

#[test]
fn test_request_keep_alive() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .uri("/")
        .header("Connection", "Keep-Alive")
        .build()
        .unwrap();
    assert!(req.keep_alive());

    let req = RequestBuilder::new().method(Method::GET).uri("/").build().unwrap();
    assert!(!req.keep_alive());
}

#[test]
fn test_request_cookies_and_params() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .uri("/find?q=a+b")
        .header("Cookie", "theme=dark; lang=en")
        .build()
        .unwrap();

    assert_eq!(req.cookie("theme"), Some("dark"));
    assert_eq!(req.cookie("lang"), Some("en"));
    assert_eq!(req.param("q"), Some("a b"));
    assert_eq!(req.path, "/find");
}

#[test]
fn test_request_url() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .uri("/a/b?x=1")
        .header("Host", "example.com:8080")
        .build()
        .unwrap();
    let url = req.url().unwrap();
    assert_eq!(url.as_str(), "http://example.com:8080/a/b?x=1");
    assert!(!req.is_secure());
    assert!(req.peer_addr().is_none());
}

#[test]
fn test_request_builder_requires_method_and_uri() {
    assert_eq!(
        RequestBuilder::new().uri("/").build().unwrap_err(),
        ParseError::BadRequest
    );
    assert_eq!(
        RequestBuilder::new().method(Method::GET).build().unwrap_err(),
        ParseError::BadRequest
    );
}

#[test]
fn test_method_parsing() {
    assert_eq!(Method::from_str("GET"), Some(Method::GET));
    assert_eq!(Method::from_str("delete"), Some(Method::DELETE));
    assert_eq!(Method::from_str("Patch"), Some(Method::PATCH));
    assert_eq!(Method::from_str("BREW"), None);
    assert!(Method::PUT.requires_body());
    assert!(!Method::GET.requires_body());
    assert_eq!(Method::OPTIONS.to_string(), "OPTIONS");
}
