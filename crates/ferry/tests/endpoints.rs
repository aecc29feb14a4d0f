use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use url::Url;

use ferry_engine::source::{ByteRange, SegmentDescriptor, create_client};
use ferry_engine::upload::DuplexConnector;
use ferry_engine::{
    Authenticator, Credential, CredentialPlacement, FerryError, HttpAuthenticator, HttpConfig,
    HttpSegmentSource, SegmentSource, UploadConfig, WsConnector,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A request as the loopback origin received it.
#[derive(Debug)]
struct Recorded {
    request_line: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Recorded {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn target(&self) -> &str {
        self.request_line.split(' ').nth(1).unwrap_or_default()
    }
}

async fn read_request(tcp: &mut TcpStream) -> Option<Recorded> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = tcp.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&raw[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?.to_owned();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_owned(), v.trim().to_owned()))
        .collect();

    let length: usize = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);
    let mut body = raw[head_end + 4..].to_vec();
    while body.len() < length {
        let n = tcp.read(&mut buf).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }

    Some(Recorded {
        request_line,
        headers,
        body,
    })
}

/// Loopback HTTP origin answering every request with `status` and `body`.
async fn start_origin(
    status: &'static str,
    body: &'static str,
) -> (Url, mpsc::UnboundedReceiver<Recorded>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut tcp, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let Some(request) = read_request(&mut tcp).await else {
                    return;
                };
                let _ = tx.send(request);
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = tcp.write_all(response.as_bytes()).await;
                let _ = tcp.shutdown().await;
            });
        }
    });

    (Url::parse(&format!("http://{addr}/")).unwrap(), rx)
}

fn segment(base: &Url, name: &str, byte_range: Option<ByteRange>) -> SegmentDescriptor {
    let uri = base.join(name).unwrap();
    SegmentDescriptor {
        identity: uri.to_string(),
        uri,
        duration: Duration::from_secs(2),
        byte_range,
    }
}

#[tokio::test]
async fn ranged_segment_sends_range_header() {
    init_tracing();
    let (base, mut requests) = start_origin("206 Partial Content", "0123456789").await;
    let source = HttpSegmentSource::new(&HttpConfig::default()).unwrap();

    let range = ByteRange {
        length: 500,
        offset: 1000,
    };
    let bytes = source
        .fetch_segment(&segment(&base, "media.ts", Some(range)))
        .await
        .unwrap();

    assert_eq!(&bytes[..], b"0123456789");
    let request = requests.recv().await.unwrap();
    assert_eq!(request.header("range"), Some("bytes=1000-1499"));
}

#[tokio::test]
async fn configured_params_and_headers_reach_the_origin() {
    init_tracing();
    let (base, mut requests) = start_origin("200 OK", "#EXTM3U\n").await;
    let config = HttpConfig::default()
        .with_header("X-Session", "abc123")
        .with_param("sig", "s1");
    let source = HttpSegmentSource::new(&config).unwrap();

    let manifest = base.join("live/index.m3u8").unwrap();
    source.fetch_manifest(&manifest).await.unwrap();
    source
        .fetch_segment(&segment(&base, "live/a.ts", None))
        .await
        .unwrap();

    let manifest_request = requests.recv().await.unwrap();
    assert_eq!(manifest_request.target(), "/live/index.m3u8?sig=s1");
    assert_eq!(manifest_request.header("x-session"), Some("abc123"));

    let segment_request = requests.recv().await.unwrap();
    assert_eq!(segment_request.target(), "/live/a.ts?sig=s1");
    assert_eq!(segment_request.header("range"), None);
}

#[tokio::test]
async fn segment_error_status_is_reported() {
    init_tracing();
    let (base, _requests) = start_origin("404 Not Found", "").await;
    let source = HttpSegmentSource::new(&HttpConfig::default()).unwrap();

    let err = source
        .fetch_segment(&segment(&base, "gone.ts", None))
        .await
        .unwrap_err();

    match err {
        FerryError::HttpStatus { status, .. } => assert_eq!(status.as_u16(), 404),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn login_returns_the_issued_token() {
    init_tracing();
    let (base, mut requests) = start_origin("200 OK", r#"{"token":"fresh-token"}"#).await;
    let client = create_client(&HttpConfig::default()).unwrap();
    let authenticator =
        HttpAuthenticator::new(client, base.join("login").unwrap(), "alice", "hunter2");

    let credential = authenticator.authenticate().await.unwrap();

    assert_eq!(credential.secret(), "fresh-token");
    let request = requests.recv().await.unwrap();
    assert!(request.request_line.starts_with("POST /login "));
    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["username"], "alice");
    assert_eq!(body["password"], "hunter2");
}

#[tokio::test]
async fn rejected_login_is_unauthorized() {
    init_tracing();
    let (base, _requests) = start_origin("401 Unauthorized", "{}").await;
    let client = create_client(&HttpConfig::default()).unwrap();
    let authenticator = HttpAuthenticator::new(client, base.join("login").unwrap(), "alice", "wrong");

    let err = authenticator.authenticate().await.unwrap_err();

    assert!(matches!(err, FerryError::Unauthorized { .. }), "{err:?}");
}

#[tokio::test]
async fn empty_login_token_is_a_protocol_error() {
    init_tracing();
    let (base, _requests) = start_origin("200 OK", r#"{"token":""}"#).await;
    let client = create_client(&HttpConfig::default()).unwrap();
    let authenticator = HttpAuthenticator::new(client, base.join("login").unwrap(), "alice", "pw");

    let err = authenticator.authenticate().await.unwrap_err();

    assert!(matches!(err, FerryError::Protocol { stage: "login", .. }), "{err:?}");
}

/// What the WebSocket endpoint saw during the opening handshake.
#[derive(Debug)]
struct Handshake {
    query: Option<String>,
    authorization: Option<String>,
}

async fn start_ws_endpoint() -> (Url, mpsc::UnboundedReceiver<Handshake>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let callback = |request: &Request, response: Response| {
                    let _ = tx.send(Handshake {
                        query: request.uri().query().map(str::to_owned),
                        authorization: request
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_owned),
                    });
                    Ok::<_, ErrorResponse>(response)
                };
                let _ = accept_hdr_async(tcp, callback).await;
            });
        }
    });

    (Url::parse(&format!("ws://{addr}/upload")).unwrap(), rx)
}

#[tokio::test]
async fn credential_travels_as_query_parameter() {
    init_tracing();
    let (endpoint, mut handshakes) = start_ws_endpoint().await;
    let config = UploadConfig {
        credential_placement: CredentialPlacement::QueryParameter("access_token".to_owned()),
        ..UploadConfig::default()
    };
    let connector = WsConnector::new(endpoint, &config).unwrap();

    let _stream = connector
        .connect(&Credential::new("s3cret&x"))
        .await
        .unwrap();

    let handshake = handshakes.recv().await.unwrap();
    assert_eq!(handshake.query.as_deref(), Some("access_token=s3cret%26x"));
    assert_eq!(handshake.authorization, None);
}

#[tokio::test]
async fn credential_travels_as_bearer_header() {
    init_tracing();
    let (endpoint, mut handshakes) = start_ws_endpoint().await;
    let config = UploadConfig {
        credential_placement: CredentialPlacement::BearerHeader,
        ..UploadConfig::default()
    };
    let connector = WsConnector::new(endpoint, &config).unwrap();

    let _stream = connector.connect(&Credential::new("s3cret")).await.unwrap();

    let handshake = handshakes.recv().await.unwrap();
    assert_eq!(handshake.authorization.as_deref(), Some("Bearer s3cret"));
    assert_eq!(handshake.query, None);
}

#[test]
fn http_endpoint_is_rejected() {
    let endpoint = Url::parse("http://upload.example.com/").unwrap();

    let err = WsConnector::new(endpoint, &UploadConfig::default()).unwrap_err();

    assert!(matches!(err, FerryError::InvalidUrl { .. }), "{err:?}");
}
