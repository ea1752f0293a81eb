//! End-to-end tests for the HTTP and Ws transports against real servers.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use gqlx_client::apq::NOT_FOUND_CODE;
use gqlx_client::ws::{MessageType, OperationMessage};
use gqlx_client::{
    Client, HttpConfig, HttpTransport, PersistedQuery, Response, SplitTransport, Transport,
    WsConfig, WsTransport,
};
use gqlx_core::{
    Codec, Error, GraphQLError, JsonCodec, Operation, OperationPayload, OperationResult,
};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response as WsResponse};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

#[derive(Debug, Deserialize)]
struct Room {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RoomData {
    room: Room,
}

type Handler = Arc<dyn Fn(OperationPayload) -> OperationResult + Send + Sync>;

/// Serves POSTed operations with `handler` on a random local port.
async fn serve_http(handler: Handler) -> SocketAddr {
    serve_http_with(Arc::new(JsonCodec), handler).await
}

/// Like [`serve_http`], reading and writing bodies with `codec`.
async fn serve_http_with(codec: Arc<dyn Codec>, handler: Handler) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let handler = handler.clone();
            let codec = codec.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: hyper::Request<Incoming>| {
                    let handler = handler.clone();
                    let codec = codec.clone();
                    async move {
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        let operation = codec.decode_operation(&body).unwrap();
                        let result = handler(operation.payload());
                        let response = hyper::Response::builder()
                            .header("Content-Type", codec.content_type())
                            .body(Full::new(codec.encode_result(&result).unwrap()))
                            .unwrap();
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

const FRAME_MARKER: u8 = 0xFF;

/// JSON behind a leading byte that is never valid UTF-8.
struct FramedCodec;

impl FramedCodec {
    fn frame(json: &[u8]) -> Bytes {
        let mut framed = Vec::with_capacity(json.len() + 1);
        framed.push(FRAME_MARKER);
        framed.extend_from_slice(json);
        Bytes::from(framed)
    }

    fn unframe(bytes: &[u8]) -> gqlx_core::Result<&[u8]> {
        match bytes.split_first() {
            Some((&FRAME_MARKER, json)) => Ok(json),
            _ => Err(Error::deserialize("missing frame marker")),
        }
    }
}

impl Codec for FramedCodec {
    fn content_type(&self) -> &'static str {
        "application/x-framed-json"
    }

    fn encode_operation(&self, operation: &Operation) -> gqlx_core::Result<Bytes> {
        Ok(Self::frame(&JsonCodec.encode_operation(operation)?))
    }

    fn decode_operation(&self, bytes: &[u8]) -> gqlx_core::Result<Operation> {
        JsonCodec.decode_operation(Self::unframe(bytes)?)
    }

    fn encode_result(&self, result: &OperationResult) -> gqlx_core::Result<Bytes> {
        Ok(Self::frame(&JsonCodec.encode_result(result)?))
    }

    fn decode_result(&self, bytes: &[u8]) -> gqlx_core::Result<OperationResult> {
        JsonCodec.decode_result(Self::unframe(bytes)?)
    }
}

async fn accept_ws(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_hdr_async(stream, |_req: &Request, mut resp: WsResponse| {
        resp.headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("graphql-ws"));
        Ok::<_, ErrorResponse>(resp)
    })
    .await
    .unwrap()
}

async fn recv(ws: &mut WebSocketStream<TcpStream>) -> OperationMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("client message")
            .expect("connection open")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(ws: &mut WebSocketStream<TcpStream>, message: OperationMessage) {
    ws.send(Message::text(serde_json::to_string(&message).unwrap()))
        .await
        .unwrap();
}

async fn data(ws: &mut WebSocketStream<TcpStream>, id: &str, n: u64) {
    send(
        ws,
        OperationMessage::new(MessageType::Data)
            .with_id(id)
            .with_payload(serde_json::json!({ "data": { "n": n } })),
    )
    .await;
}

/// Reads `connection_init`, acknowledges it and returns the next `start`.
async fn handshake(ws: &mut WebSocketStream<TcpStream>) -> OperationMessage {
    assert_eq!(recv(ws).await.kind, MessageType::ConnectionInit);
    send(ws, OperationMessage::new(MessageType::ConnectionAck)).await;
    let start = recv(ws).await;
    assert_eq!(start.kind, MessageType::Start);
    start
}

fn ws_config(addr: SocketAddr) -> WsConfig {
    WsConfig::new(format!("ws://{addr}/graphql")).backoff(Duration::from_millis(50))
}

fn n(result: &OperationResult) -> u64 {
    result.data.as_ref().unwrap()["n"].as_u64().unwrap()
}

/// Test a query over HTTP decoding into a typed result
#[tokio::test]
async fn test_http_query() {
    let addr = serve_http(Arc::new(|payload| {
        assert!(payload.query.contains("room"));
        OperationResult::data(serde_json::json!({ "room": { "name": "test" } }))
    }))
    .await;

    let client = Client::new(HttpTransport::new(HttpConfig::new(format!(
        "http://{addr}/graphql"
    ))));
    let data: RoomData = client
        .query(Operation::new("{ room(name: \"test\") { name } }"))
        .await
        .unwrap();

    assert_eq!(data.room.name, "test");
}

/// Test a binary codec body reaching the codec byte for byte
#[tokio::test]
async fn test_http_binary_codec() {
    let addr = serve_http_with(
        Arc::new(FramedCodec),
        Arc::new(|payload| {
            assert!(payload.query.contains("room"));
            OperationResult::data(serde_json::json!({ "room": { "name": "framed" } }))
        }),
    )
    .await;

    let transport = HttpTransport::new(HttpConfig::new(format!("http://{addr}/graphql")))
        .with_codec(Arc::new(FramedCodec));
    let data: RoomData = Client::new(transport)
        .query(Operation::new("{ room { name } }"))
        .await
        .unwrap();

    assert_eq!(data.room.name, "framed");
}

/// Test a persisted-query miss retried with the full document
#[tokio::test]
async fn test_persisted_query_retry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let addr = serve_http(Arc::new(move |payload| {
        counter.fetch_add(1, Ordering::SeqCst);
        assert!(payload.extensions.contains_key("persistedQuery"));
        if payload.query.is_empty() {
            OperationResult::error(GraphQLError::new("PersistedQueryNotFound").with_code(NOT_FOUND_CODE))
        } else {
            OperationResult::data(serde_json::json!({ "room": { "name": "test" } }))
        }
    }))
    .await;

    let client = Client::new(HttpTransport::new(HttpConfig::new(format!(
        "http://{addr}/graphql"
    ))))
    .with_extension(PersistedQuery::new());

    let data: RoomData = client
        .query(Operation::new("{ room(name: \"test\") { name } }"))
        .await
        .unwrap();

    assert_eq!(data.room.name, "test");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Test a subscription streaming three results then completing
#[tokio::test]
async fn test_ws_subscription_completes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let start = handshake(&mut ws).await;
        let id = start.id.unwrap();
        for i in 1..=3 {
            data(&mut ws, &id, i).await;
        }
        send(&mut ws, OperationMessage::new(MessageType::Complete).with_id(&id)).await;
        // Keep the connection open until the client goes away.
        while ws.next().await.is_some() {}
    });

    let client = Client::new(WsTransport::connect(ws_config(addr)));
    let subscription = client
        .subscription(Operation::new("subscription { tick }"))
        .await;

    let mut seen = Vec::new();
    while let Some(result) = subscription.next().await {
        seen.push(n(&result));
    }

    assert_eq!(seen, [1, 2, 3]);
    assert!(subscription.err().is_none());
}

/// Test a subscription surviving an abrupt connection drop
#[tokio::test]
async fn test_ws_subscription_resumes_after_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let start = handshake(&mut ws).await;
        let id = start.id.unwrap();
        data(&mut ws, &id, 1).await;
        // No close frame.
        drop(ws);

        let mut ws = accept_ws(&listener).await;
        let restart = handshake(&mut ws).await;
        assert_eq!(restart.id.as_deref(), Some(id.as_str()));
        data(&mut ws, &id, 2).await;
        data(&mut ws, &id, 3).await;
        send(&mut ws, OperationMessage::new(MessageType::Complete).with_id(&id)).await;
        while ws.next().await.is_some() {}
    });

    let ws = WsTransport::connect(ws_config(addr));
    let response = ws.request(Operation::new("subscription { tick }")).await;

    let mut seen = Vec::new();
    while let Some(result) = response.next().await {
        seen.push(n(&result));
    }

    assert_eq!(seen, [1, 2, 3]);
    assert!(response.err().is_none());
}

/// Test one client mixing HTTP queries and Ws subscriptions
#[tokio::test]
async fn test_split_client() {
    let http_addr = serve_http(Arc::new(|_payload| {
        OperationResult::data(serde_json::json!({ "room": { "name": "http" } }))
    }))
    .await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let start = handshake(&mut ws).await;
        let id = start.id.unwrap();
        data(&mut ws, &id, 7).await;
        send(&mut ws, OperationMessage::new(MessageType::Complete).with_id(&id)).await;
        while ws.next().await.is_some() {}
    });

    let split = SplitTransport::by_kind(
        Arc::new(WsTransport::connect(ws_config(ws_addr))),
        Arc::new(HttpTransport::new(HttpConfig::new(format!(
            "http://{http_addr}/graphql"
        )))),
    );
    let client = Client::new(split);

    let data: RoomData = client.query(Operation::new("{ room { name } }")).await.unwrap();
    assert_eq!(data.room.name, "http");

    let subscription = client
        .subscription(Operation::new("subscription { tick }"))
        .await;
    assert_eq!(n(&subscription.next().await.unwrap()), 7);
    assert!(subscription.next().await.is_none());
}
