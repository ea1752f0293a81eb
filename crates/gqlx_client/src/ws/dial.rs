//! Connection providers for the Ws client.

use super::protocol::{OperationMessage, SUBPROTOCOL};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{BoxStream, StreamExt};
use futures_util::{Sink, SinkExt};
use gqlx_core::{Error, ErrorCode, Result, ResultExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

/// Outgoing half of a connection.
pub type MessageSink = Pin<Box<dyn Sink<OperationMessage, Error = Error> + Send>>;

/// Incoming half of a connection.
///
/// A remote graceful close is reported as an
/// [`ErrorCode::ConnectionTerminated`] error; the stream ending without one
/// is an abrupt drop.
pub type MessageStream = BoxStream<'static, Result<OperationMessage>>;

/// One physical connection, already speaking envelopes.
pub struct WsConnection {
    pub sink: MessageSink,
    pub stream: MessageStream,
}

impl WsConnection {
    pub fn new(sink: MessageSink, stream: MessageStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens a fresh connection. Called again after every reset.
pub type Dialer = Arc<dyn Fn() -> BoxFuture<'static, Result<WsConnection>> + Send + Sync>;

/// Returns a dialer connecting to `url` with `tokio-tungstenite`.
pub fn tungstenite_dialer(url: impl Into<String>, headers: HashMap<String, String>) -> Dialer {
    let url = url.into();
    Arc::new(move || {
        let url = url.clone();
        let headers = headers.clone();
        async move { dial(&url, &headers).await }.boxed()
    })
}

/// Connects to `url`, negotiating the `graphql-ws` subprotocol.
pub async fn dial(url: &str, headers: &HashMap<String, String>) -> Result<WsConnection> {
    let mut request = url
        .into_client_request()
        .map_err_with(ErrorCode::InvalidUrl, format!("invalid url: {url}"))?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err_code(ErrorCode::InvalidHeader)?;
        let value = HeaderValue::from_str(value).map_err_code(ErrorCode::InvalidHeader)?;
        request.headers_mut().insert(name, value);
    }

    let (socket, _) = tokio_tungstenite::connect_async(request).await.map_err(|e| {
        Error::new(ErrorCode::ConnectionRefused, format!("dial {url}: {e}"))
    })?;
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(|e| Error::network(format!("write failed: {e}")))
        .with(|message: OperationMessage| async move {
            serde_json::to_string(&message)
                .map(Message::text)
                .map_err_code(ErrorCode::SerializeError)
        });

    let stream = stream.filter_map(|frame| async move {
        match frame {
            Ok(Message::Text(text)) => Some(
                serde_json::from_str::<OperationMessage>(&text)
                    .map_err_with(ErrorCode::ProtocolError, "malformed envelope"),
            ),
            Ok(Message::Close(frame)) => Some(Err(Error::new(
                ErrorCode::ConnectionTerminated,
                frame.map_or_else(
                    || "closed by server".to_string(),
                    |f| format!("closed by server: {}", f.reason),
                ),
            ))),
            // Pings are answered by tungstenite.
            Ok(_) => None,
            Err(e) => Some(Err(Error::network(format!("read failed: {e}")))),
        }
    });

    Ok(WsConnection::new(Box::pin(sink), stream.boxed()))
}
