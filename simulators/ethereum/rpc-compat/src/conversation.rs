//! Replays a conversation against a client.

use crate::jsonmatch::{self, compare, REDACTION_NOTE};
use crate::testload::{Direction, Message, RpcTest, Transport};
use futures::{SinkExt, Stream, StreamExt};
use hivesim::{Error, Result};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message as Frame};
use tracing::debug;

pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a finished subscription test keeps listening for strays.
pub const SETTLE_TIME: Duration = Duration::from_millis(100);

/// Added to every test's deadline on top of the per-message allowance.
pub const DEADLINE_FLOOR: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct Endpoint {
    pub http_url: String,
    pub ws_url: String,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct Replayer {
    http: reqwest::Client,
    endpoint: Endpoint,
}

impl Replayer {
    pub fn new(endpoint: Endpoint) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(endpoint.timeout)
            .build()?;
        Ok(Self { http, endpoint })
    }

    /// Time allowed for the whole of `test`.
    pub fn deadline(&self, test: &RpcTest) -> Duration {
        let messages = u32::try_from(test.messages.len()).unwrap_or(u32::MAX);
        DEADLINE_FLOOR.saturating_add(self.endpoint.timeout.saturating_mul(messages))
    }

    /// Plays every message of `test` in order. Each turn is reported to `log`.
    pub async fn run<L>(&self, test: &RpcTest, log: L) -> Result<()>
    where
        L: FnMut(String) + Send,
    {
        self.run_within(test, self.deadline(test), log).await
    }

    /// Like `run`, but gives up once `deadline` has passed, however busy
    /// the client keeps the connection.
    pub async fn run_within<L>(&self, test: &RpcTest, deadline: Duration, mut log: L) -> Result<()>
    where
        L: FnMut(String) + Send,
    {
        debug!(test = %test.name, transport = ?test.transport, ?deadline, "replaying");
        let replay = async {
            match test.transport {
                Transport::Http => self.run_http(test, &mut log).await,
                Transport::WebSocket => self.run_ws(test, &mut log).await,
            }
        };
        timeout(deadline, replay)
            .await
            .map_err(|_| Error::Timeout(format!("test did not finish within {deadline:?}")))?
    }

    async fn run_http<L>(&self, test: &RpcTest, log: &mut L) -> Result<()>
    where
        L: FnMut(String) + Send,
    {
        let mut pending: Option<Value> = None;
        for msg in &test.messages {
            match msg.direction {
                Direction::Send => {
                    if pending.is_some() {
                        return Err(unhandled(test));
                    }
                    log(format!(">>  {}", msg.text));
                    let resp = self
                        .http
                        .post(&self.endpoint.http_url)
                        .header(CONTENT_TYPE, "application/json")
                        .body(msg.text.clone())
                        .send()
                        .await?;
                    let body = resp.text().await?;
                    log(format!("<<  {body}"));
                    pending = Some(parse_response(&body)?);
                }
                Direction::Recv => {
                    let Some(got) = pending.take() else {
                        return Err(Error::corpus(
                            test.name.clone(),
                            "invalid test, response before request",
                        ));
                    };
                    check(test, msg, &got, log)?;
                }
            }
        }
        if pending.is_some() {
            return Err(unhandled(test));
        }
        Ok(())
    }

    /// Responses and notifications are matched against the `<<` lines in
    /// the order they arrive.
    async fn run_ws<L>(&self, test: &RpcTest, log: &mut L) -> Result<()>
    where
        L: FnMut(String) + Send,
    {
        let url = self.endpoint.ws_url.as_str();
        let (mut ws, _) = timeout(self.endpoint.timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {url}")))?
            .map_err(|e| Error::Transport(e.to_string()))?;

        for msg in &test.messages {
            match msg.direction {
                Direction::Send => {
                    log(format!(">>  {}", msg.text));
                    ws.send(Frame::Text(msg.text.clone()))
                        .await
                        .map_err(|e| Error::Transport(e.to_string()))?;
                }
                Direction::Recv => {
                    let text = timeout(self.endpoint.timeout, next_text(&mut ws))
                        .await
                        .map_err(|_| {
                            Error::Timeout(format!("no message within {:?}", self.endpoint.timeout))
                        })??
                        .ok_or_else(|| Error::Transport("connection closed by client".to_string()))?;
                    log(format!("<<  {text}"));
                    check(test, msg, &parse_response(&text)?, log)?;
                }
            }
        }

        if let Ok(Ok(Some(text))) = timeout(SETTLE_TIME, next_text(&mut ws)).await {
            log(format!("<<  {text}"));
            return Err(Error::ProtocolMismatch(format!(
                "unexpected message at end of test: {text}"
            )));
        }
        if let Err(err) = ws.close(None).await {
            debug!(test = %test.name, %err, "closing websocket");
        }
        Ok(())
    }
}

fn unhandled(test: &RpcTest) -> Error {
    Error::corpus(test.name.clone(), "unhandled response in test case")
}

fn parse_response(text: &str) -> Result<Value> {
    jsonmatch::parse(text)
        .map_err(|e| Error::ProtocolMismatch(format!("invalid JSON response: {e}")))
}

fn check<L>(test: &RpcTest, want: &Message, got: &Value, log: &mut L) -> Result<()>
where
    L: FnMut(String),
{
    let cmp = compare(test.mode, &want.value, got);
    if cmp.redacted {
        log(REDACTION_NOTE.to_string());
    }
    if cmp.is_match() {
        Ok(())
    } else {
        Err(Error::ProtocolMismatch(cmp.diff()))
    }
}

/// Next text payload, skipping control frames. `None` once the peer closed.
async fn next_text<S>(ws: &mut S) -> Result<Option<String>>
where
    S: Stream<Item = std::result::Result<Frame, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = ws.next().await {
        match frame.map_err(|e| Error::Transport(e.to_string()))? {
            Frame::Text(text) => return Ok(Some(text)),
            Frame::Binary(data) => return Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Frame::Close(_) => return Ok(None),
            Frame::Ping(_) | Frame::Pong(_) | Frame::Frame(_) => continue,
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        addr
    }

    /// Answers `eth_blockNumber` with 0, errors for anything else and never
    /// answers `eth_syncing`.
    async fn fake_node(Json(req): Json<Value>) -> Json<Value> {
        let id = req["id"].clone();
        match req["method"].as_str() {
            Some("eth_blockNumber") => Json(json!({"jsonrpc": "2.0", "id": id, "result": "0x0"})),
            Some("eth_getBlockByNumber") => Json(json!({
                "jsonrpc": "2.0", "id": id,
                "result": {"hash": "0xabc123", "number": "0x2"}
            })),
            Some("eth_syncing") => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Json(json!({"jsonrpc": "2.0", "id": id, "result": false}))
            }
            _ => Json(json!({
                "jsonrpc": "2.0", "id": id,
                "error": {"code": -32000, "message": "other"}
            })),
        }
    }

    async fn subscriptions(ws: WebSocketUpgrade) -> impl IntoResponse {
        ws.on_upgrade(|mut socket: WebSocket| async move {
            while let Some(Ok(WsMessage::Text(text))) = socket.recv().await {
                let req: Value = serde_json::from_str(&text).unwrap();
                let reply = json!({"jsonrpc": "2.0", "id": req["id"], "result": "0x1"});
                socket.send(WsMessage::Text(reply.to_string())).await.unwrap();
                for n in 0..2 {
                    let note = json!({
                        "jsonrpc": "2.0", "method": "eth_subscription",
                        "params": {"subscription": "0x1", "result": {"number": format!("0x{n}")}}
                    });
                    socket.send(WsMessage::Text(note.to_string())).await.unwrap();
                }
            }
        })
    }

    /// Answers the subscription, then keeps sending the same notification.
    async fn endless_notifications(ws: WebSocketUpgrade) -> impl IntoResponse {
        ws.on_upgrade(|mut socket: WebSocket| async move {
            let Some(Ok(WsMessage::Text(text))) = socket.recv().await else {
                return;
            };
            let req: Value = serde_json::from_str(&text).unwrap();
            let reply = json!({"jsonrpc": "2.0", "id": req["id"], "result": "0x1"});
            socket.send(WsMessage::Text(reply.to_string())).await.unwrap();
            let note = json!({
                "jsonrpc": "2.0", "method": "eth_subscription",
                "params": {"subscription": "0x1", "result": {"number": "0x0"}}
            });
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if socket.send(WsMessage::Text(note.to_string())).await.is_err() {
                    return;
                }
            }
        })
    }

    async fn replayer() -> Replayer {
        let addr = serve(
            Router::new()
                .route("/", post(fake_node))
                .route("/ws", get(subscriptions))
                .route("/endless", get(endless_notifications)),
        )
        .await;
        Replayer::new(Endpoint {
            http_url: format!("http://{addr}/"),
            ws_url: format!("ws://{addr}/ws"),
            timeout: Duration::from_millis(500),
        })
        .unwrap()
    }

    async fn play(replayer: &Replayer, content: &str) -> (Result<()>, Vec<String>) {
        let test = RpcTest::parse("test", content).unwrap();
        let lines = Arc::new(Mutex::new(vec![]));
        let sink = lines.clone();
        let result = replayer
            .run(&test, move |line| sink.lock().unwrap().push(line))
            .await;
        let lines = lines.lock().unwrap().clone();
        (result, lines)
    }

    #[tokio::test]
    async fn exact_match_passes() {
        let replayer = replayer().await;
        let (result, log) = play(
            &replayer,
            "// example\n>> {\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"eth_blockNumber\",\"params\":[]}\n<< {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"0x0\"}\n",
        )
        .await;
        result.unwrap();
        assert!(log[0].starts_with(">>  "));
        assert!(log[1].starts_with("<<  "));
    }

    #[tokio::test]
    async fn error_messages_are_not_compared() {
        let replayer = replayer().await;
        let (result, log) = play(
            &replayer,
            "// example\n>> {\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"eth_call\",\"params\":[]}\n<< {\"jsonrpc\":\"2.0\",\"id\":1,\"error\":{\"code\":-32000,\"message\":\"some\"}}\n",
        )
        .await;
        result.unwrap();
        assert!(log.iter().any(|l| l.contains("error messages removed from comparison")));
    }

    #[tokio::test]
    async fn type_match_ignores_values() {
        let replayer = replayer().await;
        let (result, _) = play(
            &replayer,
            "// speconly: structure only\n>> {\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"eth_getBlockByNumber\",\"params\":[\"0x1\",false]}\n<< {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"hash\":\"0xdeadbeef\",\"number\":\"0x1\"}}\n",
        )
        .await;
        result.unwrap();
    }

    #[tokio::test]
    async fn mismatch_carries_diff() {
        let replayer = replayer().await;
        let (result, _) = play(
            &replayer,
            ">> {\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"eth_blockNumber\"}\n<< {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"0x1\"}\n",
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), hivesim::ErrorKind::ProtocolMismatch);
        assert!(err.to_string().contains("$.result\n-- \"0x0\"\n++ \"0x1\""), "{err}");
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let replayer = replayer().await;
        let (result, _) = play(
            &replayer,
            ">> {\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"eth_syncing\"}\n<< {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":false}\n",
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), hivesim::ErrorKind::Timeout);
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn trailing_request_is_unhandled() {
        let replayer = replayer().await;
        let (result, _) = play(
            &replayer,
            ">> {\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"eth_blockNumber\"}\n",
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), hivesim::ErrorKind::Corpus);
        assert!(err.to_string().contains("unhandled response in test case"));
    }

    const SUBSCRIBE: &str = r#">> {"jsonrpc":"2.0","id":1,"method":"eth_subscribe","params":["newHeads"]}
<< {"jsonrpc":"2.0","id":1,"result":"0x1"}
<< {"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0x1","result":{"number":"0x0"}}}
"#;

    #[tokio::test]
    async fn notifications_match_in_order() {
        let replayer = replayer().await;
        let content = format!(
            "{SUBSCRIBE}{}\n",
            r#"<< {"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0x1","result":{"number":"0x1"}}}"#
        );
        let (result, log) = play(&replayer, &content).await;
        result.unwrap();
        assert_eq!(log.len(), 4);
    }

    #[tokio::test]
    async fn unmatched_notification_fails() {
        let replayer = replayer().await;
        let (result, _) = play(&replayer, SUBSCRIBE).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), hivesim::ErrorKind::ProtocolMismatch);
        assert!(err.to_string().contains("unexpected message at end of test"));
    }

    #[tokio::test]
    async fn deadline_grows_with_the_conversation() {
        let replayer = replayer().await;
        let test = RpcTest::parse("test", SUBSCRIBE).unwrap();
        assert_eq!(
            replayer.deadline(&test),
            DEADLINE_FLOOR + Duration::from_millis(1500)
        );
    }

    #[tokio::test]
    async fn busy_subscription_hits_the_deadline() {
        let replayer = replayer().await;
        let mut endless = replayer.clone();
        endless.endpoint.ws_url = endless.endpoint.ws_url.replace("/ws", "/endless");

        // every notification arrives well within the call timeout
        let notification = r#"<< {"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0x1","result":{"number":"0x0"}}}"#;
        let mut content = SUBSCRIBE.to_string();
        for _ in 0..20 {
            content.push_str(notification);
            content.push('\n');
        }
        let test = RpcTest::parse("test", &content).unwrap();

        let started = std::time::Instant::now();
        let err = endless
            .run_within(&test, Duration::from_millis(600), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), hivesim::ErrorKind::Timeout);
        assert!(err.to_string().contains("test did not finish within"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn wide_integers_are_compared_exactly() {
        let addr = serve(Router::new().route(
            "/",
            post(|| async {
                r#"{"jsonrpc":"2.0","id":1,"result":18446744073709551617}"#
            }),
        ))
        .await;
        let replayer = Replayer::new(Endpoint {
            http_url: format!("http://{addr}/"),
            ws_url: format!("ws://{addr}/ws"),
            timeout: Duration::from_millis(500),
        })
        .unwrap();
        let (result, _) = play(
            &replayer,
            ">> {\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"eth_getBalance\"}\n<< {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":18446744073709551616}\n",
        )
        .await;
        let err = result.unwrap_err();
        let diff = "-- 18446744073709551617\n++ 18446744073709551616";
        assert!(err.to_string().contains(diff), "{err}");
    }
}
