//! Loader for `.io` conversation files.
//!
//! ```text
//! // description, possibly several lines
//! // speconly: only the response structure is checked
//! >> {"jsonrpc":"2.0","id":1,"method":"eth_blockNumber"}
//! << {"jsonrpc":"2.0","id":1,"result":"0x3"}
//! ```

use crate::jsonmatch::{self, MatchMode};
use hivesim::corpus::{discover, CorpusFile};
use hivesim::{Error, Result};
use serde_json::Value;
use std::path::Path;

pub const MAX_LINE: usize = 10 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Transport {
    #[default]
    Http,
    WebSocket,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub direction: Direction,
    /// The JSON text as written in the file.
    pub text: String,
    pub value: Value,
}

impl Message {
    pub fn is_send(&self) -> bool {
        self.direction == Direction::Send
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RpcTest {
    pub name: String,
    /// Header lines without their `//` marker.
    pub comment: String,
    pub speconly: bool,
    pub mode: MatchMode,
    pub transport: Transport,
    pub messages: Vec<Message>,
}

impl RpcTest {
    /// Parses a test from the content of a `.io` file.
    pub fn parse(name: &str, content: &str) -> Result<RpcTest> {
        let err = |message: String| Error::corpus(name, message);

        let mut comment = Vec::new();
        let mut in_header = true;
        let mut explicit_mode = None;
        let mut explicit_transport = None;
        let mut speconly = false;
        let mut messages: Vec<Message> = Vec::new();
        // message whose JSON continues on the following lines
        let mut open: Option<(Direction, String)> = None;

        for line in content.lines() {
            if line.len() > MAX_LINE {
                return Err(err(format!("line exceeds {MAX_LINE} bytes")));
            }
            let (direction, rest) = if let Some(rest) = line.strip_prefix(">>") {
                (Some(Direction::Send), rest)
            } else if let Some(rest) = line.strip_prefix("<<") {
                (Some(Direction::Recv), rest)
            } else {
                (None, line)
            };

            if let Some(direction) = direction {
                if let Some((_, text)) = open.take() {
                    return Err(err(format!("invalid JSON in message: {text:?}")));
                }
                in_header = false;
                open = Some((direction, rest.trim().to_string()));
            } else if let Some((_, text)) = open.as_mut() {
                text.push('\n');
                text.push_str(line);
            } else if line.trim().is_empty() {
                continue;
            } else if let Some(body) = line.strip_prefix("//") {
                if in_header {
                    let body = body.strip_prefix(' ').unwrap_or(body);
                    parse_flag(body, &mut speconly, &mut explicit_mode, &mut explicit_transport)
                        .map_err(err)?;
                    comment.push(body.to_string());
                }
                continue;
            } else {
                return Err(err(format!("invalid test line: {line:?}")));
            }

            if let Some((direction, text)) = open.take() {
                match jsonmatch::parse(&text) {
                    Ok(value) => {
                        push_message(&mut messages, direction, text, value, explicit_transport)
                            .map_err(err)?
                    }
                    Err(_) => open = Some((direction, text)),
                }
            }
        }
        if let Some((_, text)) = open {
            return Err(err(format!("invalid JSON in message: {text:?}")));
        }
        if messages.is_empty() {
            return Err(err("test file contains no messages".to_string()));
        }

        let mode = explicit_mode.unwrap_or(if speconly {
            MatchMode::Type
        } else {
            MatchMode::Exact
        });
        let transport = explicit_transport.unwrap_or_else(|| {
            let subscribes = messages
                .iter()
                .any(|m| m.is_send() && m.value["method"] == "eth_subscribe");
            if subscribes {
                Transport::WebSocket
            } else {
                Transport::Http
            }
        });

        Ok(RpcTest {
            name: name.to_string(),
            comment: comment.join("\n"),
            speconly,
            mode,
            transport,
            messages,
        })
    }

    /// Writes the test back in `.io` form.
    pub fn to_io_string(&self) -> String {
        let mut out = String::new();
        if !self.comment.is_empty() {
            for line in self.comment.lines() {
                if line.is_empty() {
                    out.push_str("//\n");
                } else {
                    out.push_str("// ");
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        for m in &self.messages {
            out.push_str(match m.direction {
                Direction::Send => ">> ",
                Direction::Recv => "<< ",
            });
            out.push_str(&m.text);
            out.push('\n');
        }
        out
    }
}

fn parse_flag(
    line: &str,
    speconly: &mut bool,
    mode: &mut Option<MatchMode>,
    transport: &mut Option<Transport>,
) -> std::result::Result<(), String> {
    let line = line.trim();
    if line.starts_with("speconly:") {
        *speconly = true;
    } else if let Some(value) = line.strip_prefix("match:") {
        *mode = Some(value.parse()?);
    } else if let Some(value) = line.strip_prefix("transport:") {
        *transport = Some(match value.trim() {
            "ws" => Transport::WebSocket,
            "http" => Transport::Http,
            other => return Err(format!("unknown transport {other:?}")),
        });
    }
    Ok(())
}

fn push_message(
    messages: &mut Vec<Message>,
    direction: Direction,
    text: String,
    value: Value,
    transport: Option<Transport>,
) -> std::result::Result<(), String> {
    let previous = messages.last().map(|m| m.direction);
    match (previous, direction) {
        (Some(Direction::Send), Direction::Send) => {
            return Err("invalid test, request without response".to_string())
        }
        (None, Direction::Recv) => {
            return Err("invalid test, response before request".to_string())
        }
        (Some(Direction::Recv), Direction::Recv) => {
            // notifications may follow a response on a subscription
            let streaming = transport == Some(Transport::WebSocket)
                || messages.iter().any(|m| m.is_send() && m.value["method"] == "eth_subscribe");
            if !streaming {
                return Err("invalid test, response before request".to_string());
            }
        }
        _ => {}
    }
    messages.push(Message {
        direction,
        text,
        value,
    });
    Ok(())
}

/// Loads one corpus file.
pub fn load_file(file: &CorpusFile) -> Result<RpcTest> {
    let content = std::fs::read_to_string(&file.path)
        .map_err(|e| Error::corpus(file.path.display().to_string(), e.to_string()))?;
    RpcTest::parse(&file.name, &content)
}

/// Loads all `.io` files below `root`. A file that can't be parsed yields an
/// error in its slot, the others are unaffected.
pub fn load_tests(root: &Path) -> Result<Vec<(String, Result<RpcTest>)>> {
    let files = discover(root, "io", None)?;
    Ok(files
        .into_iter()
        .map(|file| {
            let test = load_file(&file);
            (file.name, test)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const BLOCK_NUMBER: &str = r#"// retrieves the client's current block number
>> {"jsonrpc":"2.0","id":1,"method":"eth_blockNumber","params":[]}
<< {"jsonrpc":"2.0","id":1,"result":"0x0"}
"#;

    #[test]
    fn parses_conversation() {
        let test = RpcTest::parse("eth_blockNumber/simple-test", BLOCK_NUMBER).unwrap();
        assert_eq!(test.comment, "retrieves the client's current block number");
        assert_eq!(test.mode, MatchMode::Exact);
        assert_eq!(test.transport, Transport::Http);
        assert!(!test.speconly);
        assert_eq!(test.messages.len(), 2);
        assert!(test.messages[0].is_send());
        assert_eq!(test.messages[1].value["result"], "0x0");
    }

    #[test]
    fn io_round_trip() {
        let content = "// first line\n//\n//   indented\n// speconly: structure only\n\n>> {\"id\":1}\n<< {\"id\":1,\"result\":[]}\n";
        let test = RpcTest::parse("t", content).unwrap();
        assert_eq!(test.to_io_string(), content.replace("\n\n", "\n"));
    }

    #[test]
    fn header_flags() {
        let test = RpcTest::parse("t", "// speconly: client may vary\n>> {}\n<< {}\n").unwrap();
        assert!(test.speconly);
        assert_eq!(test.mode, MatchMode::Type);

        let test = RpcTest::parse("t", "// match: ranged\n// transport: ws\n>> {}\n<< {}\n").unwrap();
        assert_eq!(test.mode, MatchMode::Ranged);
        assert_eq!(test.transport, Transport::WebSocket);

        let err = RpcTest::parse("t", "// match: fuzzy\n>> {}\n<< {}\n").unwrap_err();
        assert!(err.to_string().contains("unknown match mode"), "{err}");
    }

    #[test]
    fn comments_after_header_are_ignored() {
        let content = "// head\n>> {}\n// ignored\n<< {}\n";
        let test = RpcTest::parse("t", content).unwrap();
        assert_eq!(test.comment, "head");
        assert_eq!(test.messages.len(), 2);
    }

    #[test]
    fn pretty_json_spans_lines() {
        let content = ">> {\n  \"id\": 1,\n  \"method\": \"eth_chainId\"\n}\n<< {\"id\":1}\n";
        let test = RpcTest::parse("t", content).unwrap();
        assert_eq!(test.messages[0].value["method"], "eth_chainId");
        assert_eq!(test.messages.len(), 2);
    }

    #[test]
    fn subscription_is_websocket() {
        let content = concat!(
            r#">> {"id":1,"method":"eth_subscribe","params":["newHeads"]}"#,
            "\n",
            r#"<< {"id":1,"result":"0x1"}"#,
            "\n",
            r#"<< {"method":"eth_subscription","params":{"subscription":"0x1"}}"#,
            "\n"
        );
        let test = RpcTest::parse("t", content).unwrap();
        assert_eq!(test.transport, Transport::WebSocket);
        assert_eq!(test.messages.len(), 3);
    }

    #[test]
    fn rejects_broken_files() {
        let cases = [
            ("garbage\n", "invalid test line"),
            ("<< {}\n", "response before request"),
            (">> {}\n<< {}\n<< {}\n", "response before request"),
            (">> {}\n>> {}\n", "request without response"),
            (">> {\"id\":\n<< {}\n", "invalid JSON"),
            (">> {\"id\":\n", "invalid JSON"),
            ("// only a comment\n", "no messages"),
        ];
        for (content, expected) in cases {
            let err = RpcTest::parse("broken", content).unwrap_err();
            assert_eq!(err.kind(), hivesim::ErrorKind::Corpus);
            assert!(err.to_string().contains(expected), "{content:?}: {err}");
        }
    }

    #[test]
    fn loads_corpus_with_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("eth_blockNumber")).unwrap();
        fs::write(dir.path().join("eth_blockNumber/simple-test.io"), BLOCK_NUMBER).unwrap();
        fs::write(dir.path().join("eth_blockNumber/broken.io"), "nope\n").unwrap();

        let tests = load_tests(dir.path()).unwrap();
        let names: Vec<&str> = tests.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["eth_blockNumber/broken", "eth_blockNumber/simple-test"]);
        assert!(tests[0].1.is_err());
        assert!(tests[1].1.is_ok());
    }
}
