//! Command console - a line-oriented client for a running router.
//!
//! The console is bound to one server address and one conversation identity.
//! Every line typed becomes one request; the reply body is printed verbatim.
//! Only one request is in flight at a time.

use reqwest::Client;
use std::future::Future;
use std::io::{BufRead, Write};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::message::FlexIdType;

pub const PROMPT: &str = "> ";

/// Errors that stop the console loop
#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    #[error("Could not reach abot at {addr}: {reason}")]
    Probe { addr: String, reason: String },

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Input error: {0}")]
    Input(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One read from the input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Line(String),
    /// User pressed Ctrl-C
    Interrupted,
    Eof,
}

/// Where console input comes from
pub trait LineSource {
    fn read_line(&mut self, prompt: &str) -> Result<LineEvent, ConsoleError>;
}

/// Interactive input with line editing and history
pub struct RustylineSource {
    editor: rustyline::DefaultEditor,
}

impl RustylineSource {
    pub fn new() -> Result<Self, ConsoleError> {
        let editor =
            rustyline::DefaultEditor::new().map_err(|e| ConsoleError::Input(e.to_string()))?;
        Ok(Self { editor })
    }
}

impl LineSource for RustylineSource {
    fn read_line(&mut self, prompt: &str) -> Result<LineEvent, ConsoleError> {
        use rustyline::error::ReadlineError;

        match blocking_read(|| self.editor.readline(prompt)) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = self.editor.add_history_entry(line.as_str());
                }
                Ok(LineEvent::Line(line))
            }
            Err(ReadlineError::Interrupted) => Ok(LineEvent::Interrupted),
            Err(ReadlineError::Eof) => Ok(LineEvent::Eof),
            Err(e) => Err(ConsoleError::Input(e.to_string())),
        }
    }
}

/// Run blocking terminal input, handing the worker thread back to the
/// runtime first when it is multi-threaded
fn blocking_read<T>(read: impl FnOnce() -> T) -> T {
    use tokio::runtime::{Handle, RuntimeFlavor};

    match Handle::try_current() {
        Ok(handle) if matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread) => {
            tokio::task::block_in_place(read)
        }
        _ => read(),
    }
}

/// Non-interactive input from any buffered reader
pub struct ReaderSource<R> {
    reader: R,
}

impl<R: BufRead> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> LineSource for ReaderSource<R> {
    fn read_line(&mut self, _prompt: &str) -> Result<LineEvent, ConsoleError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(LineEvent::Eof);
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        Ok(LineEvent::Line(trimmed.to_string()))
    }
}

/// Client bound to one server and one identity
pub struct Console {
    client: Client,
    base_url: String,
    flex_id_type: FlexIdType,
    flex_id: String,
}

impl Console {
    /// `addr` is `host:port` or a full `http(s)://` URL
    pub fn new(
        addr: &str,
        flex_id_type: FlexIdType,
        flex_id: impl Into<String>,
    ) -> Result<Self, ConsoleError> {
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };
        Url::parse(&base_url).map_err(|e| ConsoleError::InvalidAddress(format!("{}: {}", addr, e)))?;

        Ok(Self {
            client: Client::new(),
            base_url,
            flex_id_type,
            flex_id: flex_id.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `http://<addr>/?flexidtype=<int>&flexid=<enc>&cmd=<enc>`
    pub fn command_url(&self, cmd: &str) -> String {
        format!(
            "{}/?flexidtype={}&flexid={}&cmd={}",
            self.base_url,
            self.flex_id_type.code(),
            urlencoding::encode(&self.flex_id),
            urlencoding::encode(cmd)
        )
    }

    /// Make sure the server answers before accepting input: one GET with
    /// the identity and an empty `cmd`. Only a transport failure counts.
    pub async fn probe(&self) -> Result<(), ConsoleError> {
        let url = self.command_url("");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ConsoleError::Probe {
                addr: self.base_url.clone(),
                reason: e.to_string(),
            })?;
        debug!(url = %url, status = %response.status(), "Server reachable");
        Ok(())
    }

    /// Send one command and return the reply body
    pub async fn send(&self, cmd: &str) -> Result<String, ConsoleError> {
        let response = self.client.post(self.command_url(cmd)).send().await?;
        debug!(status = %response.status(), "Command answered");
        Ok(response.text().await?)
    }

    /// Read, send, print until input ends or the user interrupts
    pub async fn run<S, W>(&self, source: &mut S, out: &mut W) -> Result<(), ConsoleError>
    where
        S: LineSource,
        W: Write,
    {
        loop {
            match source.read_line(PROMPT)? {
                LineEvent::Line(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let reply = self.send(&line).await?;
                    writeln!(out, "{}", reply)?;
                    out.flush()?;
                }
                LineEvent::Interrupted => {
                    writeln!(out)?;
                    return Ok(());
                }
                LineEvent::Eof => return Ok(()),
            }
        }
    }

    /// [`Console::run`] that also stops, with a trailing newline, as soon as
    /// `interrupt` resolves, including while a command is in flight
    pub async fn run_until<S, W, F>(
        &self,
        source: &mut S,
        out: &mut W,
        interrupt: F,
    ) -> Result<(), ConsoleError>
    where
        S: LineSource,
        W: Write,
        F: Future<Output = ()>,
    {
        let interrupted = tokio::select! {
            result = self.run(source, out) => {
                result?;
                false
            }
            _ = interrupt => true,
        };
        if interrupted {
            debug!("Console interrupted");
            writeln!(out)?;
            out.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::time::{Duration, Instant};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Replays scripted events
    struct Scripted(VecDeque<LineEvent>);

    impl LineSource for Scripted {
        fn read_line(&mut self, _prompt: &str) -> Result<LineEvent, ConsoleError> {
            Ok(self.0.pop_front().unwrap_or(LineEvent::Eof))
        }
    }

    #[test]
    fn test_command_url_encoding() {
        let console = Console::new("localhost:9000", FlexIdType::Phone, "+15555550100").unwrap();
        assert_eq!(
            console.command_url("status"),
            "http://localhost:9000/?flexidtype=2&flexid=%2B15555550100&cmd=status"
        );
        assert_eq!(
            console.command_url("what's up?"),
            "http://localhost:9000/?flexidtype=2&flexid=%2B15555550100&cmd=what%27s%20up%3F"
        );
    }

    #[test]
    fn test_full_url_address() {
        let console = Console::new("https://abot.example.com/", FlexIdType::Email, "a@b.c").unwrap();
        assert_eq!(console.base_url(), "https://abot.example.com");
        assert_eq!(
            console.command_url("hi"),
            "https://abot.example.com/?flexidtype=1&flexid=a%40b.c&cmd=hi"
        );
    }

    #[test]
    fn test_invalid_address() {
        assert!(matches!(
            Console::new("http://", FlexIdType::Phone, "1"),
            Err(ConsoleError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_reader_source_strips_newlines() {
        let mut source = ReaderSource::new(Cursor::new("status\r\nweather\n"));
        assert_eq!(source.read_line(PROMPT).unwrap(), LineEvent::Line("status".into()));
        assert_eq!(source.read_line(PROMPT).unwrap(), LineEvent::Line("weather".into()));
        assert_eq!(source.read_line(PROMPT).unwrap(), LineEvent::Eof);
    }

    #[tokio::test]
    async fn test_probe_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("flexidtype", "2"))
            .and(query_param("flexid", "1"))
            .and(query_param("cmd", ""))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let console = Console::new(&server.uri(), FlexIdType::Phone, "1").unwrap();
        console.probe().await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_check_ignores_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let console = Console::new(&server.uri(), FlexIdType::Phone, "1").unwrap();
        console.probe().await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_unreachable() {
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let console = Console::new(&uri, FlexIdType::Phone, "1").unwrap();
        assert!(matches!(
            console.probe().await,
            Err(ConsoleError::Probe { .. })
        ));
    }

    #[tokio::test]
    async fn test_status_command_prints_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(query_param("flexidtype", "2"))
            .and(query_param("flexid", "+15555550100"))
            .and(query_param("cmd", "status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("All systems go."))
            .expect(1)
            .mount(&server)
            .await;

        let addr = format!("localhost:{}", server.address().port());
        let console = Console::new(&addr, FlexIdType::Phone, "+15555550100").unwrap();
        let mut source = ReaderSource::new(Cursor::new("status\n"));
        let mut out = Vec::new();

        console.run(&mut source, &mut out).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "All systems go.\n");
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let console = Console::new(&server.uri(), FlexIdType::Phone, "1").unwrap();
        let mut source = ReaderSource::new(Cursor::new("\n   \nping\n"));
        let mut out = Vec::new();
        console.run(&mut source, &mut out).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "ok\n");
    }

    #[tokio::test]
    async fn test_interrupt_writes_newline_and_stops() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("first"))
            .expect(1)
            .mount(&server)
            .await;

        let console = Console::new(&server.uri(), FlexIdType::Phone, "1").unwrap();
        let mut source = Scripted(VecDeque::from([
            LineEvent::Line("one".into()),
            LineEvent::Interrupted,
            LineEvent::Line("never sent".into()),
        ]));
        let mut out = Vec::new();

        console.run(&mut source, &mut out).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "first\n\n");
        assert_eq!(source.0.len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_stops_loop() {
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let console = Console::new(&uri, FlexIdType::Phone, "1").unwrap();
        let mut source = ReaderSource::new(Cursor::new("status\nweather\n"));
        let mut out = Vec::new();

        let err = console.run(&mut source, &mut out).await.unwrap_err();
        assert!(matches!(err, ConsoleError::Request(_)));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_during_command_writes_newline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("too late")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let console = Console::new(&server.uri(), FlexIdType::Phone, "1").unwrap();
        let mut source = ReaderSource::new(Cursor::new("status\n"));
        let mut out = Vec::new();

        let started = Instant::now();
        console
            .run_until(
                &mut source,
                &mut out,
                tokio::time::sleep(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(String::from_utf8(out).unwrap(), "\n");
    }

    #[tokio::test]
    async fn test_run_until_finishes_on_eof() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let console = Console::new(&server.uri(), FlexIdType::Phone, "1").unwrap();
        let mut source = ReaderSource::new(Cursor::new("ping\n"));
        let mut out = Vec::new();

        console
            .run_until(&mut source, &mut out, std::future::pending())
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "ok\n");
    }

    #[test]
    fn test_blocking_read_outside_runtime() {
        assert_eq!(blocking_read(|| 7), 7);
    }

    #[tokio::test]
    async fn test_blocking_read_on_current_thread_runtime() {
        assert_eq!(blocking_read(|| "line"), "line");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_read_on_multi_thread_runtime() {
        let ticker = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            true
        });
        let line = blocking_read(|| {
            std::thread::sleep(Duration::from_millis(50));
            "line"
        });
        assert_eq!(line, "line");
        assert!(ticker.await.unwrap());
    }
}
