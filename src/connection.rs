//! Per-connection HTTP/1.x protocol state.
//!
//! A [`Connection`] never touches a socket. The reactor appends whatever it
//! read to an input [`BytesMut`] and calls [`Connection::feed`]; the machine
//! consumes as much as it can, queues replies in its output buffer and
//! reports whether the socket should stay open. Partial input is left in the
//! buffer and parsing resumes on the next call.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use http::Version;
use tracing::{debug, error};

use crate::error::Error;
use crate::helpers::traits::bytes::{LineRead, ReadLine};
use crate::helpers::traits::http_response::ResponseUtil;
use crate::helpers::traits::{parse_uri_args, tokenize};
use crate::helpers::HeaderList;
use crate::router::{HttpHandler, Reply, RouteKind, Router, WebSocketHandler};
use crate::websocket::{self, Frame, Opcode, PushReceiver, WebSocketSender};
use crate::Options;

/// POST bodies above this size drop the connection without a reply.
pub const MAX_POST_SIZE: usize = 16 * 1024 * 1024;

/// Longest request or header line accepted, terminator included.
pub const MAX_LINE_LEN: usize = 1024;

pub const DEFAULT_SERVER_NAME: &str = concat!("hearth_http/", env!("CARGO_PKG_VERSION"));

/// Request verbs understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Get,
    Head,
    Post,
    Subscribe,
    Unsubscribe,
}

impl Command {
    pub fn from_token(token: &str) -> Option<Self> {
        [
            Command::Get,
            Command::Head,
            Command::Post,
            Command::Subscribe,
            Command::Unsubscribe,
        ]
        .into_iter()
        .find(|cmd| cmd.as_str().eq_ignore_ascii_case(token))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Get => "GET",
            Command::Head => "HEAD",
            Command::Post => "POST",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn parse_version(token: &str) -> Option<Version> {
    if token.eq_ignore_ascii_case("HTTP/1.0") {
        Some(Version::HTTP_10)
    } else if token.eq_ignore_ascii_case("HTTP/1.1") {
        Some(Version::HTTP_11)
    } else {
        None
    }
}

pub(crate) fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for a request line.
    Command,
    /// Reading the header block.
    Headers,
    /// Collecting a POST body of known length.
    PostData,
    /// Upgraded; all input is WebSocket frames until close.
    WebSocket,
}

/// What the reactor should do after a [`Connection::feed`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Flush the output and keep reading.
    Continue,
    /// Flush the output and close the socket.
    Close,
}

enum Step {
    NeedMore,
    Again,
    Close,
}

pub struct Connection {
    state: State,
    cmd: Option<Command>,
    url: String,
    url_orig: String,
    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
    pub(crate) no_output: bool,

    post_data: Option<Vec<u8>>,
    post_len: usize,

    pub(crate) request_headers: HeaderList,
    pub(crate) req_args: HeaderList,
    pub(crate) response_headers: HeaderList,

    pub(crate) output: BytesMut,

    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    pub(crate) server_name: String,

    router: Arc<Router>,
    ws_route: Option<Arc<dyn WebSocketHandler>>,
    opaque: Option<Box<dyn Any + Send>>,
    close_requested: bool,

    pusher: WebSocketSender,
    pushed: Option<PushReceiver>,
}

impl Connection {
    pub fn new(router: Arc<Router>) -> Self {
        let (pusher, pushed) = websocket::push_channel();
        Self {
            state: State::Command,
            cmd: None,
            url: String::new(),
            url_orig: String::new(),
            version: Version::HTTP_11,
            keep_alive: false,
            no_output: false,
            post_data: None,
            post_len: 0,
            request_headers: HeaderList::new(),
            req_args: HeaderList::new(),
            response_headers: HeaderList::new(),
            output: BytesMut::new(),
            local_addr: None,
            remote_addr: None,
            server_name: DEFAULT_SERVER_NAME.to_owned(),
            router,
            ws_route: None,
            opaque: None,
            close_requested: false,
            pusher,
            pushed: Some(pushed),
        }
    }

    pub fn with_options(
        router: Arc<Router>,
        options: &Options,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let mut conn = Self::new(router);
        conn.server_name = options.server_name.clone();
        conn.local_addr = local_addr;
        conn.remote_addr = remote_addr;
        conn
    }

    /// Run the state machine over everything buffered in `input`.
    ///
    /// An `Err` is a protocol violation or resource failure: the caller
    /// should flush [`take_output`](Self::take_output) and close.
    pub fn feed(&mut self, input: &mut BytesMut) -> Result<Flow, Error> {
        loop {
            if self.close_requested {
                return Ok(Flow::Close);
            }
            let step = match self.state {
                State::Command => self.read_command(input)?,
                State::Headers => self.read_header(input)?,
                State::PostData => self.read_post(input)?,
                State::WebSocket => self.read_frame(input)?,
            };
            match step {
                Step::Again => continue,
                Step::NeedMore => return Ok(Flow::Continue),
                Step::Close => return Ok(Flow::Close),
            }
        }
    }

    /// Bytes queued for transmission, leaving the queue empty.
    pub fn take_output(&mut self) -> BytesMut {
        self.output.split()
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Tear the connection down. The WebSocket close callback runs at most
    /// once, and only if the upgrade completed.
    pub fn close(&mut self) {
        if let Some(ws) = self.ws_route.take() {
            ws.on_close(self);
        }
        self.output.clear();
        self.post_data = None;
    }

    /// Ask for the socket to be closed once the current input is processed.
    pub fn shutdown(&mut self) {
        self.close_requested = true;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn command(&self) -> Option<Command> {
        self.cmd
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Request path with the query string cut off once the route resolved.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request target exactly as received.
    pub fn url_orig(&self) -> &str {
        &self.url_orig
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn local_host(&self) -> Option<String> {
        self.local_addr.map(|addr| addr.ip().to_string())
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_addr.map(|addr| addr.port())
    }

    /// Body of the POST being dispatched.
    pub fn post_data(&self) -> Option<&[u8]> {
        self.post_data.as_deref()
    }

    /// Steal the POST body; later calls return `None`.
    pub fn take_post_data(&mut self) -> Option<Vec<u8>> {
        self.post_data.take()
    }

    pub fn set_opaque<T: Any + Send>(&mut self, value: T) {
        self.opaque = Some(Box::new(value));
    }

    pub fn opaque_ref<T: Any + Send>(&self) -> Option<&T> {
        self.opaque.as_ref()?.downcast_ref()
    }

    pub fn opaque_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.opaque.as_mut()?.downcast_mut()
    }

    pub fn take_opaque<T: Any + Send>(&mut self) -> Option<T> {
        match self.opaque.take()?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.opaque = Some(other);
                None
            }
        }
    }

    /// Queue a final, unmasked frame.
    pub fn websocket_send(&mut self, opcode: Opcode, payload: &[u8]) {
        websocket::encode_frame(opcode, payload, &mut self.output);
    }

    /// Handle for pushing frames from outside the callbacks. Usually taken
    /// in [`WebSocketHandler::on_init`] and handed to a background task.
    pub fn websocket_sender(&self) -> WebSocketSender {
        self.pusher.clone()
    }

    /// Receiving end of [`websocket_sender`](Self::websocket_sender). The
    /// reactor takes it once and feeds its frames to
    /// [`push_frame`](Self::push_frame).
    pub fn take_push_receiver(&mut self) -> Option<PushReceiver> {
        self.pushed.take()
    }

    /// Queue a frame that came through a [`WebSocketSender`]. A close frame
    /// ends the connection once flushed.
    pub fn push_frame(&mut self, frame: Frame) -> Flow {
        if self.state != State::WebSocket {
            debug!(opcode = ?frame.opcode, "dropping frame pushed before upgrade");
            return Flow::Continue;
        }
        frame.encode(&mut self.output);
        if frame.opcode == Opcode::Close {
            self.close_requested = true;
            return Flow::Close;
        }
        Flow::Continue
    }

    fn read_command(&mut self, input: &mut BytesMut) -> Result<Step, Error> {
        self.post_data = None;

        let Some(line) = next_line(input)? else {
            return Ok(Step::NeedMore);
        };
        debug!(%line, "request");

        let fields: Vec<String> = tokenize(&line, None, 3)
            .into_iter()
            .map(str::to_owned)
            .collect();
        let [method, url, version]: [String; 3] = match fields.try_into() {
            Ok(fields) => fields,
            Err(_) => return Err(Error::MalformedRequestLine(line)),
        };

        self.cmd = Command::from_token(&method);
        self.version = parse_version(&version).ok_or(Error::UnsupportedVersion(version))?;
        self.url = url.clone();
        self.url_orig = url;

        self.request_headers.clear();
        self.req_args.clear();
        self.response_headers.clear();
        self.state = State::Headers;
        Ok(Step::Again)
    }

    fn read_header(&mut self, input: &mut BytesMut) -> Result<Step, Error> {
        let Some(line) = next_line(input)? else {
            return Ok(Step::NeedMore);
        };

        if line.starts_with([' ', '\t']) {
            self.request_headers.append_continuation(&line);
        } else if line.is_empty() {
            return self.handle_request();
        } else {
            let Some((name, value)) = line.split_once(':') else {
                return Err(Error::MalformedHeader(line));
            };
            self.request_headers
                .add(name, value.trim_start_matches(' '));
        }
        Ok(Step::Again)
    }

    fn handle_request(&mut self) -> Result<Step, Error> {
        self.state = State::Command;
        self.keep_alive = if self.version == Version::HTTP_10 {
            self.request_headers.has_token("Connection", "keep-alive")
        } else {
            !self.request_headers.has_token("Connection", "close")
        };
        self.no_output = self.cmd == Some(Command::Head);

        match self.cmd {
            None => self.error(501, None),
            Some(Command::Post) => return self.start_post(),
            Some(cmd) => self.cmd_get(cmd)?,
        }
        Ok(self.request_done())
    }

    /// A request that did not switch protocols ends the connection unless
    /// keep-alive was negotiated.
    fn request_done(&self) -> Step {
        if self.state == State::Command && !self.keep_alive {
            Step::Close
        } else {
            Step::Again
        }
    }

    fn cmd_get(&mut self, cmd: Command) -> Result<(), Error> {
        let router = Arc::clone(&self.router);
        let url = self.url_orig.clone();

        let Some(resolved) = router.resolve(&url) else {
            self.error(404, None);
            return Ok(());
        };
        if resolved.route.is_leaf() && resolved.remainder.is_some() {
            self.error(404, None);
            return Ok(());
        }
        self.strip_query();

        if let Some(query) = resolved.query {
            parse_uri_args(&mut self.req_args, query);
        }

        let upgrade = self.request_headers.has_token("Connection", "upgrade")
            && self
                .request_headers
                .get("Upgrade")
                .is_some_and(|u| u.eq_ignore_ascii_case("websocket"));

        match resolved.route.kind() {
            RouteKind::WebSocket(ws) if upgrade => self.start_websocket(Arc::clone(ws)),
            RouteKind::WebSocket(_) => self.error(405, None),
            RouteKind::Http { .. } if upgrade => self.error(405, None),
            RouteKind::Http { handler, .. } => {
                return self.exec(Arc::clone(handler), resolved.remainder, cmd)
            }
        }
        Ok(())
    }

    fn start_post(&mut self) -> Result<Step, Error> {
        let Some(value) = self.request_headers.get("Content-Length") else {
            return Err(Error::MissingContentLength);
        };
        let len: usize = value
            .trim()
            .parse()
            .map_err(|_| Error::InvalidContentLength(value.to_owned()))?;
        if len > MAX_POST_SIZE {
            self.keep_alive = false;
            return Err(Error::PostTooLarge(len));
        }

        let mut data = Vec::new();
        if data.try_reserve_exact(len).is_err() {
            self.keep_alive = false;
            return Err(Error::Alloc(len));
        }
        self.post_data = Some(data);
        self.post_len = len;

        if self
            .request_headers
            .get("Expect")
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
        {
            self.output
                .extend_from_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
        }

        self.state = State::PostData;
        Ok(Step::Again)
    }

    fn read_post(&mut self, input: &mut BytesMut) -> Result<Step, Error> {
        let post_len = self.post_len;
        let data = self.post_data.get_or_insert_with(Vec::new);
        let n = (post_len - data.len()).min(input.len());
        data.extend_from_slice(&input[..n]);
        input.advance(n);

        if data.len() < post_len {
            return Ok(Step::NeedMore);
        }

        self.state = State::Command;
        self.dispatch_post()?;
        Ok(self.request_done())
    }

    fn dispatch_post(&mut self) -> Result<(), Error> {
        let mime = self
            .request_headers
            .get("Content-Type")
            .map(|ct| tokenize(ct, Some(';'), 2).first().map(|m| m.to_string()));

        match mime {
            Some(None) => {
                self.error(400, Some("Content-Type malformed"));
                return Ok(());
            }
            Some(Some(mime)) if mime.eq_ignore_ascii_case("application/x-www-form-urlencoded") => {
                let body = String::from_utf8_lossy(self.post_data.as_deref().unwrap_or_default())
                    .into_owned();
                parse_uri_args(&mut self.req_args, &body);
            }
            _ => {}
        }

        let router = Arc::clone(&self.router);
        let url = self.url_orig.clone();
        let Some(resolved) = router.resolve(&url) else {
            self.error(404, None);
            return Ok(());
        };
        self.strip_query();

        match resolved.route.kind() {
            RouteKind::Http { handler, .. } => {
                self.exec(Arc::clone(handler), resolved.remainder, Command::Post)
            }
            RouteKind::WebSocket(_) => {
                self.error(405, None);
                Ok(())
            }
        }
    }

    fn exec(
        &mut self,
        handler: Arc<dyn HttpHandler>,
        remainder: Option<&str>,
        cmd: Command,
    ) -> Result<(), Error> {
        debug!(url = %self.url_orig, %cmd, "dispatching");
        match handler.handle(self, remainder, cmd) {
            // 0 means the handler already replied.
            Ok(Reply::Done) | Ok(Reply::Status(0)) => {}
            Ok(Reply::Status(200)) => {
                self.send_reply(0, Some("text/plain"), None, None, 0, b"OK\n")
            }
            Ok(Reply::Status(code)) => self.error(code, None),
            Err(e) => {
                error!(url = %self.url_orig, error = %e, "handler failed");
                return Err(Error::Handler(e));
            }
        }
        Ok(())
    }

    fn start_websocket(&mut self, ws: Arc<dyn WebSocketHandler>) {
        let Some(key) = self
            .request_headers
            .get("Sec-WebSocket-Key")
            .map(str::to_owned)
        else {
            self.error(400, None);
            return;
        };

        self.opaque = None;
        if let Err(code) = ws.on_init(self) {
            self.error(code, None);
            return;
        }

        let accept = websocket::accept_key(key.trim());
        let headers: HeaderList = [
            ("Connection", "Upgrade"),
            ("Upgrade", "websocket"),
            ("Sec-WebSocket-Accept", accept.as_str()),
        ]
        .into_iter()
        .collect();
        self.send_raw(101, "Switching Protocols", &headers, None);

        debug!(url = %self.url_orig, "upgraded to websocket");
        self.state = State::WebSocket;
        self.ws_route = Some(ws);
    }

    fn read_frame(&mut self, input: &mut BytesMut) -> Result<Step, Error> {
        let Some(frame) = websocket::decode_frame(input)? else {
            return Ok(Step::NeedMore);
        };

        if frame.opcode == Opcode::Ping {
            self.websocket_send(Opcode::Pong, &frame.payload);
        } else if let Some(ws) = self.ws_route.clone() {
            ws.on_frame(self, frame.opcode, &frame.payload);
        }
        Ok(Step::Again)
    }

    fn strip_query(&mut self) {
        if let Some(at) = self.url.find('?') {
            self.url.truncate(at);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("cmd", &self.cmd)
            .field("url", &self.url_orig)
            .field("version", &self.version)
            .field("keep_alive", &self.keep_alive)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

fn next_line(input: &mut BytesMut) -> Result<Option<String>, Error> {
    match input.read_line(MAX_LINE_LEN) {
        LineRead::Line(line) => Ok(Some(line)),
        LineRead::NotReady => Ok(None),
        LineRead::TooLong => Err(Error::LineTooLong(MAX_LINE_LEN)),
    }
}
