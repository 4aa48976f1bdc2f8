use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "env")]
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub mod connection;
pub mod error;
pub mod helpers;
pub mod router;
pub mod websocket;

pub use connection::{Command, Connection, Flow, State, MAX_POST_SIZE};
pub use error::Error;
pub use helpers::traits::http_request::RequestUtils;
pub use helpers::traits::http_response::ResponseUtil;
pub use helpers::traits::http_stream::StreamHttp;
pub use helpers::HeaderList;
pub use router::{
    handler_fn, HandlerResult, HttpHandler, Reply, Route, Router, RouterBuilder, WebSocketHandler,
};
pub use websocket::{Frame, Opcode, WebSocketSender};

pub mod external {
    pub use async_trait;
    pub use bytes;
    #[cfg(feature = "env")]
    pub use dotenv;
    pub use http;
    pub use serde_json;
    pub use tokio;
}

pub type SendableError = Box<dyn std::error::Error + Send + Sync>;

pub const DEFAULT_PORT: u16 = 42000;

static HTTP_SERVER_PORT: AtomicU16 = AtomicU16::new(0);

/// Port of the most recently bound server, for service discovery.
pub fn http_server_port() -> Option<u16> {
    match HTTP_SERVER_PORT.load(Ordering::Relaxed) {
        0 => None,
        port => Some(port),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub no_delay: bool,
    pub read_buffer_size: usize,
    /// Value of the `Server` response header.
    pub server_name: String,
    #[serde(skip)]
    pub current_client_addr: Option<SocketAddr>,
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl Options {
    pub fn new() -> Options {
        let mut _options = Options {
            no_delay: true,
            read_buffer_size: 4096,
            server_name: connection::DEFAULT_SERVER_NAME.to_owned(),
            current_client_addr: None,
        };

        #[cfg(feature = "env")]
        {
            use std::env;
            if let Ok(data) = env::var("NO_DELAY") {
                // true, false
                if let Ok(data) = data.parse::<bool>() {
                    _options.no_delay = data;
                }
            }

            if let Ok(data) = env::var("READ_BUFFER_SIZE") {
                if let Ok(data) = usize::from_str(&data) {
                    _options.read_buffer_size = data.max(1);
                }
            }

            if let Ok(data) = env::var("SERVER_NAME") {
                if !data.is_empty() {
                    _options.server_name = data;
                }
            }
        }

        _options
    }

    /// Options from a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Options, SendableError> {
        Ok(serde_json::from_str(json)?)
    }

    /// IP of the client most recently accepted with these options, or an
    /// empty string before the first accept.
    pub fn get_request_ip(&self) -> String {
        match &self.current_client_addr {
            Some(addr) => addr.ip().to_string(),
            None => "".into(),
        }
    }
}

pub struct Server {
    pub listener: TcpListener,
    pub options: Options,
    pub router: Arc<Router>,
}

impl Server {
    pub async fn new(address: &str, router: Arc<Router>) -> Result<Server, SendableError> {
        Self::with_options(address, router, Options::new()).await
    }

    pub async fn with_options(
        address: &str,
        router: Arc<Router>,
        options: Options,
    ) -> Result<Server, SendableError> {
        let listener = TcpListener::bind(address).await?;
        let port = listener.local_addr()?.port();
        HTTP_SERVER_PORT.store(port, Ordering::Relaxed);
        info!(%address, port, routes = router.routes().len(), "http server listening");

        Ok(Server {
            listener,
            options,
            router,
        })
    }

    pub fn port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub async fn accept(&mut self) -> Result<Accept, SendableError> {
        let (stream, addr) = match self.listener.accept().await {
            Ok(data) => data,
            Err(e) => {
                if is_connection_error(&e) {
                    return Err(e.into());
                }
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                return Err(e.into());
            }
        };
        debug!(peer = %addr, "accepted");
        self.options.current_client_addr = Some(addr);
        Ok(Accept::new(
            stream,
            self.options.clone(),
            Arc::clone(&self.router),
        ))
    }

    /// Accept forever, one task per connection.
    pub async fn run(mut self) {
        loop {
            match self.accept().await {
                Ok(accept) => {
                    tokio::spawn(async move {
                        let peer = accept.option.get_request_ip();
                        if let Err(e) = accept.serve().await {
                            debug!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => debug!(error = %e, "accept error"),
            }
        }
    }
}

pub struct Accept {
    pub tcp_stream: TcpStream,
    pub option: Options,
    pub router: Arc<Router>,
}

impl Accept {
    pub fn new(tcp_stream: TcpStream, option: Options, router: Arc<Router>) -> Self {
        Self {
            tcp_stream,
            option,
            router,
        }
    }

    pub async fn serve(self) -> Result<(), Error> {
        self.tcp_stream.serve_http(self.router, &self.option).await
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
