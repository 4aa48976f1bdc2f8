use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::connection::{Connection, Flow, State};
use crate::error::Error;
use crate::router::Router;
use crate::websocket::{Frame, PushReceiver};
use crate::Options;

/// Drives an accepted socket through the protocol core.
#[async_trait]
pub trait StreamHttp {
    async fn serve_http(self, router: Arc<Router>, options: &Options) -> Result<(), Error>;
}

#[async_trait]
impl StreamHttp for TcpStream {
    async fn serve_http(mut self, router: Arc<Router>, options: &Options) -> Result<(), Error> {
        self.set_nodelay(options.no_delay)?;

        let local_addr = self.local_addr().ok();
        let remote_addr = self.peer_addr().ok();
        let mut conn = Connection::with_options(router, options, local_addr, remote_addr);
        let mut input = BytesMut::with_capacity(options.read_buffer_size);

        let mut pushed = conn.take_push_receiver();

        let result = loop {
            input.reserve(options.read_buffer_size);
            let wake = tokio::select! {
                read = self.read_buf(&mut input) => Wake::Read(read),
                Some(frame) = next_pushed(&mut pushed), if conn.state() == State::WebSocket => {
                    Wake::Push(frame)
                }
            };

            let flow = match wake {
                Wake::Read(Ok(0)) => break Ok(()),
                Wake::Read(Ok(_)) => conn.feed(&mut input),
                Wake::Read(Err(e)) => break Err(Error::from(e)),
                Wake::Push(frame) => Ok(conn.push_frame(frame)),
            };

            let output = conn.take_output();
            if !output.is_empty() {
                if let Err(e) = self.write_all(&output).await {
                    break Err(Error::from(e));
                }
            }

            match flow {
                Ok(Flow::Continue) => continue,
                Ok(Flow::Close) => break Ok(()),
                Err(e) => {
                    warn!(peer = ?remote_addr, error = %e, "dropping connection");
                    break Err(e);
                }
            }
        };

        let _ = self.shutdown().await;
        conn.close();
        debug!(peer = ?remote_addr, "connection closed");
        result
    }
}

enum Wake {
    Read(io::Result<usize>),
    Push(Frame),
}

async fn next_pushed(pushed: &mut Option<PushReceiver>) -> Option<Frame> {
    match pushed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
