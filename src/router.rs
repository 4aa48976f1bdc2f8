//! Route registry.
//!
//! Routes are registered once through [`RouterBuilder`] before the listener
//! opens, then frozen into an immutable [`Router`] shared read-only by every
//! connection. Entries are kept sorted by descending prefix length, so the
//! first prefix that matches is also the most specific one.

use std::fmt;
use std::sync::Arc;

use crate::connection::{Command, Connection};
use crate::websocket::Opcode;
use crate::SendableError;

/// What a plain HTTP handler asks the connection to do once it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// The handler queued its own response.
    Done,
    /// Reply with this status. `200` sends a plain-text `OK`, `0` is the
    /// same as [`Reply::Done`] and anything else sends the canned error
    /// page for the code.
    Status(u16),
}

impl Reply {
    pub const OK: Reply = Reply::Status(200);
}

/// `Err` is a fatal internal error: it is logged and the connection is dropped.
pub type HandlerResult = Result<Reply, SendableError>;

/// Capability of a plain HTTP route.
pub trait HttpHandler: Send + Sync {
    fn handle(&self, conn: &mut Connection, remainder: Option<&str>, cmd: Command)
        -> HandlerResult;
}

/// Adapter turning a closure into an [`HttpHandler`], see [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap a closure as an [`HttpHandler`].
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut Connection, Option<&str>, Command) -> HandlerResult + Send + Sync,
{
    FnHandler(f)
}

impl<F> HttpHandler for FnHandler<F>
where
    F: Fn(&mut Connection, Option<&str>, Command) -> HandlerResult + Send + Sync,
{
    fn handle(
        &self,
        conn: &mut Connection,
        remainder: Option<&str>,
        cmd: Command,
    ) -> HandlerResult {
        (self.0)(conn, remainder, cmd)
    }
}

/// Capability of a WebSocket route.
///
/// Per-socket state belongs in the connection's opaque slot
/// ([`Connection::set_opaque`]), which every callback can reach.
pub trait WebSocketHandler: Send + Sync {
    /// Runs before the `101` reply. An `Err` aborts the upgrade and is sent
    /// back as that HTTP status.
    fn on_init(&self, _conn: &mut Connection) -> Result<(), u16> {
        Ok(())
    }

    /// Every inbound frame except pings, which are answered automatically.
    fn on_frame(&self, conn: &mut Connection, opcode: Opcode, payload: &[u8]);

    /// Runs exactly once when an upgraded connection goes away.
    fn on_close(&self, _conn: &mut Connection) {}
}

#[derive(Clone)]
pub enum RouteKind {
    Http {
        handler: Arc<dyn HttpHandler>,
        leaf: bool,
    },
    WebSocket(Arc<dyn WebSocketHandler>),
}

#[derive(Clone)]
pub struct Route {
    path: String,
    kind: RouteKind,
}

impl Route {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> &RouteKind {
        &self.kind
    }

    /// Leaf routes refuse a sub-path remainder. WebSocket routes always are.
    pub fn is_leaf(&self) -> bool {
        match &self.kind {
            RouteKind::Http { leaf, .. } => *leaf,
            RouteKind::WebSocket(_) => true,
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.kind, RouteKind::WebSocket(_))
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.path)
            .field("leaf", &self.is_leaf())
            .field("websocket", &self.is_websocket())
            .finish()
    }
}

/// A route matched against a request URL.
#[derive(Debug, Clone, Copy)]
pub struct Resolved<'a> {
    pub route: &'a Route,
    /// Path after the prefix and its `/`, without the query string.
    pub remainder: Option<&'a str>,
    /// Everything after the `?`.
    pub query: Option<&'a str>,
}

#[derive(Default)]
pub struct RouterBuilder {
    routes: Vec<Route>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain HTTP handler under `prefix`.
    ///
    /// Equal-length prefixes keep their registration order.
    pub fn add_route<H>(mut self, prefix: &str, leaf: bool, handler: H) -> Self
    where
        H: HttpHandler + 'static,
    {
        let at = self
            .routes
            .iter()
            .position(|r| r.path.len() < prefix.len())
            .unwrap_or(self.routes.len());
        self.routes.insert(
            at,
            Route {
                path: prefix.to_owned(),
                kind: RouteKind::Http {
                    handler: Arc::new(handler),
                    leaf,
                },
            },
        );
        self
    }

    /// Register a WebSocket endpoint under `prefix`, ahead of any route of
    /// the same length.
    pub fn add_websocket_route<W>(mut self, prefix: &str, handler: W) -> Self
    where
        W: WebSocketHandler + 'static,
    {
        let at = self
            .routes
            .iter()
            .position(|r| r.path.len() <= prefix.len())
            .unwrap_or(self.routes.len());
        self.routes.insert(
            at,
            Route {
                path: prefix.to_owned(),
                kind: RouteKind::WebSocket(Arc::new(handler)),
            },
        );
        self
    }

    pub fn build(self) -> Arc<Router> {
        Arc::new(Router {
            routes: self.routes,
        })
    }
}

/// Frozen route table.
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Find the most specific route for `url`.
    ///
    /// A prefix only matches on a segment boundary: the URL must end right
    /// after it or continue with `/` or `?`, so `/foo` never matches `/foobar`.
    pub fn resolve<'a>(&'a self, url: &'a str) -> Option<Resolved<'a>> {
        self.routes.iter().find_map(|route| {
            let rest = url.strip_prefix(route.path.as_str())?;
            let (remainder, query) = match rest.as_bytes().first() {
                None => (None, None),
                Some(b'?') => (None, Some(&rest[1..])),
                Some(b'/') => {
                    let after = &rest[1..];
                    match after.strip_prefix('?') {
                        Some(query) => (None, Some(query)),
                        None => match after.split_once('?') {
                            Some((remainder, query)) => (Some(remainder), Some(query)),
                            None => (Some(after), None),
                        },
                    }
                }
                Some(_) => return None,
            };
            Some(Resolved {
                route,
                remainder,
                query,
            })
        })
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.routes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> FnHandler<impl Fn(&mut Connection, Option<&str>, Command) -> HandlerResult> {
        handler_fn(|_, _, _| Ok(Reply::OK))
    }

    struct Silent;

    impl WebSocketHandler for Silent {
        fn on_frame(&self, _conn: &mut Connection, _opcode: Opcode, _payload: &[u8]) {}
    }

    fn paths(router: &Router) -> Vec<&str> {
        router.routes().iter().map(Route::path).collect()
    }

    #[test]
    fn longest_prefix_wins() {
        let router = Router::builder()
            .add_route("/a", false, noop())
            .add_route("/a/b", false, noop())
            .build();

        let resolved = router.resolve("/a/b/c").unwrap();
        assert_eq!(resolved.route.path(), "/a/b");
        assert_eq!(resolved.remainder, Some("c"));
        assert_eq!(resolved.query, None);

        let resolved = router.resolve("/a/x").unwrap();
        assert_eq!(resolved.route.path(), "/a");
        assert_eq!(resolved.remainder, Some("x"));
    }

    #[test]
    fn prefix_must_end_on_a_boundary() {
        let router = Router::builder().add_route("/a", false, noop()).build();
        assert!(router.resolve("/ab").is_none());
        assert!(router.resolve("/b").is_none());
        assert!(router.resolve("/a").is_some());
    }

    #[test]
    fn query_string_is_split_off() {
        let router = Router::builder().add_route("/api", false, noop()).build();

        let r = router.resolve("/api?x=1").unwrap();
        assert_eq!((r.remainder, r.query), (None, Some("x=1")));

        let r = router.resolve("/api/?x=1").unwrap();
        assert_eq!((r.remainder, r.query), (None, Some("x=1")));

        let r = router.resolve("/api/items/7?x=1&y=2").unwrap();
        assert_eq!((r.remainder, r.query), (Some("items/7"), Some("x=1&y=2")));

        let r = router.resolve("/api/").unwrap();
        assert_eq!((r.remainder, r.query), (Some(""), None));
    }

    #[test]
    fn registration_order_is_by_descending_length_then_insertion() {
        let router = Router::builder()
            .add_route("/x", true, noop())
            .add_route("/long", false, noop())
            .add_route("/y", false, noop())
            .add_websocket_route("/y", Silent)
            .add_route("/zz", false, noop())
            .build();

        assert_eq!(paths(&router), vec!["/long", "/zz", "/y", "/x", "/y"]);
        assert!(router.routes()[2].is_websocket());
        assert!(router.resolve("/y").unwrap().route.is_websocket());
    }

    #[test]
    fn websocket_routes_are_leaves() {
        let router = Router::builder().add_websocket_route("/ws", Silent).build();
        assert!(router.routes()[0].is_leaf());
    }
}
