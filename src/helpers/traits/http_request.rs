use serde_json::{Map, Value};

use crate::connection::Connection;
use crate::helpers::HeaderList;
use crate::SendableError;

/// Read-side accessors handlers use on the request being dispatched.
pub trait RequestUtils {
    /// Request header, case-insensitive.
    fn header(&self, name: &str) -> Option<&str>;
    /// Query-string or form argument.
    fn arg(&self, name: &str) -> Option<&str>;
    fn headers(&self) -> &HeaderList;
    fn args(&self) -> &HeaderList;
    /// POST body as text, lossily decoded. Empty when there is no body.
    fn get_text(&self) -> String;
    /// POST body parsed as JSON. An empty body reads as `{}`.
    fn get_json(&self) -> Result<Value, SendableError>;
    /// All arguments as a JSON object; later duplicates win.
    fn args_to_json(&self) -> Map<String, Value>;
}

impl RequestUtils for Connection {
    fn header(&self, name: &str) -> Option<&str> {
        self.request_headers.get(name)
    }

    fn arg(&self, name: &str) -> Option<&str> {
        self.req_args.get(name)
    }

    fn headers(&self) -> &HeaderList {
        &self.request_headers
    }

    fn args(&self) -> &HeaderList {
        &self.req_args
    }

    fn get_text(&self) -> String {
        self.post_data()
            .map(|body| String::from_utf8_lossy(body).into_owned())
            .unwrap_or_default()
    }

    fn get_json(&self) -> Result<Value, SendableError> {
        match self.post_data() {
            Some(body) if !body.is_empty() => Ok(serde_json::from_slice(body)?),
            _ => Ok(Value::Object(Map::new())),
        }
    }

    fn args_to_json(&self) -> Map<String, Value> {
        self.req_args
            .iter()
            .map(|(key, value)| (key.to_owned(), Value::String(value.to_owned())))
            .collect()
    }
}
