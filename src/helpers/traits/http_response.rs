use std::fmt::Display;
use std::time::{Duration, SystemTime};

use tracing::error;

use crate::connection::{version_str, Connection};
use crate::helpers::HeaderList;

fn push_header(head: &mut String, name: &str, value: impl Display) {
    head.push_str(&format!("{name}: {value}\r\n"));
}

/// Reason phrase for `code`. Unmapped codes are accepted as-is.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "Ok",
        302 => "Found",
        400 => "Bad request",
        401 => "Unauthorized",
        404 => "Not found",
        405 => "Method not allowed",
        412 => "Precondition failed",
        415 => "Unsupported media type",
        500 => "Internal Server Error",
        501 => "Not implemented",
        _ => "Unknown returncode",
    }
}

/// Minimal HTML page for an error reply.
pub fn error_page(code: u16, detail: &str) -> String {
    let reason = reason_phrase(code);
    format!(
        "<!DOCTYPE HTML PUBLIC \"-//IETF//DTD HTML 2.0//EN\">\r\n\
         <HTML><HEAD>\r\n\
         <TITLE>{code} {reason}</TITLE>\r\n\
         </HEAD><BODY>\r\n\
         <H1>{code} {reason}</H1>\r\n\
         <p>{detail}</p>\r\n\
         </BODY></HTML>\r\n"
    )
}

pub fn redirect_page(location: &str) -> String {
    format!(
        "<!DOCTYPE HTML PUBLIC \"-//IETF//DTD HTML 2.0//EN\">\r\n\
         <HTML><HEAD>\r\n\
         <TITLE>Redirect</TITLE>\r\n\
         </HEAD><BODY>\r\n\
         Please follow <a href=\"{location}\">{location}</a>\r\n\
         </BODY></HTML>\r\n"
    )
}

pub trait ResponseUtil {
    /// Extra header sent with the next reply built by `send_reply`.
    fn set_response_header(&mut self, name: &str, value: &str);

    /// Status line, exactly `headers`, then `body`. Nothing else is added.
    fn send_raw(&mut self, code: u16, reason: &str, headers: &HeaderList, body: Option<&[u8]>);

    /// Full reply with the standard header set. `code` 0 means 200 and
    /// `maxage` 0 disables caching.
    fn send_reply(
        &mut self,
        code: u16,
        content_type: Option<&str>,
        encoding: Option<&str>,
        location: Option<&str>,
        maxage: u32,
        body: &[u8],
    );

    /// Canned HTML error page, with `detail` as its paragraph.
    fn error(&mut self, code: u16, detail: Option<&str>);

    /// `302 Found` pointing at `location`.
    fn redirect(&mut self, location: &str);
}

impl ResponseUtil for Connection {
    fn set_response_header(&mut self, name: &str, value: &str) {
        self.response_headers.add(name, value);
    }

    fn send_raw(&mut self, code: u16, reason: &str, headers: &HeaderList, body: Option<&[u8]>) {
        let mut head = format!("{} {} {}\r\n", version_str(self.version), code, reason);
        for (name, value) in headers.iter() {
            push_header(&mut head, name, value);
        }
        head.push_str("\r\n");
        self.output.extend_from_slice(head.as_bytes());

        if let Some(body) = body {
            if !self.no_output {
                self.output.extend_from_slice(body);
            }
        }
    }

    fn send_reply(
        &mut self,
        code: u16,
        content_type: Option<&str>,
        encoding: Option<&str>,
        location: Option<&str>,
        maxage: u32,
        body: &[u8],
    ) {
        let code = if code == 0 { 200 } else { code };
        let now = SystemTime::now();

        let mut head = format!(
            "{} {} {}\r\n",
            version_str(self.version),
            code,
            reason_phrase(code)
        );
        push_header(&mut head, "Server", &self.server_name);
        push_header(&mut head, "Date", httpdate::fmt_http_date(now));

        if maxage == 0 {
            head.push_str("Cache-Control: no-cache\r\n");
        } else {
            let expires = now + Duration::from_secs(u64::from(maxage));
            push_header(&mut head, "Last-Modified", httpdate::fmt_http_date(now));
            push_header(&mut head, "Expires", httpdate::fmt_http_date(expires));
            push_header(&mut head, "Cache-Control", format_args!("max-age={maxage}"));
        }

        let connection = if self.keep_alive { "Keep-Alive" } else { "Close" };
        push_header(&mut head, "Connection", connection);

        if let Some(encoding) = encoding {
            push_header(&mut head, "Content-Encoding", encoding);
        }
        if let Some(location) = location {
            push_header(&mut head, "Location", location);
        }
        if let Some(content_type) = content_type {
            push_header(&mut head, "Content-Type", content_type);
        }
        push_header(&mut head, "Content-Length", body.len());

        for (name, value) in self.response_headers.iter() {
            push_header(&mut head, name, value);
        }
        head.push_str("\r\n");

        self.output.extend_from_slice(head.as_bytes());
        if !self.no_output {
            self.output.extend_from_slice(body);
        }
    }

    fn error(&mut self, code: u16, detail: Option<&str>) {
        let detail = detail.unwrap_or_default();
        if detail.is_empty() {
            error!("{} {}", code, self.url_orig());
        } else {
            error!("{} {} -- {}", code, self.url_orig(), detail);
        }

        let page = error_page(code, detail);
        self.send_reply(code, Some("text/html"), None, None, 0, page.as_bytes());
    }

    fn redirect(&mut self, location: &str) {
        let page = redirect_page(location);
        self.send_reply(302, Some("text/html"), None, Some(location), 0, page.as_bytes());
    }
}
