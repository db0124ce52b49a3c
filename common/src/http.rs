//! Request parsing, routing and response rendering for the control-panel server.
//!
//! Parsing is permissive: malformed lines, overflowing headers and odd bodies are absorbed
//! through [`crate::policy`] instead of failing the request.

use std::io::{self, BufRead, ErrorKind, Read, Write};

use log::{debug, warn};

use crate::{
    config::{Capabilities, ControllerConfig},
    policy::{Malformed, Recovery, RecoveryPolicy},
    state::ControllerState,
    types::StatusBody,
};

pub const HEADER_CAPACITY: usize = 10;
pub const MAX_LINE_BYTES: usize = 512;
pub const MAX_BODY_BYTES: usize = 1024;

pub const SNAPSHOT_PATH: &str = "/data";
pub const THRESHOLD_PATH: &str = "/updateThreshold";
pub const THRESHOLD_FIELD: &str = "heaterThreshold=";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored,
    Dropped,
}

/// Fixed-capacity header store. The first `capacity` headers are kept; later ones are
/// dropped, so a repeated key keeps its first value.
#[derive(Debug, Clone)]
pub struct HeaderTable {
    entries: Vec<(String, String)>,
    capacity: usize,
}

impl Default for HeaderTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderTable {
    pub fn new() -> Self {
        Self::with_capacity(HEADER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn insert(&mut self, key: &str, value: &str) -> InsertOutcome {
        if self.is_full() {
            warn!(
                "header table full ({} entries), dropping `{key}`",
                self.capacity
            );
            return InsertOutcome::Dropped;
        }

        self.entries.push((key.to_string(), value.to_string()));
        InsertOutcome::Stored
    }

    /// Case-insensitive lookup returning the first stored value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }
}

/// Splits `Name: value` at the first colon. The value starts two characters after the
/// colon; lines without a name yield `None`.
pub fn parse_header_line(line: &str) -> Option<(&str, &str)> {
    match line.find(':') {
        Some(colon) if colon > 0 => {
            let value = line.get(colon + 2..).unwrap_or("");
            Some((&line[..colon], value))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Other,
}

impl Method {
    pub fn parse(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub target: String,
    pub version: String,
    pub headers: HeaderTable,
    pub body: Vec<u8>,
    /// Set when the recovery policy rejected the request while it was being read.
    pub rejected: Option<Malformed>,
}

impl Request {
    /// Reads one request under the default [`RecoveryPolicy`].
    pub fn read<R: BufRead>(reader: &mut R) -> Option<Self> {
        Self::read_with(reader, &RecoveryPolicy::default())
    }

    /// Reads one request. Returns `None` only when the peer sent nothing at all; read
    /// errors after the request line end the current phase and keep what arrived.
    pub fn read_with<R: BufRead>(reader: &mut R, policy: &RecoveryPolicy) -> Option<Self> {
        let request_line = read_line(reader)?;
        let mut parts = request_line.split_whitespace();
        let method = Method::parse(parts.next().unwrap_or(""));
        let target = parts.next().unwrap_or("/").to_string();
        let version = parts.next().unwrap_or("").to_string();

        let mut headers = HeaderTable::new();
        let mut content_length = None;
        let mut skip_body = false;
        let mut rejected = None;
        while let Some(line) = read_line(reader) {
            if line.is_empty() {
                break;
            }

            let problem = match parse_header_line(&line) {
                None => {
                    debug!("header line without name: {line:?}");
                    Some(Malformed::HeaderWithoutName)
                }
                Some((key, value)) => {
                    // Framing is tracked even when the table has no room left. First value wins.
                    if content_length.is_none() && key.eq_ignore_ascii_case("Content-Length") {
                        content_length = Some(value.trim().parse::<usize>());
                    }
                    match headers.insert(key, value) {
                        InsertOutcome::Stored => None,
                        InsertOutcome::Dropped => Some(Malformed::HeaderTableFull),
                    }
                }
            };

            let Some(case) = problem else {
                continue;
            };
            match policy.recovery_for(case) {
                Recovery::SkipLine | Recovery::DropHeader | Recovery::UseValue(_) => {}
                Recovery::EmptyBody => {
                    skip_body = true;
                    break;
                }
                Recovery::RejectUnchanged => {
                    rejected = Some(case);
                    break;
                }
            }
        }

        let body_len = match content_length {
            _ if skip_body || rejected.is_some() => 0,
            Some(Ok(len)) => len.min(MAX_BODY_BYTES),
            Some(Err(_)) => match policy.recovery_for(Malformed::ContentLengthInvalid) {
                Recovery::UseValue(len) => (len.max(0.0) as usize).min(MAX_BODY_BYTES),
                Recovery::RejectUnchanged => {
                    rejected = Some(Malformed::ContentLengthInvalid);
                    0
                }
                Recovery::SkipLine | Recovery::DropHeader | Recovery::EmptyBody => 0,
            },
            None => 0,
        };

        let mut body = Vec::with_capacity(body_len);
        if body_len > 0 {
            if let Err(err) = reader.by_ref().take(body_len as u64).read_to_end(&mut body) {
                debug!("body read ended after {} bytes: {err}", body.len());
            }
        }

        Some(Self {
            method,
            target,
            version,
            headers,
            body,
            rejected,
        })
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Reads up to and including `\n`, keeping at most [`MAX_LINE_BYTES`] and discarding the
/// rest of an overlong line.
fn read_line<R: BufRead>(reader: &mut R) -> Option<String> {
    let mut raw = Vec::new();
    let mut saw_input = false;

    loop {
        let available = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!("request read stopped: {err}");
                break;
            }
        };
        if available.is_empty() {
            break;
        }
        saw_input = true;

        let (used, done) = match available.iter().position(|byte| *byte == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        let room = MAX_LINE_BYTES.saturating_sub(raw.len());
        raw.extend_from_slice(&available[..used.min(room)]);
        reader.consume(used);

        if done {
            break;
        }
    }

    if !saw_input {
        return None;
    }

    let line = String::from_utf8_lossy(&raw);
    Some(line.trim_end_matches(['\r', '\n']).to_string())
}

/// True once `buf` holds the full header block plus the announced body, capped at
/// [`MAX_BODY_BYTES`].
pub fn request_is_complete(buf: &[u8]) -> bool {
    let Some(header_end) = find_header_end(buf) else {
        return false;
    };

    let head = String::from_utf8_lossy(&buf[..header_end]);
    let body_len = head
        .lines()
        .filter_map(parse_header_line)
        .find(|(key, _)| key.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0)
        .min(MAX_BODY_BYTES);

    buf.len() >= header_end + body_len
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4);
    let lf = buf
        .windows(2)
        .position(|window| window == b"\n\n")
        .map(|pos| pos + 2);

    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Page,
    Snapshot,
    UpdateThreshold,
}

impl Route {
    pub fn resolve(method: Method, target: &str) -> Self {
        if target.starts_with(SNAPSHOT_PATH) {
            Self::Snapshot
        } else if target.starts_with(THRESHOLD_PATH) && method == Method::Post {
            Self::UpdateThreshold
        } else {
            Self::Page
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdField {
    Parsed(f32),
    /// Field present but its value is not a finite number.
    Unparsable,
    Missing,
}

/// Locates `heaterThreshold=` and parses the number that follows it.
pub fn parse_threshold_field(body: &str) -> ThresholdField {
    let Some(start) = body.find(THRESHOLD_FIELD) else {
        return ThresholdField::Missing;
    };

    let raw = &body[start + THRESHOLD_FIELD.len()..];
    match parse_leading_float(raw) {
        Some(value) => ThresholdField::Parsed(value),
        None => ThresholdField::Unparsable,
    }
}

/// Parses the longest numeric prefix, so `21.5&submit=Set` reads as `21.5`. Values that
/// overflow `f32` count as unparsable.
fn parse_leading_float(text: &str) -> Option<f32> {
    let text = text.trim_start();
    let end = text
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E')))
        .unwrap_or(text.len());
    let candidate = &text[..end];

    (1..=candidate.len())
        .rev()
        .find_map(|len| candidate[..len].parse::<f32>().ok())
        .filter(|value| value.is_finite())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Text,
    Html,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Text => "text/plain",
            Self::Html => "text/html",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: &'static str,
    pub content_type: ContentType,
    pub body: Vec<u8>,
}

impl Response {
    pub fn ok(content_type: ContentType, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            reason: "OK",
            content_type,
            body: body.into(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self {
            status: 400,
            reason: "Bad Request",
            content_type: ContentType::Text,
            body: message.as_bytes().to_vec(),
        }
    }

    pub fn internal_error(message: &str) -> Self {
        Self {
            status: 500,
            reason: "Internal Server Error",
            content_type: ContentType::Text,
            body: message.as_bytes().to_vec(),
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write!(
            writer,
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nConnection: close\r\n\r\n",
            self.status,
            self.reason,
            self.content_type.as_str()
        )?;
        writer.write_all(&self.body)?;
        writer.flush()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 96);
        // Writing into a Vec cannot fail.
        let _ = self.write_to(&mut out);
        out
    }
}

/// Dispatches parsed requests against the controller state.
#[derive(Debug, Clone)]
pub struct RequestHandler {
    capabilities: Capabilities,
    threshold_unit: String,
    page: &'static str,
    policy: RecoveryPolicy,
}

impl RequestHandler {
    pub fn new(config: &ControllerConfig, page: &'static str) -> Self {
        Self {
            capabilities: config.variant.capabilities(),
            threshold_unit: config.threshold_unit.clone(),
            page,
            policy: RecoveryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn handle(&self, request: &Request, state: &mut ControllerState) -> Response {
        let route = Route::resolve(request.method, &request.target);
        debug!(
            "{} {} ({:?}) host={:?} headers={}",
            request.method.as_str(),
            request.target,
            route,
            request.headers.get("Host"),
            request.headers.len()
        );

        let response = match (request.rejected, route) {
            (Some(case), _) => Response::bad_request(case.message()),
            (None, Route::Snapshot) => self.serve_snapshot(state),
            (None, Route::UpdateThreshold) => self.update_threshold(&request.body_text(), state),
            (None, Route::Page) => Response::ok(ContentType::Html, self.page),
        };

        debug!("{} {} -> {}", request.method.as_str(), request.target, response.status);
        response
    }

    pub fn serve_snapshot(&self, state: &ControllerState) -> Response {
        let body = StatusBody::new(&state.snapshot(), self.capabilities);
        match serde_json::to_vec(&body) {
            Ok(json) => Response::ok(ContentType::Json, json),
            Err(err) => {
                warn!("snapshot serialization failed: {err}");
                Response::internal_error("snapshot unavailable")
            }
        }
    }

    pub fn update_threshold(&self, body: &str, state: &mut ControllerState) -> Response {
        let case = match parse_threshold_field(body) {
            ThresholdField::Parsed(value) => return self.apply_threshold(value, state),
            ThresholdField::Unparsable => Malformed::ThresholdUnparsable,
            ThresholdField::Missing => Malformed::ThresholdMissing,
        };

        match self.policy.recovery_for(case) {
            Recovery::UseValue(value) => self.apply_threshold(value, state),
            Recovery::RejectUnchanged
            | Recovery::SkipLine
            | Recovery::DropHeader
            | Recovery::EmptyBody => Response::bad_request(case.message()),
        }
    }

    fn apply_threshold(&self, value: f32, state: &mut ControllerState) -> Response {
        state.set_threshold(value);
        Response::ok(
            ContentType::Text,
            format!("Threshold updated to: {value:.2}{}", self.threshold_unit),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::Variant;

    const PAGE: &str = "<html><body>panel</body></html>";

    fn handler() -> RequestHandler {
        RequestHandler::new(&ControllerConfig::default(), PAGE)
    }

    fn read(raw: &str) -> Request {
        Request::read(&mut Cursor::new(raw.as_bytes().to_vec())).unwrap()
    }

    fn read_under(raw: &str, policy: &RecoveryPolicy) -> Request {
        Request::read_with(&mut Cursor::new(raw.as_bytes().to_vec()), policy).unwrap()
    }

    fn round_trip(raw: &str, state: &mut ControllerState) -> String {
        let request = read(raw);
        let response = handler().handle(&request, state);
        String::from_utf8(response.to_bytes()).unwrap()
    }

    #[test]
    fn splits_header_line_after_colon_and_space() {
        assert_eq!(
            parse_header_line("Host: example.com"),
            Some(("Host", "example.com"))
        );
    }

    #[test]
    fn header_value_skips_exactly_two_characters() {
        assert_eq!(parse_header_line("X-Tight:value"), Some(("X-Tight", "alue")));
        assert_eq!(parse_header_line("Empty:"), Some(("Empty", "")));
        assert_eq!(parse_header_line("Url: http://a:b"), Some(("Url", "http://a:b")));
    }

    #[test]
    fn header_line_without_name_is_rejected() {
        assert_eq!(parse_header_line("no colon here"), None);
        assert_eq!(parse_header_line(": orphan"), None);
        assert_eq!(parse_header_line(""), None);
    }

    #[test]
    fn eleventh_header_is_dropped() {
        let mut table = HeaderTable::new();
        for index in 0..HEADER_CAPACITY {
            assert_eq!(
                table.insert(&format!("X-{index}"), "v"),
                InsertOutcome::Stored
            );
        }

        assert_eq!(table.insert("X-overflow", "v"), InsertOutcome::Dropped);
        assert_eq!(table.len(), 10);
        assert_eq!(table.get("X-overflow"), None);
    }

    #[test]
    fn duplicate_key_keeps_first_value() {
        let mut table = HeaderTable::new();
        table.insert("Accept", "text/html");
        table.insert("accept", "application/json");

        assert_eq!(table.get("ACCEPT"), Some("text/html"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn reads_request_line_headers_and_body() {
        let request = read(
            "POST /updateThreshold HTTP/1.1\r\nHost: 192.168.1.50\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 20\r\n\r\nheaterThreshold=21.5",
        );

        assert_eq!(request.method, Method::Post);
        assert_eq!(request.target, "/updateThreshold");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.headers.get("host"), Some("192.168.1.50"));
        assert_eq!(request.body_text(), "heaterThreshold=21.5");
    }

    #[test]
    fn malformed_header_lines_are_skipped() {
        let request = read("GET / HTTP/1.1\r\ngarbage\r\n: nameless\r\nHost: h\r\n\r\n");

        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.headers.get("Host"), Some("h"));
    }

    #[test]
    fn headers_past_capacity_are_dropped_but_parsing_continues() {
        let mut raw = String::from("POST /updateThreshold HTTP/1.1\r\n");
        for index in 0..12 {
            raw.push_str(&format!("X-Filler-{index}: {index}\r\n"));
        }
        raw.push_str("Content-Length: 19\r\n\r\nheaterThreshold=7.5");

        let request = read(&raw);

        assert_eq!(request.headers.len(), HEADER_CAPACITY);
        assert_eq!(request.headers.get("Content-Length"), None);
        assert_eq!(request.body_text(), "heaterThreshold=7.5");
    }

    #[test]
    fn headers_end_at_input_exhaustion() {
        let request = read("GET /data HTTP/1.1\r\nHost: h");

        assert_eq!(request.target, "/data");
        assert_eq!(request.headers.get("Host"), Some("h"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn invalid_content_length_means_empty_body() {
        let request = read(
            "POST /updateThreshold HTTP/1.1\r\nContent-Length: many\r\n\r\nheaterThreshold=3",
        );

        assert!(request.body.is_empty());
    }

    #[test]
    fn duplicate_content_length_keeps_first_value() {
        let raw = "POST /x HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 10\r\n\r\nabcdefghij";

        let request = read(raw);

        assert_eq!(request.body, b"abc");
        assert_eq!(request.headers.get("Content-Length"), Some("3"));
        assert!(request_is_complete(&raw.as_bytes()[..raw.len() - 7]));
    }

    #[test]
    fn short_body_keeps_what_arrived() {
        let request = read("POST /x HTTP/1.1\r\nContent-Length: 100\r\n\r\nabc");

        assert_eq!(request.body, b"abc");
    }

    #[test]
    fn overlong_line_is_truncated_without_spilling_into_next_line() {
        let long_value = "a".repeat(MAX_LINE_BYTES * 2);
        let request = read(&format!(
            "GET / HTTP/1.1\r\nX-Long: {long_value}\r\nHost: h\r\n\r\n"
        ));

        assert_eq!(request.headers.len(), 2);
        assert_eq!(request.headers.get("Host"), Some("h"));
    }

    #[test]
    fn empty_connection_yields_no_request() {
        assert!(Request::read(&mut Cursor::new(Vec::new())).is_none());
    }

    #[test]
    fn routes_by_prefix_and_method() {
        assert_eq!(Route::resolve(Method::Get, "/data"), Route::Snapshot);
        assert_eq!(Route::resolve(Method::Get, "/data?ts=1"), Route::Snapshot);
        assert_eq!(
            Route::resolve(Method::Post, "/updateThreshold"),
            Route::UpdateThreshold
        );
        assert_eq!(Route::resolve(Method::Get, "/updateThreshold"), Route::Page);
        assert_eq!(Route::resolve(Method::Get, "/"), Route::Page);
        assert_eq!(Route::resolve(Method::Get, "/favicon.ico"), Route::Page);
    }

    #[test]
    fn threshold_field_parsing() {
        assert_eq!(
            parse_threshold_field("heaterThreshold=21.5"),
            ThresholdField::Parsed(21.5)
        );
        assert_eq!(
            parse_threshold_field("heaterThreshold=19&submit=Set"),
            ThresholdField::Parsed(19.0)
        );
        assert_eq!(
            parse_threshold_field("heaterThreshold=-2.5\r\n"),
            ThresholdField::Parsed(-2.5)
        );
        assert_eq!(
            parse_threshold_field("heaterThreshold=warm"),
            ThresholdField::Unparsable
        );
        assert_eq!(
            parse_threshold_field("heaterThreshold="),
            ThresholdField::Unparsable
        );
        assert_eq!(
            parse_threshold_field("heaterThreshold=1e50"),
            ThresholdField::Unparsable
        );
        assert_eq!(parse_threshold_field("foo=bar"), ThresholdField::Missing);
    }

    #[test]
    fn post_threshold_updates_state_and_echoes_value() {
        let mut state = ControllerState::new();
        state.apply_reading(20.0, 1010.0, 80.0);

        let response = round_trip(
            "POST /updateThreshold HTTP/1.1\r\nContent-Length: 20\r\n\r\nheaterThreshold=21.5",
            &mut state,
        );

        assert_eq!(
            response,
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nThreshold updated to: 21.50"
        );
        assert_eq!(state.heater_threshold(), 21.5);
        assert!(state.heater_status());
    }

    #[test]
    fn unparsable_threshold_applies_zero() {
        let mut state = ControllerState::new();
        state.apply_reading(5.0, 1000.0, 50.0);

        let response = handler().update_threshold("heaterThreshold=abc", &mut state);

        assert_eq!(response.status, 200);
        assert_eq!(state.heater_threshold(), 0.0);
        assert!(!state.heater_status());
    }

    #[test]
    fn overflowing_threshold_falls_back_and_keeps_json_numeric() {
        let mut state = ControllerState::new();

        let response = handler().update_threshold("heaterThreshold=1e50", &mut state);
        assert_eq!(response.body, b"Threshold updated to: 0.00");
        assert_eq!(state.heater_threshold(), 0.0);

        let snapshot = handler().serve_snapshot(&state);
        let json: serde_json::Value = serde_json::from_slice(&snapshot.body).unwrap();
        assert!(json["heaterThreshold"].is_number());
    }

    #[test]
    fn missing_threshold_field_leaves_state_unchanged() {
        let mut state = ControllerState::new();
        let before = state.snapshot();

        let response = round_trip(
            "POST /updateThreshold HTTP/1.1\r\nContent-Length: 7\r\n\r\nfoo=bar",
            &mut state,
        );

        assert_eq!(
            response,
            "HTTP/1.1 400 Bad Request\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nMissing heaterThreshold"
        );
        assert_eq!(state.snapshot(), before);
    }

    #[test]
    fn threshold_confirmation_uses_configured_unit() {
        let config = ControllerConfig {
            threshold_unit: " C".to_string(),
            ..ControllerConfig::default()
        };
        let handler = RequestHandler::new(&config, PAGE);
        let mut state = ControllerState::new();

        let response = handler.update_threshold("heaterThreshold=20", &mut state);

        assert_eq!(response.body, b"Threshold updated to: 20.00 C");
    }

    #[test]
    fn data_endpoint_round_trips_snapshot() {
        let mut state = ControllerState::new();
        state.apply_reading(19.0, 1050.0, 87.0);
        state.sample_memory(&|| 1024);

        let response = handler().handle(&read("GET /data HTTP/1.1\r\n\r\n"), &mut state);
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, ContentType::Json);

        let json: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        let number = |key: &str| json[key].as_f64().unwrap();
        assert!((number("currentTemp") - 19.0).abs() < 1e-4);
        assert!((number("heaterThreshold") - 18.0).abs() < 1e-4);
        assert!((number("currentGravity") - 1.050).abs() < 1e-4);
        assert!((number("battery") - 87.0).abs() < 1e-4);
        assert_eq!(json["memory"], 1024);
        assert_eq!(json["heaterStatus"], false);
    }

    #[test]
    fn data_endpoint_writes_json_headers() {
        let mut state = ControllerState::new();
        let response = round_trip("GET /data HTTP/1.1\r\nHost: h\r\n\r\n", &mut state);

        assert!(response.starts_with(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{"
        ));
        assert!(response.ends_with(r#""battery":-1.0,"memory":-1}"#));
    }

    #[test]
    fn basic_variant_omits_battery_and_memory() {
        let config = ControllerConfig {
            variant: Variant::Basic,
            ..ControllerConfig::default()
        };
        let handler = RequestHandler::new(&config, PAGE);
        let state = ControllerState::new();

        let response = handler.serve_snapshot(&state);
        let json: serde_json::Value = serde_json::from_slice(&response.body).unwrap();

        assert!(json.get("battery").is_none());
        assert!(json.get("memory").is_none());
        assert_eq!(json.as_object().unwrap().len(), 4);
    }

    #[test]
    fn unknown_paths_serve_control_page() {
        let mut state = ControllerState::new();
        for raw in [
            "GET / HTTP/1.1\r\n\r\n",
            "GET /missing HTTP/1.1\r\n\r\n",
            "GET /updateThreshold HTTP/1.1\r\n\r\n",
        ] {
            let response = handler().handle(&read(raw), &mut state);
            assert_eq!(response.content_type, ContentType::Html);
            assert_eq!(response.body, PAGE.as_bytes());
        }
    }

    #[test]
    fn completeness_waits_for_announced_body() {
        assert!(!request_is_complete(b"GET / HTTP/1.1\r\nHost: h\r\n"));
        assert!(request_is_complete(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n"));
        assert!(!request_is_complete(
            b"POST /updateThreshold HTTP/1.1\r\nContent-Length: 20\r\n\r\nheaterThreshold"
        ));
        assert!(request_is_complete(
            b"POST /updateThreshold HTTP/1.1\r\nContent-Length: 20\r\n\r\nheaterThreshold=21.5"
        ));
        assert!(request_is_complete(b"GET / HTTP/1.0\n\n"));
    }

    #[test]
    fn threshold_recoveries_follow_the_policy() {
        let policy = RecoveryPolicy::default()
            .with(Malformed::ThresholdMissing, Recovery::UseValue(12.0))
            .with(Malformed::ThresholdUnparsable, Recovery::RejectUnchanged);
        let handler = handler().with_policy(policy);
        let mut state = ControllerState::new();

        let response = handler.update_threshold("foo=bar", &mut state);
        assert_eq!(response.status, 200);
        assert_eq!(state.heater_threshold(), 12.0);

        let response = handler.update_threshold("heaterThreshold=warm", &mut state);
        assert_eq!(response.status, 400);
        assert_eq!(response.body, b"Invalid heaterThreshold");
        assert_eq!(state.heater_threshold(), 12.0);
    }

    #[test]
    fn header_recoveries_follow_the_policy() {
        let nameless = "POST /updateThreshold HTTP/1.1\r\ngarbage\r\nContent-Length: 19\r\n\r\nheaterThreshold=7.5";

        let skipped = read_under(nameless, &RecoveryPolicy::default());
        assert_eq!(skipped.rejected, None);
        assert_eq!(skipped.body_text(), "heaterThreshold=7.5");

        let rejecting =
            RecoveryPolicy::default().with(Malformed::HeaderWithoutName, Recovery::RejectUnchanged);
        let handler = handler().with_policy(rejecting.clone());
        let mut state = ControllerState::new();
        let response = handler.handle(&read_under(nameless, &rejecting), &mut state);
        assert_eq!(response.status, 400);
        assert_eq!(response.body, b"Malformed header line");
        assert_eq!(state.heater_threshold(), 18.0);

        let mut crowded = String::from("POST /updateThreshold HTTP/1.1\r\n");
        for index in 0..HEADER_CAPACITY {
            crowded.push_str(&format!("X-Filler-{index}: {index}\r\n"));
        }
        crowded.push_str("Content-Length: 19\r\n\r\nheaterThreshold=7.5");
        let truncating =
            RecoveryPolicy::default().with(Malformed::HeaderTableFull, Recovery::EmptyBody);
        let request = read_under(&crowded, &truncating);
        assert_eq!(request.rejected, None);
        assert!(request.body.is_empty());
    }

    #[test]
    fn content_length_recoveries_follow_the_policy() {
        let raw = "POST /x HTTP/1.1\r\nContent-Length: many\r\n\r\nabcdef";

        assert!(read_under(raw, &RecoveryPolicy::default()).body.is_empty());

        let sized =
            RecoveryPolicy::default().with(Malformed::ContentLengthInvalid, Recovery::UseValue(3.0));
        assert_eq!(read_under(raw, &sized).body, b"abc");

        let rejecting = RecoveryPolicy::default()
            .with(Malformed::ContentLengthInvalid, Recovery::RejectUnchanged);
        let request = read_under(raw, &rejecting);
        assert_eq!(request.rejected, Some(Malformed::ContentLengthInvalid));
        assert!(request.body.is_empty());
    }
}
