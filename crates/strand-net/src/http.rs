//! Streaming HTTP request parser with body offload.
//!
//! The parser is fed raw bytes as they arrive and transitions
//! request-line → headers-complete → (optional body offload) →
//! body-complete. Bodies above the configured offload threshold stream to a
//! uniquely named scratch file (`offload_dir/http_body.<seq>`) instead of
//! memory; the scratch file is owned by the request and deleted with it.
//!
//! Form decoding is content-type driven: URL-encoded bodies become
//! (name, decoded-value) pairs; `multipart/form-data` runs a small explicit
//! state machine over the body that records fields and
//! `{filename, bytes}` uploads. Cookies parse lazily from the `Cookie`
//! header.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strand_rt::Deadline;

use crate::socket::{Socket, SocketError};

/// Sequence for unique offload scratch names, process-wide.
static OFFLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Parser and pump tuning.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Cap on cumulative request-line + header bytes.
    pub max_header_len: usize,
    /// Cap on the declared body length.
    pub max_body_len: usize,
    /// Enable streaming large bodies to disk.
    pub disk_offload: bool,
    /// Bodies above this size offload when enabled.
    pub disk_offload_min: usize,
    /// Directory for offload scratch files.
    pub offload_dir: PathBuf,
    /// Socket deadline for each pump read, in milliseconds.
    pub connection_timeout_ms: i64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            max_header_len: 8 * 1024,
            max_body_len: 2 * 1024 * 1024,
            disk_offload: false,
            disk_offload_min: 64 * 1024,
            offload_dir: std::env::temp_dir(),
            connection_timeout_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Basic protocol types
// ---------------------------------------------------------------------------

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Trace,
    Connect,
}

impl Method {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            "PATCH" => Method::Patch,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            _ => return None,
        })
    }
}

/// Outcome of parsing so far; `Ok` until something goes wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    Ok,
    BadRequest,
    RequestTimeout,
    PayloadTooLarge,
    InternalError,
}

/// Percent-decode plus `+` → space.
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let decoded = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match decoded {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Decoded query parameters from the request target.
#[derive(Debug, Default, Clone)]
pub struct QueryString {
    params: Vec<(String, String)>,
}

impl QueryString {
    /// Parse `name=a&age=30` (a leading `?` is tolerated).
    pub fn parse(raw: &str) -> Self {
        let raw = raw.strip_prefix('?').unwrap_or(raw);
        let mut params = Vec::new();
        for part in raw.split('&').filter(|p| !p.is_empty()) {
            match part.split_once('=') {
                Some((name, value)) => params.push((url_decode(name), url_decode(value))),
                None => params.push((url_decode(part), String::new())),
            }
        }
        QueryString { params }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// One uploaded file from a multipart form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Client-supplied file name.
    pub filename: String,
    /// Raw file bytes.
    pub data: Vec<u8>,
}

/// Decoded form content: scalar fields plus uploads, both keyed by field
/// name.
#[derive(Debug, Default, Clone)]
pub struct FormData {
    params: Vec<(String, String)>,
    uploads: Vec<(String, UploadedFile)>,
}

impl FormData {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_upload(&self, name: &str) -> Option<&UploadedFile> {
        self.uploads
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, u)| u)
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn uploads(&self) -> &[(String, UploadedFile)] {
        &self.uploads
    }

    fn clear(&mut self) {
        self.params.clear();
        self.uploads.clear();
    }
}

// ---------------------------------------------------------------------------
// Body offload
// ---------------------------------------------------------------------------

/// A body streamed to a scratch file; read back on demand, deleted with the
/// request.
struct BodyOffload {
    path: PathBuf,
    file: Option<File>,
    cached: Option<Vec<u8>>,
}

impl BodyOffload {
    fn open(dir: &std::path::Path) -> std::io::Result<Self> {
        let path = dir.join(format!(
            "http_body.{}",
            OFFLOAD_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(BodyOffload {
            path,
            file: Some(file),
            cached: None,
        })
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.cached = None;
        match self.file.as_mut() {
            Some(file) => file.write_all(data),
            None => Err(std::io::Error::from(std::io::ErrorKind::NotFound)),
        }
    }

    /// Load the offloaded bytes back (once) for body access.
    fn data(&mut self) -> std::io::Result<&[u8]> {
        if self.cached.is_none() {
            let mut buf = Vec::new();
            let mut file = File::open(&self.path)?;
            file.read_to_end(&mut buf)?;
            self.cached = Some(buf);
        }
        Ok(self.cached.as_deref().unwrap_or(&[]))
    }
}

impl Drop for BodyOffload {
    fn drop(&mut self) {
        self.file = None;
        let _ = std::fs::remove_file(&self.path);
    }
}

// ---------------------------------------------------------------------------
// RequestParser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    Complete,
}

/// Incremental HTTP/1.x request parser.
pub struct RequestParser {
    config: Arc<HttpConfig>,
    state: ParseState,
    status: HttpStatus,

    method: Option<Method>,
    url: String,
    query: QueryString,
    headers: Vec<(String, String)>,
    header_bytes: usize,

    content_length: usize,
    body_received: usize,
    stage: Vec<u8>,
    offload: Option<BodyOffload>,

    pending: Vec<u8>,

    cookies: Vec<(String, String)>,
    cookies_parsed: bool,
    form: FormData,
    form_parsed: bool,
    has_body: bool,
}

impl RequestParser {
    pub fn new(config: Arc<HttpConfig>) -> Self {
        RequestParser {
            config,
            state: ParseState::RequestLine,
            status: HttpStatus::Ok,
            method: None,
            url: String::new(),
            query: QueryString::default(),
            headers: Vec::new(),
            header_bytes: 0,
            content_length: 0,
            body_received: 0,
            stage: Vec::new(),
            offload: None,
            pending: Vec::new(),
            cookies: Vec::new(),
            cookies_parsed: false,
            form: FormData::default(),
            form_parsed: false,
            has_body: false,
        }
    }

    /// Reset for the next request on the same connection.
    pub fn clear(&mut self) {
        self.state = ParseState::RequestLine;
        self.status = HttpStatus::Ok;
        self.method = None;
        self.url.clear();
        self.query = QueryString::default();
        self.headers.clear();
        self.header_bytes = 0;
        self.content_length = 0;
        self.body_received = 0;
        self.stage.clear();
        self.offload = None;
        self.pending.clear();
        self.cookies.clear();
        self.cookies_parsed = false;
        self.form.clear();
        self.form_parsed = false;
        self.has_body = false;
    }

    pub fn status(&self) -> HttpStatus {
        self.status
    }

    pub fn is_valid(&self) -> bool {
        self.status == HttpStatus::Ok
    }

    pub fn headers_complete(&self) -> bool {
        matches!(self.state, ParseState::Body | ParseState::Complete)
    }

    pub fn body_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn query(&self) -> &QueryString {
        &self.query
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn has_body(&self) -> bool {
        self.has_body
    }

    /// Header value by case-insensitive name; empty when absent.
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    /// Feed received bytes. Returns `false` once parsing has failed;
    /// `status()` then carries the reason.
    pub fn feed(&mut self, data: &[u8]) -> bool {
        if self.status != HttpStatus::Ok {
            return false;
        }
        self.pending.extend_from_slice(data);

        loop {
            match self.state {
                ParseState::RequestLine | ParseState::Headers => {
                    if self.header_bytes + self.pending.len() > self.config.max_header_len {
                        self.fail(HttpStatus::BadRequest);
                        return false;
                    }
                    let Some(line_end) = find_subslice(&self.pending, b"\r\n") else {
                        return true;
                    };
                    let line: Vec<u8> = self.pending.drain(..line_end + 2).collect();
                    let line = &line[..line_end];
                    if !self.process_line(line) {
                        return false;
                    }
                }
                ParseState::Body => {
                    if self.pending.is_empty() {
                        return true;
                    }
                    let want = (self.content_length - self.body_received).min(self.pending.len());
                    let chunk: Vec<u8> = self.pending.drain(..want).collect();
                    if !self.on_body_part(&chunk) {
                        return false;
                    }
                    if self.body_received == self.content_length {
                        self.state = ParseState::Complete;
                    }
                    if self.pending.is_empty() {
                        return true;
                    }
                }
                ParseState::Complete => {
                    // Pipelined bytes stay pending for the next request.
                    return true;
                }
            }
        }
    }

    fn fail(&mut self, status: HttpStatus) {
        self.status = status;
    }

    fn process_line(&mut self, line: &[u8]) -> bool {
        self.header_bytes += line.len() + 2;
        match self.state {
            ParseState::RequestLine => self.process_request_line(line),
            ParseState::Headers => self.process_header_line(line),
            _ => true,
        }
    }

    fn process_request_line(&mut self, line: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(line) else {
            self.fail(HttpStatus::BadRequest);
            return false;
        };
        let mut parts = text.split_whitespace();
        let (Some(method), Some(target), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            self.fail(HttpStatus::BadRequest);
            return false;
        };
        if !version.starts_with("HTTP/") {
            self.fail(HttpStatus::BadRequest);
            return false;
        }
        let Some(method) = Method::parse(method) else {
            self.fail(HttpStatus::BadRequest);
            return false;
        };
        self.method = Some(method);
        self.on_url(target);
        self.state = ParseState::Headers;
        true
    }

    fn on_url(&mut self, target: &str) {
        match target.split_once('?') {
            Some((path, query)) => {
                self.url = path.to_string();
                self.query = QueryString::parse(query);
            }
            None => {
                self.url = target.to_string();
                self.query = QueryString::default();
            }
        }
    }

    fn process_header_line(&mut self, line: &[u8]) -> bool {
        if line.is_empty() {
            return self.on_headers_complete();
        }
        let Ok(text) = std::str::from_utf8(line) else {
            self.fail(HttpStatus::BadRequest);
            return false;
        };
        let Some((name, value)) = text.split_once(':') else {
            self.fail(HttpStatus::BadRequest);
            return false;
        };
        self.headers
            .push((name.trim().to_string(), value.trim().to_string()));
        true
    }

    fn on_headers_complete(&mut self) -> bool {
        if !self.header("Transfer-Encoding").is_empty() {
            log::debug!("transfer-encoding is not supported by this parser");
            self.fail(HttpStatus::BadRequest);
            return false;
        }

        self.content_length = self
            .header("Content-Length")
            .parse::<usize>()
            .unwrap_or(0);

        if self.content_length > 0 {
            if self.content_length > self.config.max_body_len {
                log::debug!("request too large: {}", self.content_length);
                self.fail(HttpStatus::PayloadTooLarge);
                return false;
            }
            self.has_body = true;
        }

        if self.has_body
            && self.config.disk_offload
            && self.content_length > self.config.disk_offload_min
        {
            match BodyOffload::open(&self.config.offload_dir) {
                Ok(offload) => self.offload = Some(offload),
                Err(e) => {
                    log::debug!("opening offload scratch file failed: {}", e);
                    self.fail(HttpStatus::InternalError);
                    return false;
                }
            }
        }

        self.state = if self.content_length > 0 {
            ParseState::Body
        } else {
            ParseState::Complete
        };
        true
    }

    fn on_body_part(&mut self, part: &[u8]) -> bool {
        self.body_received += part.len();
        match self.offload.as_mut() {
            Some(offload) => {
                if let Err(e) = offload.write(part) {
                    log::debug!("offloading {} bytes failed: {}", part.len(), e);
                    self.fail(HttpStatus::InternalError);
                    return false;
                }
            }
            None => self.stage.extend_from_slice(part),
        }
        true
    }

    /// The request body, regardless of in-memory or offloaded path.
    pub fn body(&mut self) -> &[u8] {
        if self.status != HttpStatus::Ok {
            return &[];
        }
        match self.offload.as_mut() {
            Some(offload) => match offload.data() {
                Ok(data) => data,
                Err(e) => {
                    log::debug!("reading offloaded body failed: {}", e);
                    self.status = HttpStatus::InternalError;
                    &[]
                }
            },
            None => &self.stage,
        }
    }

    // -----------------------------------------------------------------------
    // Cookies
    // -----------------------------------------------------------------------

    /// Parse the `Cookie` header once; later calls are no-ops.
    pub fn parse_cookies(&mut self) -> bool {
        if self.cookies_parsed {
            return true;
        }
        self.cookies_parsed = true;

        let cookie = self.header("Cookie").to_string();
        if cookie.is_empty() {
            return false;
        }

        for part in cookie.split(';') {
            let part = part.trim_start();
            if part.is_empty() {
                log::trace!("invalid cookie in header");
                continue;
            }
            match part.split_once('=') {
                Some((name, value)) => self
                    .cookies
                    .push((name.to_string(), value.to_string())),
                None => self.cookies.push((part.to_string(), String::new())),
            }
        }
        true
    }

    /// Cookie value by name; empty when absent.
    pub fn cookie(&self, name: &str) -> &str {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    // -----------------------------------------------------------------------
    // Forms
    // -----------------------------------------------------------------------

    pub fn form(&self) -> &FormData {
        &self.form
    }

    /// Decode the body as a form, driven by Content-Type. Attempted once.
    pub fn parse_form(&mut self) -> bool {
        if self.form_parsed {
            log::trace!("form parse already attempted");
            return true;
        }
        self.form_parsed = true;

        if !matches!(self.method, Some(Method::Post) | Some(Method::Put)) {
            log::trace!("form parsing in unexpected method {:?}", self.method);
            return false;
        }

        let ctype = self.header("Content-Type").to_string();
        if ctype.is_empty() {
            log::trace!("only requests with a content type are supported");
            return false;
        }

        if ctype == "application/x-www-form-urlencoded" {
            return self.parse_url_encoded_form();
        }

        if ctype
            .to_ascii_lowercase()
            .starts_with("multipart/form-data")
        {
            let Some(pos) = ctype.find('=') else {
                log::debug!("multipart/form-data without boundary: {}", ctype);
                return false;
            };
            let boundary = ctype[pos + 1..].to_string();
            return self.parse_multipart_form(boundary.as_bytes());
        }

        log::debug!("content type {} cannot be parsed as a form", ctype);
        false
    }

    fn parse_url_encoded_form(&mut self) -> bool {
        let body = self.body().to_vec();
        if body.is_empty() {
            return false;
        }
        let text = String::from_utf8_lossy(&body);
        for part in text.split('&').filter(|p| !p.is_empty()) {
            match part.split_once('=') {
                Some((name, value)) => self
                    .form
                    .params
                    .push((name.to_string(), url_decode(value))),
                None => self.form.params.push((part.to_string(), String::new())),
            }
        }
        true
    }

    /// Explicit state machine over a multipart body.
    fn parse_multipart_form(&mut self, boundary: &[u8]) -> bool {
        #[derive(Clone, Copy, PartialEq, Debug)]
        enum S {
            Begin,
            IsBoundary,
            Boundary,
            Header,
            Content,
            Data,
            SaveData,
            SaveFile,
            End,
            Error,
        }

        let body = self.body().to_vec();
        if body.is_empty() {
            log::debug!("multipart form: nothing to parse, body empty");
            return false;
        }
        let p = &body[..];

        let mut next = S::Begin;
        // Where to continue after capturing a field or file.
        let mut resume = S::Error;
        let mut idx = 0usize;
        let mut ds = 0usize;
        let mut dsz = 0usize;
        let mut name: Option<String> = None;
        let mut filename: Option<String> = None;
        let mut cap = false;

        while cap || idx < p.len() {
            match next {
                S::Begin => {
                    resume = S::Error;
                    next = S::IsBoundary;
                }
                S::IsBoundary => {
                    if p[idx..].starts_with(b"--") {
                        idx += 2;
                        next = S::Boundary;
                    } else {
                        // Not a boundary start; hand the byte back to the
                        // surrounding state (data or error).
                        next = resume;
                    }
                }
                S::Boundary => {
                    if !p[idx..].starts_with(boundary) {
                        log::trace!("multipart form: invalid boundary");
                        next = S::Error;
                        continue;
                    }
                    idx += boundary.len();
                    let end_of_line = p[idx..].starts_with(b"\r\n");
                    let end_of_body = p[idx..].starts_with(b"--");
                    if !end_of_line && !end_of_body {
                        log::trace!("multipart form: malformed boundary tail");
                        next = S::Error;
                        continue;
                    }
                    idx += 2;
                    let after = if end_of_line { S::Content } else { S::End };
                    if filename.is_some() {
                        cap = true;
                        resume = after;
                        next = S::SaveFile;
                    } else if name.is_some() {
                        cap = true;
                        resume = after;
                        next = S::SaveData;
                    } else {
                        next = after;
                    }
                }
                S::SaveFile => {
                    // The captured span includes the field's trailing CRLF.
                    let data = p[ds..ds + dsz.saturating_sub(2)].to_vec();
                    self.form.uploads.push((
                        name.take().unwrap_or_default(),
                        UploadedFile {
                            filename: filename.take().unwrap_or_default(),
                            data,
                        },
                    ));
                    dsz = 0;
                    cap = false;
                    next = resume;
                }
                S::SaveData => {
                    let data = p[ds..ds + dsz.saturating_sub(2)].to_vec();
                    self.form.params.push((
                        name.take().unwrap_or_default(),
                        String::from_utf8_lossy(&data).into_owned(),
                    ));
                    dsz = 0;
                    cap = false;
                    next = resume;
                }
                S::Content => {
                    let Some((field, value, ni)) = read_header_line(p, idx) else {
                        log::trace!("multipart form: missing disposition");
                        next = S::Error;
                        continue;
                    };
                    if !field.eq_ignore_ascii_case("content-disposition")
                        || !value.to_ascii_lowercase().starts_with("form-data")
                    {
                        log::trace!("multipart form: not a content disposition: {}", value);
                        next = S::Error;
                        continue;
                    }
                    idx = ni;
                    let (n, f) = parse_disposition(&value);
                    if n.is_none() {
                        log::trace!("multipart form: invalid disposition: {}", value);
                        next = S::Error;
                        continue;
                    }
                    name = n;
                    filename = f;
                    next = S::Header;
                }
                S::Header => {
                    if p[idx..].starts_with(b"\r\n") {
                        idx += 2;
                        ds = idx;
                        resume = S::Data;
                        next = S::Data;
                    } else if let Some((_, _, ni)) = read_header_line(p, idx) {
                        // Part headers other than the disposition are noted
                        // and skipped.
                        idx = ni;
                    } else {
                        log::trace!("multipart form: parsing part header failed");
                        next = S::Error;
                    }
                }
                S::Data => {
                    resume = S::Data;
                    dsz += 1;
                    idx += 1;
                    next = S::IsBoundary;
                }
                S::End => {
                    log::trace!(
                        "multipart form: done, {} fields, {} files",
                        self.form.params.len(),
                        self.form.uploads.len()
                    );
                    return true;
                }
                S::Error => {
                    log::trace!("multipart form: state machine error");
                    return false;
                }
            }
        }

        next == S::End
    }

    // -----------------------------------------------------------------------
    // Socket pumps
    // -----------------------------------------------------------------------

    /// Read from the socket until the headers are complete.
    pub fn receive_headers(&mut self, sock: &mut dyn Socket) -> HttpStatus {
        self.status = HttpStatus::Ok;
        let mut stage = [0u8; 2048];
        while !self.headers_complete() {
            let deadline = Deadline::after_ms(self.config.connection_timeout_ms);
            match sock.read(&mut stage, deadline) {
                Ok(n) => {
                    if !self.feed(&stage[..n]) {
                        if self.status == HttpStatus::Ok {
                            self.status = HttpStatus::BadRequest;
                        }
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("receiving headers failed: {}", e);
                    self.status = match e {
                        SocketError::Timeout => HttpStatus::RequestTimeout,
                        _ => HttpStatus::InternalError,
                    };
                    break;
                }
            }
        }
        self.status
    }

    /// Read from the socket until the body is complete.
    pub fn receive_body(&mut self, sock: &mut dyn Socket) -> HttpStatus {
        if self.body_complete() {
            return self.status;
        }
        let mut stage = [0u8; 8192];
        while !self.body_complete() {
            let left = self.content_length - self.body_received - self.pending.len();
            let want = stage.len().min(left.max(1));
            let deadline = Deadline::after_ms(self.config.connection_timeout_ms);
            match sock.receive(&mut stage[..want], deadline) {
                Ok(n) => {
                    if !self.feed(&stage[..n]) {
                        if self.status == HttpStatus::Ok {
                            self.status = HttpStatus::BadRequest;
                        }
                        break;
                    }
                }
                Err(e) => {
                    log::trace!("receiving body failed: {}", e);
                    self.status = match e {
                        SocketError::Timeout => HttpStatus::RequestTimeout,
                        _ => HttpStatus::InternalError,
                    };
                    break;
                }
            }
        }
        self.status
    }
}

impl std::fmt::Debug for RequestParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestParser")
            .field("state", &self.state)
            .field("status", &self.status)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("content_length", &self.content_length)
            .field("offload", &self.offload.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Read one `Field: value\r\n` line at `idx`; returns the trimmed pair and
/// the index past the line terminator.
fn read_header_line(p: &[u8], idx: usize) -> Option<(String, String, usize)> {
    let rest = &p[idx..];
    let line_end = find_subslice(rest, b"\r\n")?;
    let line = &rest[..line_end];
    let colon = line.iter().position(|&b| b == b':')?;
    let field = String::from_utf8_lossy(&line[..colon]).trim().to_string();
    let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
    Some((field, value, idx + line_end + 2))
}

/// Extract `name="..."` and `filename="..."` from a content disposition.
fn parse_disposition(value: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut filename = None;
    for part in value.split(';').map(str::trim) {
        if let Some(rest) = strip_prefix_ignore_case(part, "name=") {
            name = Some(rest.trim_matches('"').to_string());
        } else if let Some(rest) = strip_prefix_ignore_case(part, "filename=") {
            filename = Some(rest.trim_matches('"').to_string());
        }
    }
    (name, filename)
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> RequestParser {
        RequestParser::new(Arc::new(HttpConfig::default()))
    }

    #[test]
    fn test_minimal_request() {
        let mut req = parser();
        assert!(req.feed(b"GET / HTTP/1.1\r\n\r\n"));
        assert!(req.headers_complete());
        assert!(req.body_complete());
        assert_eq!(req.url(), "/");
        assert!(req.query().is_empty());
        assert!(!req.has_body());
    }

    #[test]
    fn test_incremental_request_with_query_and_body() {
        let mut req = parser();
        assert!(req.feed(b"GET /home?name=Carter&age=30 HTTP/1.1\r\n"));
        assert!(!req.headers_complete());
        assert_eq!(req.url(), "/home");
        assert_eq!(req.query().len(), 2);
        assert_eq!(req.query().get("name"), Some("Carter"));
        assert_eq!(req.query().get("age"), Some("30"));

        assert!(req.feed(b"Content-Length: 11\r\nConnection: close\r\nFoo: bar\r\n\r\n"));
        assert!(req.headers_complete());
        assert!(!req.body_complete());
        assert_eq!(req.method(), Some(Method::Get));
        assert_eq!(req.header("Connection"), "close");
        assert_eq!(req.header("Foo"), "bar");

        assert!(req.feed(b"Hello World"));
        assert!(req.body_complete());
        assert!(req.has_body());
        assert_eq!(req.body(), b"Hello World");
    }

    #[test]
    fn test_url_encoded_form() {
        let mut req = parser();
        assert!(req.feed(
            b"POST / HTTP/1.1\r\n\
              Content-Length: 35\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              \r\n\
              name=Carter&age=89&country=Botswana"
        ));
        assert!(req.body_complete());
        assert!(req.parse_form());
        assert_eq!(req.form().get("name"), Some("Carter"));
        assert_eq!(req.form().get("age"), Some("89"));
        assert_eq!(req.form().get("country"), Some("Botswana"));
        assert!(req.form().uploads().is_empty());
    }

    #[test]
    fn test_multipart_form() {
        let body: &[u8] = b"--------------------------d74496d66958873e\r\n\
              Content-Disposition: form-data; name=\"person\"\r\n\
              \r\n\
              anonymous\r\n\
              --------------------------d74496d66958873e\r\n\
              Content-Disposition: form-data; name=\"secret\"; filename=\"file.txt\"\r\n\
              Content-Type: text/plain\r\n\
              \r\n\
              contents of the file\r\n\
              --------------------------d74496d66958873e\r\n\
              Content-Disposition: form-data; name=\"source\"\r\n\
              \r\n\
              AlienWorld\r\n\
              --------------------------d74496d66958873e\r\n\
              Content-Disposition: form-data; name=\"coord\"; filename=\"coord.txt\"\r\n\
              Content-Type: text/plain\r\n\
              \r\n\
              40.832090987240534, -74.08417060141278\r\n\
              --------------------------d74496d66958873e--";

        let mut req = parser();
        let head = format!(
            "POST /submit.cgi HTTP/1.1\r\n\
             Host: example.com\r\n\
             Content-Length: {}\r\n\
             Content-Type: multipart/form-data; boundary=------------------------d74496d66958873e\r\n\
             \r\n",
            body.len()
        );
        assert!(req.feed(head.as_bytes()));
        assert!(req.feed(body));
        assert!(req.body_complete());

        assert!(req.parse_form());
        assert_eq!(req.form().params().len(), 2);
        assert_eq!(req.form().get("person"), Some("anonymous"));
        assert_eq!(req.form().get("source"), Some("AlienWorld"));
        assert_eq!(req.form().uploads().len(), 2);

        let secret = req.form().get_upload("secret").unwrap();
        assert_eq!(secret.filename, "file.txt");
        assert_eq!(secret.data, b"contents of the file");

        let coord = req.form().get_upload("coord").unwrap();
        assert_eq!(coord.filename, "coord.txt");
        assert_eq!(coord.data, b"40.832090987240534, -74.08417060141278");
    }

    #[test]
    fn test_cookies() {
        let mut req = parser();
        assert!(req.feed(
            b"POST / HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Cookie: cookie1=choco; cookie2=strawberry\r\n\
              \r\n"
        ));
        assert!(req.parse_cookies());
        assert_eq!(req.cookies().len(), 2);
        assert_eq!(req.cookie("cookie1"), "choco");
        assert_eq!(req.cookie("cookie2"), "strawberry");
    }

    #[test]
    fn test_body_offload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(HttpConfig {
            disk_offload: true,
            disk_offload_min: 8,
            offload_dir: dir.path().to_path_buf(),
            ..HttpConfig::default()
        });

        let payload = vec![0xA5u8; 1024];
        let head = format!("POST /up HTTP/1.1\r\nContent-Length: {}\r\n\r\n", payload.len());

        // Offloaded path.
        let mut offloaded = RequestParser::new(Arc::clone(&config));
        assert!(offloaded.feed(head.as_bytes()));
        assert!(offloaded.feed(&payload));
        assert!(offloaded.body_complete());
        // The scratch file exists while the request lives.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert_eq!(offloaded.body(), &payload[..]);

        // In-memory path with offload disabled: identical bytes.
        let mut in_memory = RequestParser::new(Arc::new(HttpConfig::default()));
        assert!(in_memory.feed(head.as_bytes()));
        assert!(in_memory.feed(&payload));
        assert_eq!(in_memory.body(), offloaded.body());

        // Scratch file removed with the request.
        drop(offloaded);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_body_cap() {
        let config = Arc::new(HttpConfig {
            max_body_len: 10,
            ..HttpConfig::default()
        });
        let mut req = RequestParser::new(config);
        assert!(!req.feed(b"POST / HTTP/1.1\r\nContent-Length: 11\r\n\r\nHello World"));
        assert_eq!(req.status(), HttpStatus::PayloadTooLarge);
        assert!(!req.is_valid());
        assert!(req.body().is_empty());
    }

    #[test]
    fn test_header_cap() {
        let config = Arc::new(HttpConfig {
            max_header_len: 64,
            ..HttpConfig::default()
        });
        let mut req = RequestParser::new(config);
        let huge = format!("GET / HTTP/1.1\r\nX-Padding: {}\r\n\r\n", "x".repeat(256));
        assert!(!req.feed(huge.as_bytes()));
        assert_eq!(req.status(), HttpStatus::BadRequest);
    }

    #[test]
    fn test_bad_request_line() {
        let mut req = parser();
        assert!(!req.feed(b"NONSENSE\r\n\r\n"));
        assert_eq!(req.status(), HttpStatus::BadRequest);
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("a%20b+c"), "a b c");
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("caf%C3%A9"), "café");
    }

    #[test]
    fn test_clear_resets() {
        let mut req = parser();
        assert!(req.feed(b"GET /x HTTP/1.1\r\n\r\n"));
        assert!(req.body_complete());
        req.clear();
        assert!(!req.headers_complete());
        assert!(req.feed(b"GET /y HTTP/1.1\r\n\r\n"));
        assert_eq!(req.url(), "/y");
    }
}
