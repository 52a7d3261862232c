use crate::prelude::*;
use std::time::UNIX_EPOCH;

const WEEKDAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Reshapes `proxy_log::format_time`'s `"YYYY-MM-DD HH:MM:SS"` into the RFC 1123
/// token order `Date` headers require, e.g. `Thu, 01 Jan 1970 00:00:00 GMT`.
///
/// The weekday is computed directly from the Unix epoch (1970-01-01 was a
/// Thursday) rather than from the approximate year/month/day breakdown, so it
/// stays correct even though the rest of the timestamp is only approximate.
fn http_date(now: SystemTime) -> String {
    let secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let weekday = WEEKDAYS[((secs / 86_400) % 7) as usize];

    let raw = proxy_log::format_time(now);
    let mut parts = raw.splitn(2, ' ');
    let date_part = parts.next().unwrap_or("1970-01-01");
    let time_part = parts.next().unwrap_or("00:00:00");

    let mut fields = date_part.split('-');
    let year = fields.next().unwrap_or("1970");
    let month: usize = fields.next().and_then(|m| m.parse().ok()).unwrap_or(1);
    let day = fields.next().unwrap_or("01");
    let month_name = MONTHS[month.saturating_sub(1).min(11)];

    format!("{weekday}, {day} {month_name} {year} {time_part} GMT")
}

#[derive(Debug)]
pub struct HttpResponse {
    pub version: String,
    pub status_code: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status_code,
            status_text: status_text.to_string(),
            headers: HashMap::from([("content-length".to_string(), "0".to_string())]),
            body: Vec::new(),
        }
    }

    pub fn set_header(&mut self, key: &str, value: &str) -> &mut Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    pub fn set_body(&mut self, body: Vec<u8>, content_type: &str) -> &mut Self {
        self.headers
            .insert("content-length".to_string(), body.len().to_string());
        self.headers
            .insert("content-type".to_string(), content_type.to_string());
        self.body = body;
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut res = format!(
            "{} {} {}\r\n",
            self.version, self.status_code, self.status_text
        )
        .into_bytes();

        for (key, val) in &self.headers {
            let formatted_key = Self::to_pascal_case(key);
            res.extend_from_slice(format!("{}: {}\r\n", formatted_key, val).as_bytes());
        }
        res.extend_from_slice(b"\r\n");
        res.extend_from_slice(&self.body);
        res
    }

    pub fn status_text(code: u16) -> String {
        match code {
            HTTP_OK => "OK",
            HTTP_CREATED => "Created",
            HTTP_NO_CONTENT => "No Content",
            HTTP_FOUND => "Found",
            HTTP_NOT_MODIFIED => "Not Modified",
            HTTP_BAD_REQUEST => "Bad Request",
            HTTP_FORBIDDEN => "Forbidden",
            HTTP_NOT_FOUND => "Not Found",
            HTTP_METHOD_NOT_ALLOWED => "Method Not Allowed",
            HTTP_REQUEST_TIMEOUT => "Request Timeout",
            HTTP_LENGTH_REQUIRED => "Length Required",
            HTTP_PAYLOAD_TOO_LARGE => "Payload Too Large",
            HTTP_URI_TOO_LONG => "URI Too Long",
            HTTP_INTERNAL_SERVER_ERROR => "Internal Server Error",
            HTTP_NOT_IMPLEMENTED => "Not Implemented",
            HTTP_BAD_GATEWAY => "Bad Gateway",
            GATEWAY_TIMEOUT => "Gateway Timeout",
            _ => "OK",
        }
        .to_string()
    }

    pub fn set_status_code(&mut self, code: u16) -> &mut Self {
        self.status_code = code;
        self.status_text = HttpResponse::status_text(code);
        self
    }

    pub fn to_bytes_headers_only(&self) -> Vec<u8> {
        let mut res = format!("HTTP/1.1 {} {}\r\n", self.status_code, self.status_text);

        for (k, v) in &self.headers {
            let formatted_key = Self::to_pascal_case(k);
            res.push_str(&format!("{}: {}\r\n", formatted_key, v));
        }

        res.push_str("\r\n");
        res.into_bytes()
    }

    fn to_pascal_case(s: &str) -> String {
        s.split('-')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    None => String::new(),
                    Some(f) => f.to_uppercase().collect::<String>() + chars.as_str(),
                }
            })
            .collect::<Vec<String>>()
            .join("-")
    }

    /// Stamps the headers §4.6 promises on every response: `Server`, `Date`,
    /// and (unless a caller already picked one, e.g. `handle_error`'s 404/405
    /// exception) `Connection`, forced to `close` on any 4xx/5xx status.
    pub fn apply_common_headers(&mut self, keep_alive: bool) -> &mut Self {
        self.headers
            .entry("server".to_string())
            .or_insert_with(|| "webserv".to_string());
        self.headers
            .entry("date".to_string())
            .or_insert_with(|| http_date(SystemTime::now()));

        let status_code = self.status_code;
        self.headers.entry("connection".to_string()).or_insert_with(|| {
            if status_code >= 400 || !keep_alive {
                "close".to_string()
            } else {
                "keep-alive".to_string()
            }
        });
        self
    }

    pub fn redirect(code: u16, target_url: &str) -> Self {
        let status_text = match code {
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            _ => "Found",
        };

        let mut res = HttpResponse::new(code, status_text);
        res.set_header("Location", target_url)
            .set_header("Content-Length", "0");

        res
    }
}

pub fn get_mime_type(extension: Option<&str>) -> &'static str {
    match extension {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("xml") => "application/xml",
        Some("wasm") => "application/wasm",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

pub fn get_ext_from_content_type(content_type: &str) -> &str {
    match content_type {
        "application/json" => ".json",
        "application/pdf" => ".pdf",
        "application/xml" => ".xml",
        "application/zip" => ".zip",
        "audio/mpeg" => ".mp3",
        "image/gif" => ".gif",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/svg+xml" => ".svg",
        "image/webp" => ".webp",
        "text/css" => ".css",
        "text/html" => ".html",
        "text/javascript" => ".js",
        "text/plain" => ".txt",
        "video/mp4" => ".mp4",
        _ => ".bin",
    }
}

pub fn generate_autoindex(path: &Path, original_url: &str) -> HttpResponse {
    let mut html = format!("<html><body><h1>Index of {}</h1><ul>", original_url);
    if let Ok(entries) = path.read_dir() {
        for entry in entries.flatten() {
            if let Ok(name) = entry.file_name().into_string() {
                html.push_str(&format!(
                    "<li><a href=\"{}/{}\">{}</a></li>",
                    original_url.trim_end_matches('/'),
                    name,
                    name
                ));
            }
        }
    }

    html.push_str("</ul></body></html>");
    let mut res = HttpResponse::new(200, "OK") ;
    res.set_body(html.into_bytes(), "text/html");
    res
}

/// Builds an error response for `code`, preferring a configured custom error page
/// when one exists and is readable, otherwise synthesising a minimal HTML body.
pub fn handle_error(code: u16, s_cfg: Option<&Arc<ServerConfig>>) -> HttpResponse {
    let status_text = HttpResponse::status_text(code);
    let mut res = HttpResponse::new(code, &status_text);

    if let Some(cfg) = s_cfg {
        if let Some(path_str) = cfg.error_pages.get(&code) {
            let s_root = std::path::Path::new(&cfg.root);
            let err_path = s_root.join(path_str.trim_start_matches('/'));
            if let Ok(content) = fs::read(err_path) {
                res.set_body(content, "text/html");
                set_connection_disposition(&mut res, code);
                res.apply_common_headers(false);
                return res;
            }
        }
    }

    let body = format!(
        "<html><body><h1>{} {}</h1></body></html>",
        code, status_text
    )
    .into_bytes();
    res.set_body(body, "text/html");
    set_connection_disposition(&mut res, code);
    res.apply_common_headers(false);
    res
}

fn set_connection_disposition(res: &mut HttpResponse, code: u16) {
    let value = if code >= 400 && code != 404 && code != 405 {
        "close"
    } else {
        "keep-alive"
    };
    res.set_header("connection", value);
}
