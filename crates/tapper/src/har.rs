//! Rolling HAR 1.2 files for HTTP exchanges

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tap_api::{Body, Exchange, Header, HttpRequestRecord, HttpResponseRecord};
use thiserror::Error;
use tracing::info;

const HAR_SUFFIX: &str = ".har";
const TEMP_SUFFIX: &str = ".har.tmp";
const HEADER: &[u8] =
    br#"{"log": {"version": "1.2", "creator": {"name": "tapper", "version": "0.1.0"}, "entries": ["#;
const TRAILER: &[u8] = b"]}}";

#[derive(Debug, Error)]
pub enum HarError {
    #[error("{}: {source}", path.display())]
    Io {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding HAR entry: {0}")]
    Encode(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> HarError + '_ {
    move |source| HarError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub started_date_time: String,
    pub time:              i64,
    pub request:           Request,
    pub response:          Response,
    pub cache:             serde_json::Map<String, serde_json::Value>,
    pub timings:           Timings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub method:       String,
    pub url:          String,
    pub http_version: String,
    pub cookies:      Vec<NameValue>,
    pub headers:      Vec<NameValue>,
    pub query_string: Vec<NameValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data:    Option<PostData>,
    pub headers_size: i64,
    pub body_size:    i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status:       u16,
    pub status_text:  String,
    pub http_version: String,
    pub cookies:      Vec<NameValue>,
    pub headers:      Vec<NameValue>,
    pub content:      Content,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size:    i64,
}

#[derive(Debug, Serialize)]
pub struct NameValue {
    pub name:  String,
    pub value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
    pub mime_type: String,
    pub text:      String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub size:      i64,
    pub mime_type: String,
    pub text:      String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding:  Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Timings {
    pub send:    i64,
    pub wait:    i64,
    pub receive: i64,
}

fn name_values(headers: &[Header]) -> Vec<NameValue> {
    headers
        .iter()
        .map(|h| NameValue {
            name:  h.name.clone(),
            value: h.value.clone(),
        })
        .collect()
}

fn body_size(body: &Body) -> i64 {
    i64::try_from(body.size).unwrap_or(i64::MAX)
}

impl Entry {
    /// HAR entry for an HTTP exchange; `None` for other protocols and for
    /// requests without a response.
    pub fn from_exchange(exchange: &Exchange) -> Option<Self> {
        let request = exchange.request.as_http_request()?;
        let response = exchange.response.as_ref()?.as_http_response()?;
        let time = exchange.elapsed_time.max(1);
        let started: DateTime<Utc> = exchange.request_time().into();
        Some(Self {
            started_date_time: started.to_rfc3339_opts(SecondsFormat::Millis, true),
            time,
            request: har_request(request),
            response: har_response(response),
            cache: serde_json::Map::new(),
            timings: Timings {
                send:    -1,
                wait:    -1,
                receive: time,
            },
        })
    }
}

fn har_request(r: &HttpRequestRecord) -> Request {
    // The body is kept verbatim; form bodies are not split into params.
    let post_data = (r.body.size > 0 || !r.body.as_bytes.is_empty()).then(|| PostData {
        mime_type: r.body.mime_type.clone(),
        text:      r.body.as_bytes.clone(),
    });
    Request {
        method: r.method.clone(),
        url: r.url.clone(),
        http_version: r.http_version.clone(),
        cookies: Vec::new(),
        headers: name_values(&r.headers),
        query_string: name_values(&r.query_string),
        post_data,
        headers_size: r.headers_size,
        body_size: body_size(&r.body),
    }
}

fn har_response(r: &HttpResponseRecord) -> Response {
    Response {
        status:       r.status,
        status_text:  r.status_text.clone(),
        http_version: r.http_version.clone(),
        cookies:      Vec::new(),
        headers:      name_values(&r.headers),
        content:      Content {
            size:      body_size(&r.body),
            mime_type: r.body.mime_type.clone(),
            text:      r.body.as_bytes.clone(),
            encoding:  r.body.encoding.clone(),
        },
        redirect_url: r.header("location").unwrap_or_default().to_string(),
        headers_size: r.headers_size,
        body_size:    body_size(&r.body),
    }
}

fn nanos(t: SystemTime) -> u128 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0)
}

/// `{nanos}__{YYYY_Mon_DD__hh-mm-ss}.har`
pub fn final_name(t: SystemTime) -> String {
    let utc: DateTime<Utc> = t.into();
    format!("{}__{}{HAR_SUFFIX}", nanos(t), utc.format("%Y_%b_%d__%H-%M-%S"))
}

struct HarFile {
    path:    PathBuf,
    out:     BufWriter<File>,
    entries: usize,
}

impl HarFile {
    fn create(path: PathBuf) -> Result<Self, HarError> {
        let file = File::create(&path).map_err(io_err(&path))?;
        let mut out = BufWriter::new(file);
        out.write_all(HEADER).map_err(io_err(&path))?;
        Ok(Self {
            path,
            out,
            entries: 0,
        })
    }

    fn write(&mut self, entry: &Entry) -> Result<(), HarError> {
        let json = serde_json::to_vec(entry)?;
        if self.entries > 0 {
            self.out.write_all(b",").map_err(io_err(&self.path))?;
        }
        self.out.write_all(&json).map_err(io_err(&self.path))?;
        self.entries += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<PathBuf, HarError> {
        self.out.write_all(TRAILER).map_err(io_err(&self.path))?;
        self.out.flush().map_err(io_err(&self.path))?;
        Ok(self.path)
    }
}

/// Writes entries to a temp file and renames it once it holds
/// `max_entries` entries or the writer is closed.
pub struct HarWriter {
    dir:         PathBuf,
    max_entries: usize,
    current:     Option<HarFile>,
    rolled:      usize,
}

impl HarWriter {
    pub fn new(dir: impl Into<PathBuf>, max_entries: usize) -> Result<Self, HarError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(Self {
            dir,
            max_entries: max_entries.max(1),
            current: None,
            rolled: 0,
        })
    }

    /// Append the exchange when it is HTTP. Returns whether an entry was
    /// written.
    pub fn write(&mut self, exchange: &Exchange) -> Result<bool, HarError> {
        let Some(entry) = Entry::from_exchange(exchange) else {
            return Ok(false);
        };
        let file = match self.current.take() {
            Some(file) => file,
            None => {
                let name = format!("har_writer_{}{TEMP_SUFFIX}", nanos(SystemTime::now()));
                HarFile::create(self.dir.join(name))?
            },
        };
        let file = self.current.insert(file);
        file.write(&entry)?;
        if file.entries >= self.max_entries {
            self.roll()?;
        }
        Ok(true)
    }

    /// Finish the current file, if any, and give it its final name.
    pub fn roll(&mut self) -> Result<Option<PathBuf>, HarError> {
        let Some(file) = self.current.take() else {
            return Ok(None);
        };
        let entries = file.entries;
        let tmp = file.finish()?;
        let target = self.dir.join(final_name(SystemTime::now()));
        fs::rename(&tmp, &target).map_err(io_err(&target))?;
        self.rolled += 1;
        info!(
            event.name = "har.rolled",
            path = %target.display(),
            entries,
            "HAR file written"
        );
        Ok(Some(target))
    }

    pub fn close(mut self) -> Result<Option<PathBuf>, HarError> {
        self.roll()
    }

    /// Files completed so far
    pub fn rolled(&self) -> usize {
        self.rolled
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
