//! Static file responses: conditionals, ranges, precompressed
//! siblings, and the probe outcomes that feed the translate loop.

use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::FerryError;
use ferry_core::address::FileAddress;
use ferry_http::body::{BodyStream, ResponseBody};
use ferry_http::date::{format_http_date, parse_http_date};
use ferry_http::util::{RangeSpec, accepts_encoding, http_list_contains, parse_range_header};
use http_crate::{HeaderMap, HeaderValue, Method, StatusCode};
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ::http as http_crate;

const READ_CHUNK: usize = 64 * 1024;

/// What the file handler decided.
pub enum FileOutcome {
    Response {
        status: StatusCode,
        headers: HeaderMap,
        body: ResponseBody,
    },
    /// The path is a directory and DIRECTORY_INDEX was declared.
    DirectoryIndex,
    /// The file does not exist and FILE_NOT_FOUND was declared.
    FileNotFound,
    /// A path component is not a directory and ENOTDIR was declared.
    Enotdir,
}

/// Inputs the handler needs from the orchestrator.
pub struct FileRequest<'a> {
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
    /// Error-document requests must not honor ranges.
    pub translated_status: u16,
    /// A transformation chain disables ranges and validators.
    pub transformation_enabled: bool,
    pub expires_relative: Option<u32>,
    /// Loop directives declared by the translation response.
    pub have_directory_index: bool,
    pub have_file_not_found: bool,
    pub have_enotdir: bool,
}

fn static_etag(meta: &std::fs::Metadata) -> String {
    format!("\"{:x}-{:x}-{:x}\"", meta.dev(), meta.ino(), meta.mtime())
}

fn mtime(meta: &std::fs::Metadata) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(meta.mtime().max(0) as u64)
}

fn check_if_range(if_range: Option<&str>, meta: &std::fs::Metadata) -> bool {
    let Some(if_range) = if_range else { return true };
    if let Some(t) = parse_http_date(if_range) {
        return mtime(meta) == t;
    }
    if_range == static_etag(meta)
}

fn simple_response(status: StatusCode, msg: &str) -> FileOutcome {
    let mut headers = HeaderMap::new();
    headers.insert(
        http_crate::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    FileOutcome::Response {
        status,
        headers,
        body: ResponseBody::text(msg.to_string()),
    }
}

fn cache_headers(
    headers: &mut HeaderMap,
    meta: &std::fs::Metadata,
    expires_relative: Option<u32>,
) {
    if let Ok(value) = HeaderValue::from_str(&static_etag(meta)) {
        headers.insert(http_crate::header::ETAG, value);
    }
    if let Some(max_age) = expires_relative.filter(|&s| s > 0) {
        // limit to approximately one year
        let max_age = max_age.min(365 * 24 * 3600);
        let expires = SystemTime::now() + Duration::from_secs(max_age as u64);
        if let Ok(value) = HeaderValue::from_str(&format_http_date(expires)) {
            headers.insert(http_crate::header::EXPIRES, value);
        }
    }
}

/// Serve a local file.
pub async fn serve_file(
    address: &FileAddress,
    request: &FileRequest<'_>,
) -> Result<FileOutcome, FerryError> {
    serve_path(&address.path, address, request).await
}

async fn serve_path(
    path: &str,
    address: &FileAddress,
    request: &FileRequest<'_>,
) -> Result<FileOutcome, FerryError> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) => {
            return Ok(match e.kind() {
                std::io::ErrorKind::NotFound => {
                    if e.raw_os_error() == Some(libc::ENOTDIR) && request.have_enotdir {
                        FileOutcome::Enotdir
                    } else if request.have_file_not_found {
                        FileOutcome::FileNotFound
                    } else {
                        simple_response(
                            StatusCode::NOT_FOUND,
                            "The requested file does not exist.",
                        )
                    }
                }
                std::io::ErrorKind::PermissionDenied => {
                    simple_response(StatusCode::FORBIDDEN, "Access denied.")
                }
                _ => {
                    if e.raw_os_error() == Some(libc::ENOTDIR) {
                        if request.have_enotdir {
                            FileOutcome::Enotdir
                        } else {
                            simple_response(
                                StatusCode::NOT_FOUND,
                                "The requested file does not exist.",
                            )
                        }
                    } else {
                        return Err(FerryError::Io(e));
                    }
                }
            });
        }
    };

    if meta.is_dir() {
        return Ok(if request.have_directory_index {
            FileOutcome::DirectoryIndex
        } else {
            simple_response(StatusCode::NOT_FOUND, "Not a regular file")
        });
    }
    if !meta.is_file() {
        return Ok(simple_response(StatusCode::NOT_FOUND, "Not a regular file"));
    }

    // conditional requests
    let get_header =
        |name: http_crate::HeaderName| request.headers.get(name).and_then(|v| v.to_str().ok());

    if !request.transformation_enabled {
        if let Some(ims) = get_header(http_crate::header::IF_MODIFIED_SINCE) {
            if let Some(t) = parse_http_date(ims) {
                if mtime(&meta) <= t {
                    let mut headers = HeaderMap::new();
                    cache_headers(&mut headers, &meta, request.expires_relative);
                    return Ok(FileOutcome::Response {
                        status: StatusCode::NOT_MODIFIED,
                        headers,
                        body: ResponseBody::Empty,
                    });
                }
            }
        }

        if let Some(ius) = get_header(http_crate::header::IF_UNMODIFIED_SINCE) {
            if let Some(t) = parse_http_date(ius) {
                if mtime(&meta) > t {
                    return Ok(simple_response(
                        StatusCode::PRECONDITION_FAILED,
                        "precondition failed",
                    ));
                }
            }
        }

        if let Some(if_match) = get_header(http_crate::header::IF_MATCH) {
            if if_match != "*" && !http_list_contains(if_match, &static_etag(&meta)) {
                return Ok(simple_response(
                    StatusCode::PRECONDITION_FAILED,
                    "precondition failed",
                ));
            }
        }

        if let Some(inm) = get_header(http_crate::header::IF_NONE_MATCH) {
            if inm == "*" || http_list_contains(inm, &static_etag(&meta)) {
                if *request.method == Method::GET || *request.method == Method::HEAD {
                    let mut headers = HeaderMap::new();
                    cache_headers(&mut headers, &meta, request.expires_relative);
                    return Ok(FileOutcome::Response {
                        status: StatusCode::NOT_MODIFIED,
                        headers,
                        body: ResponseBody::Empty,
                    });
                }
                return Ok(simple_response(
                    StatusCode::PRECONDITION_FAILED,
                    "precondition failed",
                ));
            }
        }
    }

    let size = meta.len();

    // range requests
    let mut range = RangeSpec::None;
    if request.translated_status == 0
        && *request.method == Method::GET
        && !request.transformation_enabled
    {
        if let Some(r) = get_header(http_crate::header::RANGE) {
            if check_if_range(get_header(http_crate::header::IF_RANGE), &meta) {
                range = parse_range_header(r, size);
            }
        }
    }

    let mut headers = HeaderMap::new();
    cache_headers(&mut headers, &meta, request.expires_relative);
    if let Ok(value) = HeaderValue::from_str(&format_http_date(mtime(&meta))) {
        headers.insert(http_crate::header::LAST_MODIFIED, value);
    }
    let content_type = address.content_type.as_deref().unwrap_or("application/octet-stream");
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(http_crate::header::CONTENT_TYPE, value);
    }
    headers.insert(
        http_crate::header::ACCEPT_RANGES,
        HeaderValue::from_static("bytes"),
    );

    // precompressed siblings (never combined with ranges)
    if matches!(range, RangeSpec::None) {
        let accept_encoding = get_header(http_crate::header::ACCEPT_ENCODING);
        let candidate = if accepts_encoding(accept_encoding, "gzip") {
            address.gzipped.as_deref().map(|p| (p, "gzip"))
        } else {
            None
        }
        .or_else(|| {
            if accepts_encoding(accept_encoding, "deflate") {
                address.deflated.as_deref().map(|p| (p, "deflate"))
            } else {
                None
            }
        });

        if let Some((compressed_path, encoding)) = candidate {
            if let Ok(compressed_meta) = std::fs::metadata(compressed_path) {
                if compressed_meta.is_file() {
                    headers.insert(
                        http_crate::header::CONTENT_ENCODING,
                        HeaderValue::from_static(match encoding {
                            "gzip" => "gzip",
                            _ => "deflate",
                        }),
                    );
                    let body =
                        open_body(compressed_path, 0, compressed_meta.len()).await?;
                    return Ok(FileOutcome::Response {
                        status: StatusCode::OK,
                        headers,
                        body,
                    });
                }
            }
        }
    }

    match range {
        RangeSpec::None => {
            let body = open_body(path, 0, size).await?;
            Ok(FileOutcome::Response {
                status: StatusCode::OK,
                headers,
                body,
            })
        }
        RangeSpec::Valid { skip, length } => {
            if let Ok(value) = HeaderValue::from_str(&format!(
                "bytes {}-{}/{}",
                skip,
                skip + length - 1,
                size
            )) {
                headers.insert(http_crate::header::CONTENT_RANGE, value);
            }
            let body = open_body(path, skip, length).await?;
            Ok(FileOutcome::Response {
                status: StatusCode::PARTIAL_CONTENT,
                headers,
                body,
            })
        }
        RangeSpec::Invalid => {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                headers.insert(http_crate::header::CONTENT_RANGE, value);
            }
            Ok(FileOutcome::Response {
                status: StatusCode::RANGE_NOT_SATISFIABLE,
                headers,
                body: ResponseBody::Empty,
            })
        }
    }
}

async fn open_body(path: &str, offset: u64, length: u64) -> Result<ResponseBody, FerryError> {
    let file = monoio::fs::File::open(path).await.map_err(FerryError::Io)?;
    Ok(ResponseBody::Stream {
        len: Some(length),
        stream: Box::new(FileBody {
            file,
            offset,
            remaining: length,
        }),
    })
}

struct FileBody {
    file: monoio::fs::File,
    offset: u64,
    remaining: u64,
}

#[async_trait(?Send)]
impl BodyStream for FileBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, FerryError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let take = (self.remaining as usize).min(READ_CHUNK);
        let buf = vec![0u8; take];
        let (res, buf) = self.file.read_at(buf, self.offset).await;
        let n = res.map_err(FerryError::Io)?;
        if n == 0 {
            // file truncated under us
            self.remaining = 0;
            return Ok(None);
        }
        self.offset += n as u64;
        self.remaining -= n as u64;
        Ok(Some(Bytes::copy_from_slice(&buf[..n])))
    }
}

/// Probe a path candidate for PROBE_PATH_SUFFIXES: which declared
/// suffix names an existing regular file?
pub fn probe_suffixes(test_path: &str, suffixes: &[String]) -> Option<String> {
    for suffix in suffixes {
        let candidate = format!("{}{}", test_path, suffix);
        if std::fs::metadata(&candidate)
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            return Some(suffix.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tmpfile(content: &[u8]) -> (tempdir::TempDirGuard, String) {
        let dir = tempdir::create();
        let path = format!("{}/file.bin", dir.path);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        (dir, path)
    }

    // minimal scoped tempdir helper
    mod tempdir {
        pub struct TempDirGuard {
            pub path: String,
        }
        impl Drop for TempDirGuard {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.path);
            }
        }
        pub fn create() -> TempDirGuard {
            let path = std::env::temp_dir()
                .join(format!("ferry-file-test-{}", uuid::Uuid::new_v4()))
                .to_string_lossy()
                .into_owned();
            std::fs::create_dir_all(&path).unwrap();
            TempDirGuard { path }
        }
    }

    fn request<'a>(method: &'a Method, headers: &'a HeaderMap) -> FileRequest<'a> {
        FileRequest {
            method,
            headers,
            translated_status: 0,
            transformation_enabled: false,
            expires_relative: None,
            have_directory_index: false,
            have_file_not_found: false,
            have_enotdir: false,
        }
    }

    async fn body_bytes(body: ResponseBody) -> Bytes {
        body.collect(1 << 20).await.unwrap()
    }

    #[monoio::test(timer_enabled = true)]
    async fn serves_whole_file() {
        let (_guard, path) = tmpfile(b"hello world");
        let address = FileAddress::new(&path);
        let headers = HeaderMap::new();
        let method = Method::GET;

        match serve_file(&address, &request(&method, &headers)).await.unwrap() {
            FileOutcome::Response {
                status,
                headers,
                body,
            } => {
                assert_eq!(status, StatusCode::OK);
                assert!(headers.contains_key("etag"));
                assert!(headers.contains_key("last-modified"));
                assert_eq!(
                    headers.get("content-type").unwrap().to_str().unwrap(),
                    "application/octet-stream"
                );
                assert_eq!(body.len(), Some(11));
                assert_eq!(&body_bytes(body).await[..], b"hello world");
            }
            _ => panic!("expected a response"),
        }
    }

    #[monoio::test(timer_enabled = true)]
    async fn content_type_override() {
        let (_guard, path) = tmpfile(b"<html/>");
        let mut address = FileAddress::new(&path);
        address.content_type = Some("text/html".into());
        let headers = HeaderMap::new();
        let method = Method::GET;

        match serve_file(&address, &request(&method, &headers)).await.unwrap() {
            FileOutcome::Response { headers, .. } => {
                assert_eq!(
                    headers.get("content-type").unwrap().to_str().unwrap(),
                    "text/html"
                );
            }
            _ => panic!("expected a response"),
        }
    }

    #[monoio::test(timer_enabled = true)]
    async fn range_request_partial_content() {
        let (_guard, path) = tmpfile(b"0123456789");
        let address = FileAddress::new(&path);
        let mut headers = HeaderMap::new();
        headers.insert("range", "bytes=2-5".parse().unwrap());
        let method = Method::GET;

        match serve_file(&address, &request(&method, &headers)).await.unwrap() {
            FileOutcome::Response {
                status,
                headers,
                body,
            } => {
                assert_eq!(status, StatusCode::PARTIAL_CONTENT);
                assert_eq!(
                    headers.get("content-range").unwrap().to_str().unwrap(),
                    "bytes 2-5/10"
                );
                assert_eq!(&body_bytes(body).await[..], b"2345");
            }
            _ => panic!("expected a response"),
        }
    }

    #[monoio::test(timer_enabled = true)]
    async fn open_ended_range() {
        let (_guard, path) = tmpfile(b"0123456789");
        let address = FileAddress::new(&path);
        let mut headers = HeaderMap::new();
        headers.insert("range", "bytes=7-".parse().unwrap());
        let method = Method::GET;

        match serve_file(&address, &request(&method, &headers)).await.unwrap() {
            FileOutcome::Response { status, body, .. } => {
                assert_eq!(status, StatusCode::PARTIAL_CONTENT);
                assert_eq!(&body_bytes(body).await[..], b"789");
            }
            _ => panic!("expected a response"),
        }
    }

    #[monoio::test(timer_enabled = true)]
    async fn invalid_range_is_416() {
        let (_guard, path) = tmpfile(b"0123456789");
        let address = FileAddress::new(&path);
        let mut headers = HeaderMap::new();
        headers.insert("range", "bytes=20-".parse().unwrap());
        let method = Method::GET;

        match serve_file(&address, &request(&method, &headers)).await.unwrap() {
            FileOutcome::Response { status, headers, .. } => {
                assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
                assert_eq!(
                    headers.get("content-range").unwrap().to_str().unwrap(),
                    "bytes */10"
                );
            }
            _ => panic!("expected a response"),
        }
    }

    #[monoio::test(timer_enabled = true)]
    async fn if_none_match_gives_304() {
        let (_guard, path) = tmpfile(b"body");
        let address = FileAddress::new(&path);
        let meta = std::fs::metadata(&path).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("if-none-match", static_etag(&meta).parse().unwrap());
        let method = Method::GET;

        match serve_file(&address, &request(&method, &headers)).await.unwrap() {
            FileOutcome::Response { status, body, .. } => {
                assert_eq!(status, StatusCode::NOT_MODIFIED);
                assert!(body.is_empty_kind());
            }
            _ => panic!("expected a response"),
        }
    }

    #[monoio::test(timer_enabled = true)]
    async fn if_match_mismatch_gives_412() {
        let (_guard, path) = tmpfile(b"body");
        let address = FileAddress::new(&path);
        let mut headers = HeaderMap::new();
        headers.insert("if-match", "\"other\"".parse().unwrap());
        let method = Method::GET;

        match serve_file(&address, &request(&method, &headers)).await.unwrap() {
            FileOutcome::Response { status, .. } => {
                assert_eq!(status, StatusCode::PRECONDITION_FAILED);
            }
            _ => panic!("expected a response"),
        }
    }

    #[monoio::test(timer_enabled = true)]
    async fn missing_file_404_without_directive() {
        let address = FileAddress::new("/no/such/ferry/file");
        let headers = HeaderMap::new();
        let method = Method::GET;

        match serve_file(&address, &request(&method, &headers)).await.unwrap() {
            FileOutcome::Response { status, .. } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
            }
            _ => panic!("expected a response"),
        }
    }

    #[monoio::test(timer_enabled = true)]
    async fn missing_file_with_directive_retranslates() {
        let address = FileAddress::new("/no/such/ferry/file");
        let headers = HeaderMap::new();
        let method = Method::GET;
        let mut req = request(&method, &headers);
        req.have_file_not_found = true;

        assert!(matches!(
            serve_file(&address, &req).await.unwrap(),
            FileOutcome::FileNotFound
        ));
    }

    #[monoio::test(timer_enabled = true)]
    async fn directory_with_directive_retranslates() {
        let dir = tempdir::create();
        let address = FileAddress::new(&dir.path);
        let headers = HeaderMap::new();
        let method = Method::GET;
        let mut req = request(&method, &headers);
        req.have_directory_index = true;

        assert!(matches!(
            serve_file(&address, &req).await.unwrap(),
            FileOutcome::DirectoryIndex
        ));
    }

    #[monoio::test(timer_enabled = true)]
    async fn gzipped_sibling_served_when_accepted() {
        let (_guard, path) = tmpfile(b"plain-content");
        let gz_path = format!("{}.gz", path);
        std::fs::write(&gz_path, b"fake-gzip-bytes").unwrap();

        let mut address = FileAddress::new(&path);
        address.gzipped = Some(gz_path.clone());

        let mut headers = HeaderMap::new();
        headers.insert("accept-encoding", "gzip".parse().unwrap());
        let method = Method::GET;

        match serve_file(&address, &request(&method, &headers)).await.unwrap() {
            FileOutcome::Response { headers, body, .. } => {
                assert_eq!(
                    headers.get("content-encoding").unwrap().to_str().unwrap(),
                    "gzip"
                );
                assert_eq!(&body_bytes(body).await[..], b"fake-gzip-bytes");
            }
            _ => panic!("expected a response"),
        }
        let _ = std::fs::remove_file(&gz_path);
    }

    #[test]
    fn probe_suffixes_finds_existing() {
        let dir = tempdir::create();
        let base = format!("{}/page", dir.path);
        std::fs::write(format!("{}.html", base), b"x").unwrap();

        let suffixes = vec![".php".to_string(), ".html".to_string()];
        assert_eq!(probe_suffixes(&base, &suffixes).as_deref(), Some(".html"));
        assert_eq!(probe_suffixes("/no/such/base", &suffixes), None);
    }
}
