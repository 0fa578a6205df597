//! Request routing and JSON/bytes mapping for the gateway.
//!
//! Routes:
//! - POST /api/encrypt/text   `{text}`            -> `{success, message, passkey}`
//! - POST /api/encrypt/image  multipart `image`   -> `{success, message, passkey}`
//!                            or raw bytes + `X-File-Name`
//! - POST /api/decrypt/text   `{passkey}`         -> `{success, data}`
//! - POST /api/decrypt/image  `{passkey}`         -> image bytes + Content-Disposition
//! - GET  /admin/files        development only    -> `{storedRecords, physicalFiles}`
//!
//! The route names keep the historical encrypt/decrypt wording; payloads are
//! stored as-is and guarded only by the passkey.

use super::body::DeliveryBody;
use crate::error::VaultError;
use crate::gateway::{Gateway, DEFAULT_IMAGE_NAME};
use crate::rate_limit::RateLimiter;
use http_body_util::{combinators::BoxBody, BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use multer::Multipart;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::io::Cursor;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, error};

/// Header carrying the original file name of an uploaded image.
pub const FILE_NAME_HEADER: &str = "x-file-name";

/// Largest JSON request body accepted for redeem calls.
const MAX_REDEEM_BODY: usize = 4 * 1024;

/// Longest JSON encoding of one text byte (`\u0001`).
const JSON_ESCAPE_FACTOR: usize = 6;

/// Slack for JSON framing around the text field.
const JSON_OVERHEAD: usize = 64 * 1024;

/// Slack for multipart boundaries and part headers.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Multipart field carrying the uploaded image.
const IMAGE_FIELD: &str = "image";

/// RFC 5987 `attr-char`: everything else is percent-encoded.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

pub type ResponseBody = BoxBody<Bytes, Infallible>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared state for all connections.
pub struct AppState {
    pub gateway: Gateway,
    pub limiter: RateLimiter,
}

impl AppState {
    pub fn new(gateway: Gateway, limiter: RateLimiter) -> Self {
        Self { gateway, limiter }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TextSubmission {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RedeemRequest {
    passkey: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse<'a> {
    success: bool,
    message: &'a str,
    passkey: &'a str,
}

/// Route one request.
pub async fn handle<B>(state: &AppState, client: IpAddr, req: Request<B>) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("[server] {} {} from {}", method, path, client);

    if method == Method::OPTIONS {
        return with_cors(preflight());
    }
    if let Err(e) = state.limiter.check(client) {
        debug!("[server] Rate limited {}", client);
        return with_cors(error_response(&e, ""));
    }

    let response = match (&method, path.as_str()) {
        (&Method::POST, "/api/encrypt/text") => encrypt_text(state, req)
            .await
            .unwrap_or_else(|e| error_response(&e, "Failed to store text")),
        (&Method::POST, "/api/encrypt/image") => encrypt_image(state, req)
            .await
            .unwrap_or_else(|e| error_response(&e, "Failed to store image")),
        (&Method::POST, "/api/decrypt/text") => decrypt_text(state, req)
            .await
            .unwrap_or_else(|e| error_response(&e, "Failed to retrieve text")),
        (&Method::POST, "/api/decrypt/image") => decrypt_image(state, req)
            .await
            .unwrap_or_else(|e| error_response(&e, "Failed to retrieve image")),
        (&Method::GET, "/admin/files") => admin_files(state)
            .await
            .unwrap_or_else(|e| error_response(&e, "Failed to list files")),
        _ => json_response(StatusCode::NOT_FOUND, &json!({ "error": "Not found" })),
    };

    with_cors(response)
}

async fn encrypt_text<B>(state: &AppState, req: Request<B>) -> Result<Response<ResponseBody>, VaultError>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    let limit = state
        .gateway
        .settings()
        .max_text_bytes
        .saturating_mul(JSON_ESCAPE_FACTOR)
        .saturating_add(JSON_OVERHEAD);
    let submission: TextSubmission = read_json(req.into_body(), limit).await?;
    let text = submission
        .text
        .ok_or_else(|| VaultError::invalid("No text provided"))?;

    let passkey = state.gateway.submit_text(&text)?;
    Ok(json_response(
        StatusCode::OK,
        &SubmitResponse {
            success: true,
            message: "Text stored successfully",
            passkey: passkey.as_str(),
        },
    ))
}

async fn encrypt_image<B>(state: &AppState, req: Request<B>) -> Result<Response<ResponseBody>, VaultError>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    let limit = state.gateway.settings().max_image_bytes;
    let boundary = multipart_boundary(req.headers())?;
    let header_name = header_file_name(req.headers());

    let (bytes, file_name) = match boundary {
        Some(boundary) => {
            let body = read_body(req.into_body(), limit.saturating_add(MULTIPART_OVERHEAD)).await?;
            read_image_part(body, boundary).await?
        }
        None => (read_body(req.into_body(), limit).await?, header_name),
    };
    if bytes.is_empty() {
        return Err(VaultError::invalid("No image provided"));
    }
    let file_name = file_name.unwrap_or_else(|| DEFAULT_IMAGE_NAME.to_string());

    let gateway = state.gateway.clone();
    let passkey = blocking(move || gateway.submit_image(&bytes, &file_name)).await?;
    Ok(json_response(
        StatusCode::OK,
        &SubmitResponse {
            success: true,
            message: "Image stored successfully",
            passkey: passkey.as_str(),
        },
    ))
}

/// Boundary of a `multipart/form-data` request, `None` for any other body.
fn multipart_boundary(headers: &HeaderMap) -> Result<Option<String>, VaultError> {
    let Some(content_type) = headers.get(header::CONTENT_TYPE) else {
        return Ok(None);
    };
    let content_type = content_type
        .to_str()
        .map_err(|_| VaultError::invalid("Invalid Content-Type header"))?;
    if !content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("multipart/")
    {
        return Ok(None);
    }

    multer::parse_boundary(content_type)
        .map(Some)
        .map_err(|_| VaultError::invalid("Multipart body without boundary"))
}

/// File name from `X-File-Name`, raw UTF-8 or percent-encoded.
fn header_file_name(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(FILE_NAME_HEADER)?;
    let raw = std::str::from_utf8(raw.as_bytes()).ok()?;
    let decoded = percent_decode_str(raw).decode_utf8().ok()?;
    Some(decoded.into_owned()).filter(|name| !name.trim().is_empty())
}

/// Pull the `image` part and its file name out of a multipart body.
async fn read_image_part(
    body: Bytes,
    boundary: String,
) -> Result<(Bytes, Option<String>), VaultError> {
    let malformed = |e: multer::Error| {
        debug!("[server] Rejected multipart body: {}", e);
        VaultError::invalid("Malformed multipart body")
    };

    let mut multipart = Multipart::with_reader(Cursor::new(body), boundary);
    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.map_err(malformed)?;
        return Ok((bytes, file_name));
    }
    Err(VaultError::invalid("No image provided"))
}

async fn decrypt_text<B>(state: &AppState, req: Request<B>) -> Result<Response<ResponseBody>, VaultError>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    let passkey = read_passkey(req).await?;
    let data = state.gateway.redeem_text(&passkey)?;
    Ok(json_response(
        StatusCode::OK,
        &json!({ "success": true, "data": data }),
    ))
}

async fn decrypt_image<B>(state: &AppState, req: Request<B>) -> Result<Response<ResponseBody>, VaultError>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    let passkey = read_passkey(req).await?;
    let gateway = state.gateway.clone();
    let delivery = blocking(move || gateway.redeem_image(&passkey)).await?;

    let content_type = content_type_for(delivery.file_name());
    let disposition = content_disposition(delivery.file_name());

    let mut response = Response::new(DeliveryBody::new(delivery).boxed());
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

async fn admin_files(state: &AppState) -> Result<Response<ResponseBody>, VaultError> {
    let gateway = state.gateway.clone();
    let inventory = blocking(move || gateway.inventory()).await?;
    Ok(json_response(StatusCode::OK, &inventory))
}

async fn read_passkey<B>(req: Request<B>) -> Result<String, VaultError>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    let request: RedeemRequest = read_json(req.into_body(), MAX_REDEEM_BODY).await?;
    request
        .passkey
        .ok_or_else(|| VaultError::invalid("No passkey provided"))
}

/// Collect a body, refusing more than `limit` bytes.
async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, VaultError>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(VaultError::PayloadTooLarge { limit })
        }
        Err(e) => Err(VaultError::invalid(format!("Cannot read request body: {}", e))),
    }
}

/// Parse a JSON body. An empty body counts as `{}`.
async fn read_json<T, B>(body: B, limit: usize) -> Result<T, VaultError>
where
    T: for<'de> Deserialize<'de> + Default,
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    let bytes = read_body(body, limit).await?;
    if bytes.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|_| VaultError::invalid("Malformed JSON body"))
}

/// Run gateway work that touches the blob backend on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, VaultError>
where
    F: FnOnce() -> Result<T, VaultError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| VaultError::Backend(format!("Worker task failed: {}", e)))?
}

fn status_for(err: &VaultError) -> StatusCode {
    match err {
        VaultError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        VaultError::NotFound | VaultError::Disabled => StatusCode::NOT_FOUND,
        VaultError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        VaultError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        VaultError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &VaultError, fallback: &str) -> Response<ResponseBody> {
    if !err.is_client_error() {
        error!("[server] {}: {}", fallback, err);
    }

    let mut response = json_response(
        status_for(err),
        &json!({ "error": err.public_message(fallback) }),
    );
    if let VaultError::RateLimited { retry_after } = err {
        response.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from(retry_after.as_secs().max(1)),
        );
    }
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Full::new(Bytes::from(body)).boxed());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn preflight() -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::new()).boxed());
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type, x-file-name"),
    );
    response
}

fn with_cors(mut response: Response<ResponseBody>) -> Response<ResponseBody> {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("content-disposition"),
    );
    response
}

/// `attachment; filename="..."` with an ASCII fallback name. Names that do
/// not survive the fallback also get an RFC 6266 `filename*` parameter.
fn content_disposition(file_name: &str) -> HeaderValue {
    let fallback: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();

    let mut value = format!("attachment; filename=\"{}\"", fallback);
    if fallback != file_name {
        value.push_str("; filename*=UTF-8''");
        value.extend(utf8_percent_encode(file_name, ATTR_CHAR));
    }
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn content_type_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "tif" | "tiff" => "image/tiff",
        "avif" => "image/avif",
        _ => "application/octet-stream",
    }
}
