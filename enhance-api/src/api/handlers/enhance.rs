use std::time::Instant;

use axum::{
    body::Body,
    extract::{
        Multipart, State,
        multipart::{Field, MultipartError},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use scopeguard::ScopeGuard;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{Span, debug, info, instrument};
use uuid::Uuid;

use crate::{
    AppState,
    api::models::enhance::{EnhanceUpload, ErrorBody, PngImage},
    errors::{Error, Result},
    inference::pipeline,
    storage::{self, TempFileGuard},
    types::accepted_extension,
};

/// Filename offered to the client for every enhanced image.
pub const RESPONSE_FILENAME: &str = "enhanced.png";

/// Name of the multipart part carrying the image.
const FILE_FIELD: &str = "file";

#[utoipa::path(
    post,
    path = "/enhance",
    tag = "enhance",
    summary = "Enhance image",
    description = "Upscale an image x4 with the BSRGAN super-resolution network. \
        Accepts .jpg, .jpeg and .png (any case) in the multipart part `file`. \
        Other extensions are answered with `{\"error\": \"Unsupported file type\"}`, \
        with status 200 unless the service is configured to report them as 415.",
    request_body(
        content = EnhanceUpload,
        content_type = "multipart/form-data",
        description = "The image to enhance"
    ),
    responses(
        (status = 200, description = "Enhanced image, returned as an attachment named enhanced.png", body = PngImage, content_type = "image/png"),
        (status = 400, description = "Missing or empty file, malformed multipart body, or undecodable image", body = ErrorBody),
        (status = 413, description = "Payload too large", body = ErrorBody),
        (status = 415, description = "Unsupported file type (when configured)", body = ErrorBody),
        (status = 429, description = "Too many enhancements in progress", body = ErrorBody),
        (status = 500, description = "Internal server error", body = ErrorBody)
    )
)]
#[instrument(skip_all, fields(request_id = %Uuid::new_v4(), filename = tracing::field::Empty, upload_bytes = tracing::field::Empty))]
pub async fn enhance_image(State(state): State<AppState>, multipart: Multipart) -> Result<Response> {
    let result = enhance(&state, multipart).await;
    metrics::counter!("enhance_requests_total", "outcome" => outcome_label(&result)).increment(1);
    result
}

async fn enhance(state: &AppState, mut multipart: Multipart) -> Result<Response> {
    let mut staged = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        Span::current().record("filename", filename.as_str());

        let extension = accepted_extension(&filename).map_err(|extension| Error::UnsupportedFileType {
            extension,
            as_client_error: state.config.uploads.reject_unsupported_with_client_error,
        })?;

        staged = Some(stage_upload(state, field, &extension).await?);
        break;
    }

    let Some(input) = staged else {
        return Err(Error::BadRequest {
            message: format!("Missing required field: '{FILE_FIELD}'"),
        });
    };

    let output = run_enhancement(state, input).await?;
    stream_output(output, state.config.storage.keep_outputs).await
}

/// Streams the `file` part to a fresh temp path. The returned guard deletes the file when dropped,
/// so partial uploads never outlive a failed request.
async fn stage_upload(state: &AppState, mut field: Field<'_>, extension: &str) -> Result<TempFileGuard> {
    let input = storage::guard(state.storage.staging_path(extension));
    let mut file = tokio::fs::OpenOptions::new().write(true).create_new(true).open(&*input).await?;

    let max_file_size = state.config.uploads.max_file_size;
    let mut total_size: u64 = 0;

    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        total_size += chunk.len() as u64;

        if max_file_size > 0 && total_size > max_file_size {
            return Err(Error::PayloadTooLarge {
                message: format!(
                    "File size exceeds maximum allowed size of {} bytes ({} MB)",
                    max_file_size,
                    max_file_size / (1024 * 1024)
                ),
            });
        }

        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Span::current().record("upload_bytes", total_size);

    if total_size == 0 {
        return Err(Error::BadRequest {
            message: "Uploaded file is empty".to_string(),
        });
    }

    debug!(path = %input.display(), total_size, "Upload staged");
    Ok(input)
}

/// Runs decode, inference and encode on the blocking pool.
///
/// The input guard and the limiter permit move into the blocking task, so the staged upload is
/// removed and the slot released as soon as the enhancement step finishes, whatever its outcome.
/// The output comes back guarded: if the client has gone away by then, dropping the task result
/// removes it.
async fn run_enhancement(state: &AppState, input: TempFileGuard) -> Result<TempFileGuard> {
    let permit = state.limiters.enhancement_permit().await?;

    let enhancer = state.enhancer.clone();
    let suffix = state.config.storage.output_suffix.clone();
    let started = Instant::now();

    let result = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        pipeline::enhance_file(enhancer.as_ref(), &input, &suffix).map(storage::guard)
    })
    .await
    .map_err(|e| Error::Internal {
        operation: format!("run enhancement task: {e}"),
    })?;

    let elapsed = started.elapsed();
    metrics::histogram!("enhance_inference_seconds").record(elapsed.as_secs_f64());

    let output = result?;
    info!(output = %output.display(), elapsed_ms = elapsed.as_millis() as u64, "Image enhanced");
    Ok(output)
}

/// Builds the `image/png` attachment response, streaming the file from disk.
async fn stream_output(output: TempFileGuard, keep_outputs: bool) -> Result<Response> {
    let file = tokio::fs::File::open(&*output).await?;
    let content_length = file.metadata().await?.len();

    let output = if keep_outputs {
        let kept = ScopeGuard::into_inner(output);
        debug!(path = %kept.display(), "Keeping enhanced file");
        None
    } else {
        Some(output)
    };

    // The guard rides along with the body and deletes the output once the stream is dropped
    let body = ReaderStream::new(file).map(move |chunk| {
        let _output = &output;
        chunk
    });

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{RESPONSE_FILENAME}\"")),
            (header::CONTENT_LENGTH, content_length.to_string()),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

fn multipart_error(e: MultipartError) -> Error {
    let message = e.body_text();
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        Error::PayloadTooLarge { message }
    } else {
        Error::BadRequest {
            message: format!("Failed to parse multipart data: {message}"),
        }
    }
}

fn outcome_label(result: &Result<Response>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(Error::UnsupportedFileType { .. }) => "unsupported",
        Err(Error::BadRequest { .. } | Error::Enhance(crate::inference::EnhanceError::Decode(_))) => "bad_request",
        Err(Error::PayloadTooLarge { .. }) => "too_large",
        Err(Error::TooManyRequests { .. }) => "throttled",
        Err(_) => "error",
    }
}
