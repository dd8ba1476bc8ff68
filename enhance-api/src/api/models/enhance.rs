use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Multipart body of `POST /enhance`.
#[derive(Debug, ToSchema)]
pub struct EnhanceUpload {
    /// Image to enhance. Accepted extensions: .jpg, .jpeg, .png (any case).
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
}

/// The enhanced image, always PNG-encoded.
#[derive(Debug, ToSchema)]
#[schema(value_type = String, format = Binary)]
pub struct PngImage(pub Vec<u8>);

/// Error payload returned by every failing request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    #[schema(example = "Unsupported file type")]
    pub error: String,
}
