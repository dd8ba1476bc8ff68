//! OpenAPI document for the enhancement API, served at `/openapi.json` and rendered at `/docs`.

use utoipa::OpenApi;

use crate::api;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Image Enhancement API",
        description = "Upscales photos x4 with the BSRGAN super-resolution network."
    ),
    paths(api::handlers::enhance::enhance_image),
    components(schemas(api::models::enhance::EnhanceUpload, api::models::enhance::PngImage, api::models::enhance::ErrorBody)),
    tags(
        (name = "enhance", description = "Upload an image and receive the enhanced PNG.

Supported inputs are JPEG and PNG files named `.jpg`, `.jpeg` or `.png` (any case). \
The response is always a PNG attachment named `enhanced.png`."),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_describes_enhance() {
        let doc = ApiDoc::openapi();

        let path = doc.paths.paths.get("/enhance").expect("enhance path missing");
        assert!(path.post.is_some());

        let schemas = &doc.components.as_ref().expect("components missing").schemas;
        assert!(schemas.contains_key("ErrorBody"));
        assert!(schemas.contains_key("EnhanceUpload"));
    }
}
