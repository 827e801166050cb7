pub mod lerc;
pub mod raster;
pub mod terrain;
pub mod webp;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to decode image: {0}")]
    ImageDecode(String),
    #[error("failed to encode image: {0}")]
    ImageEncode(String),
    #[error("webp encoding failed: {0}")]
    WebpEncode(String),
    #[error("no child data to compose")]
    NoData,
}
