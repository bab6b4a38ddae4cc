//! VP8L Lossless Decoder
//!
//! From-scratch decoder for the VP8L bitstream, the compressed payload of
//! WebP lossless images and of the alpha side-channel of lossy frames.
//! Reconstructs a 32-bit BGRA raster (or an 8-bit alpha plane), applying the
//! four inverse transforms, the tiled meta-Huffman model, the color cache
//! and the 2-D LZ77 back-reference scheme of the format. Supports cropping,
//! rescaling, several output colorspaces and incremental (suspend/resume)
//! decoding of truncated inputs.

mod alpha;
mod bitreader;
mod color_cache;
mod decoder;
mod huffman;
mod pipeline;
mod rescaler;
mod transform;

pub use alpha::AlphaDecoder;
pub use decoder::{check_signature, peek_info, Vp8lDecoder};
pub use pipeline::{ColorMode, YuvaPlanes};

/// VP8L decoding error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Vp8lError {
    #[error("invalid VP8L bitstream")]
    Bitstream,

    #[error("unsupported feature: {0}")]
    Unsupported(&'static str),

    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    #[error("out of memory")]
    OutOfMemory,
}

/// Outcome of a decode call that consumed all available input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The raster is fully decoded and emitted.
    Complete,
    /// Incremental mode ran out of input mid-raster; decoded state is kept
    /// and the call can be repeated with a longer (prefix-extending) buffer.
    Suspended,
}

/// Stream geometry from the 5-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: usize,
    pub height: usize,
    pub has_alpha: bool,
}

/// Region of the source image to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub left: usize,
    pub top: usize,
    pub width: usize,
    pub height: usize,
}

/// Per-decode configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Emit only this window of the image.
    pub crop: Option<CropRect>,
    /// Rescale the (cropped) image to these dimensions. A zero width or
    /// height is derived from the other to preserve aspect ratio.
    pub scaled: Option<(usize, usize)>,
    /// Keep restartable snapshots so a truncated input suspends instead of
    /// failing.
    pub incremental: bool,
}

/// Caller-owned destination for decoded pixels.
pub enum OutputBuffer<'a> {
    /// Interleaved bytes in one of the RGB-family layouts.
    Rgba {
        mode: ColorMode,
        data: &'a mut [u8],
        /// Row stride in bytes.
        stride: usize,
    },
    /// Planar YUV(A), 4:2:0 subsampled chroma.
    Yuva(YuvaPlanes<'a>),
}
