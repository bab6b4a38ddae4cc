//! Alpha-channel decoding
//!
//! A lossy WebP frame can carry its alpha plane as a VP8L sub-stream (with
//! no signature; the dimensions come from the frame). When the stream uses
//! only a color-indexing transform, trivial red/blue/alpha trees and no
//! color cache, decoding runs in a one-byte-per-pixel fast path; otherwise
//! the regular 32-bit loop runs and the green channel is extracted.

use crate::bitreader::BitReader;
use crate::decoder::Vp8lDecoder;
use crate::transform::TransformKind;
use crate::{DecodeStatus, Vp8lError};

pub struct AlphaDecoder {
    width: usize,
    height: usize,
    dec: Vp8lDecoder,
    use_8b_decode: bool,
}

impl AlphaDecoder {
    /// `width` and `height` are the lossy frame's dimensions.
    pub fn new(width: usize, height: usize) -> Self {
        AlphaDecoder { width, height, dec: Vp8lDecoder::new(), use_8b_decode: false }
    }

    /// Parse the headers of the alpha sub-stream and pick the decode path.
    pub fn decode_header(&mut self, data: &[u8]) -> Result<(), Vp8lError> {
        if self.width == 0 || self.height == 0 {
            return Err(Vp8lError::InvalidParam("empty alpha plane"));
        }
        self.dec.clear();
        self.dec.width = self.width;
        self.dec.height = self.height;
        self.dec.io.width = self.width;
        self.dec.io.height = self.height;
        self.dec.input = data.to_vec();
        self.dec.br = BitReader::new(&self.dec.input, data.len());

        if let Err(e) = self.dec.decode_image_stream(self.width, self.height, true) {
            self.dec.clear();
            return Err(e);
        }

        // The frequent paletted case only needs one byte per pixel.
        self.use_8b_decode = self.dec.transforms.len() == 1
            && self.dec.transforms[0].kind == TransformKind::ColorIndexing
            && self.dec.is_8b_optimizable();
        log::debug!("alpha stream: 8-bit fast path = {}", self.use_8b_decode);

        let result = if self.use_8b_decode {
            self.dec.allocate_internal_buffers_8b()
        } else {
            self.dec.allocate_internal_buffers_32b(self.width)
        };
        if let Err(e) = result {
            self.dec.clear();
            return Err(e);
        }
        Ok(())
    }

    /// Decode alpha rows `[last decoded, last_row)` into `output`, a
    /// `width * height` plane owned by the caller.
    pub fn decode_rows(&mut self, data: &[u8], last_row: usize, output: &mut [u8]) -> Result<DecodeStatus, Vp8lError> {
        let last_row = last_row.min(self.height);
        if output.len() < self.width * self.height {
            return Err(Vp8lError::InvalidParam("alpha plane too small"));
        }
        if self.dec.last_pixel == self.dec.width * self.dec.height {
            return Ok(DecodeStatus::Complete);
        }
        if data.len() > self.dec.input.len() {
            self.dec.input = data.to_vec();
            self.dec.br.set_buffer_len(data.len());
        }
        if self.use_8b_decode {
            self.dec.decode_alpha_data(last_row, output)
        } else {
            self.dec.decode_alpha_rows_32(last_row, output)
        }
    }

    /// Number of alpha rows written so far.
    pub fn last_decoded_row(&self) -> usize {
        self.dec.last_out_row
    }
}
