//! VP8L stream decoder
//!
//! Reads the stream header, the transform stack, the color-cache and Huffman
//! descriptors (both possibly via recursive sub-streams), then runs the
//! LZ77 + prefix-code + color-cache entropy loop over the pixel payload.
//! Every block of rows is handed to the output pipeline for inverse
//! transforms, cropping, optional rescaling and colorspace conversion.

use crate::bitreader::BitReader;
use crate::color_cache::ColorCache;
use crate::huffman::{
    self, HTreeGroup, HuffmanCode, ALPHA, BLUE, DIST, GREEN, HUFFMAN_CODES_PER_META_CODE,
    LENGTHS_TABLE_BITS, LENGTHS_TABLE_MASK, RED, TABLE_SIZE,
};
use crate::pipeline;
use crate::rescaler::Rescaler;
use crate::transform::{expand_color_map, subsample_size, Transform, TransformKind};
use crate::{DecodeOptions, DecodeStatus, ImageInfo, OutputBuffer, Vp8lError};

pub(crate) const NUM_ARGB_CACHE_ROWS: usize = 16;
const SYNC_EVERY_N_ROWS: usize = 8;

const NUM_LITERAL_CODES: usize = 256;
const NUM_LENGTH_CODES: usize = 24;
const NUM_DISTANCE_CODES: usize = 40;
const NUM_CODE_LENGTH_CODES: usize = 19;
const MAX_CACHE_BITS: u32 = 11;
const DEFAULT_CODE_LENGTH: u32 = 8;
const CODE_LENGTH_LITERALS: u32 = 16;
const CODE_LENGTH_EXTRA_BITS: [u32; 3] = [2, 3, 7];
const CODE_LENGTH_REPEAT_OFFSETS: [u32; 3] = [3, 3, 11];

const VP8L_MAGIC_BYTE: u8 = 0x2f;
const VP8L_IMAGE_SIZE_BITS: u32 = 14;
const VP8L_VERSION_BITS: u32 = 3;
pub(crate) const VP8L_FRAME_HEADER_SIZE: usize = 5;

const ALPHABET_SIZE: [usize; HUFFMAN_CODES_PER_META_CODE] = [
    NUM_LITERAL_CODES + NUM_LENGTH_CODES,
    NUM_LITERAL_CODES,
    NUM_LITERAL_CODES,
    NUM_LITERAL_CODES,
    NUM_DISTANCE_CODES,
];

const CODE_LENGTH_CODE_ORDER: [usize; NUM_CODE_LENGTH_CODES] = [
    17, 18, 0, 1, 2, 3, 4, 5, 16, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
];

// Short distance codes index this table of (y, x) offsets biased toward
// pixels just above the current one.
const CODE_TO_PLANE_CODES: usize = 120;
const CODE_TO_PLANE: [u8; CODE_TO_PLANE_CODES] = [
    0x18, 0x07, 0x17, 0x19, 0x28, 0x06, 0x27, 0x29, 0x16, 0x1a, 0x26, 0x2a, 0x38, 0x05, 0x37,
    0x39, 0x15, 0x1b, 0x36, 0x3a, 0x25, 0x2b, 0x48, 0x04, 0x47, 0x49, 0x14, 0x1c, 0x35, 0x3b,
    0x46, 0x4a, 0x24, 0x2c, 0x58, 0x45, 0x4b, 0x34, 0x3c, 0x03, 0x57, 0x59, 0x13, 0x1d, 0x56,
    0x5a, 0x23, 0x2d, 0x44, 0x4c, 0x55, 0x5b, 0x33, 0x3d, 0x68, 0x02, 0x67, 0x69, 0x12, 0x1e,
    0x66, 0x6a, 0x22, 0x2e, 0x54, 0x5c, 0x43, 0x4d, 0x65, 0x6b, 0x32, 0x3e, 0x78, 0x01, 0x77,
    0x79, 0x53, 0x5d, 0x11, 0x1f, 0x64, 0x6c, 0x42, 0x4e, 0x76, 0x7a, 0x21, 0x2f, 0x75, 0x7b,
    0x31, 0x3f, 0x63, 0x6d, 0x52, 0x5e, 0x00, 0x74, 0x7c, 0x41, 0x4f, 0x10, 0x20, 0x62, 0x6e,
    0x30, 0x73, 0x7d, 0x51, 0x5f, 0x40, 0x72, 0x7e, 0x61, 0x6f, 0x50, 0x71, 0x7f, 0x60, 0x70,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecoderState {
    ReadDim,
    ReadHdr,
    ReadData,
    Done,
}

/// Huffman-model metadata for the stream currently being decoded.
#[derive(Debug, Default)]
pub(crate) struct Metadata {
    pub color_cache: Option<ColorCache>,
    pub saved_color_cache: Option<ColorCache>,
    pub color_cache_size: usize,
    pub huffman_image: Vec<u32>,
    pub num_htree_groups: usize,
    pub htree_groups: Vec<HTreeGroup>,
    pub huffman_tables: Vec<HuffmanCode>,
    pub huffman_subsample_bits: u32,
    pub huffman_xsize: usize,
    pub huffman_mask: usize,
}

impl Metadata {
    fn clear(&mut self) {
        *self = Metadata::default();
    }
}

/// Output-space geometry: final dimensions, crop window and scaling request.
#[derive(Debug, Default, Clone)]
pub(crate) struct Io {
    pub width: usize,
    pub height: usize,
    pub crop_left: usize,
    pub crop_right: usize,
    pub crop_top: usize,
    pub crop_bottom: usize,
    pub use_scaling: bool,
    pub scaled_width: usize,
    pub scaled_height: usize,
}

enum Sink<'s, 'a, 'b> {
    None,
    Output(&'s mut OutputBuffer<'a>),
    Alpha(&'b mut [u8]),
}

enum Decoding {
    Finished,
    Suspended,
}

/// True when the 5-byte VP8L signature (magic byte and version 0) is present.
pub fn check_signature(data: &[u8]) -> bool {
    data.len() >= VP8L_FRAME_HEADER_SIZE && data[0] == VP8L_MAGIC_BYTE && (data[4] >> 5) == 0
}

/// Parse just the stream header: dimensions and the alpha hint.
pub fn peek_info(data: &[u8]) -> Option<ImageInfo> {
    if !check_signature(data) {
        return None;
    }
    let mut br = BitReader::new(data, data.len());
    read_image_info(&mut br, data).ok()
}

fn read_image_info(br: &mut BitReader, buf: &[u8]) -> Result<ImageInfo, Vp8lError> {
    if br.read(buf, 8) != VP8L_MAGIC_BYTE as u32 {
        return Err(Vp8lError::Bitstream);
    }
    let width = br.read(buf, VP8L_IMAGE_SIZE_BITS) as usize + 1;
    let height = br.read(buf, VP8L_IMAGE_SIZE_BITS) as usize + 1;
    let has_alpha = br.read(buf, 1) != 0;
    if br.read(buf, VP8L_VERSION_BITS) != 0 || br.eos() {
        return Err(Vp8lError::Bitstream);
    }
    Ok(ImageInfo { width, height, has_alpha })
}

fn checked_alloc_u32(len: usize) -> Result<Vec<u32>, Vp8lError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| Vp8lError::OutOfMemory)?;
    v.resize(len, 0);
    Ok(v)
}

fn checked_alloc_u8(len: usize) -> Result<Vec<u8>, Vp8lError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| Vp8lError::OutOfMemory)?;
    v.resize(len, 0);
    Ok(v)
}

fn plane_code_to_distance(xsize: usize, plane_code: usize) -> usize {
    if plane_code > CODE_TO_PLANE_CODES {
        plane_code - CODE_TO_PLANE_CODES
    } else {
        let dist_code = CODE_TO_PLANE[plane_code - 1] as i32;
        let yoffset = dist_code >> 4;
        let xoffset = 8 - (dist_code & 0xf);
        let dist = yoffset * xsize as i32 + xoffset;
        dist.max(1) as usize // dist < 1 can happen for very small xsize
    }
}

// Overlap is intentional: with dist < length the copy extends the pattern of
// the previous dist pixels. Small strides get a pattern fill.
fn copy_block32(data: &mut [u32], pos: usize, dist: usize, length: usize) {
    if dist >= length {
        data.copy_within(pos - dist..pos - dist + length, pos);
        return;
    }
    match dist {
        1 => {
            let v = data[pos - 1];
            data[pos..pos + length].fill(v);
        }
        2 => {
            let pattern = [data[pos - 2], data[pos - 1]];
            for (i, px) in data[pos..pos + length].iter_mut().enumerate() {
                *px = pattern[i & 1];
            }
        }
        _ => {
            for i in 0..length {
                data[pos + i] = data[pos + i - dist];
            }
        }
    }
}

fn copy_block8(data: &mut [u8], pos: usize, dist: usize, length: usize) {
    if dist >= length {
        data.copy_within(pos - dist..pos - dist + length, pos);
        return;
    }
    match dist {
        1 => {
            let v = data[pos - 1];
            data[pos..pos + length].fill(v);
        }
        2 | 4 => {
            let mut pattern = [0u8; 4];
            pattern[..dist].copy_from_slice(&data[pos - dist..pos]);
            for (i, b) in data[pos..pos + length].iter_mut().enumerate() {
                *b = pattern[i % dist];
            }
        }
        _ => {
            for i in 0..length {
                data[pos + i] = data[pos + i - dist];
            }
        }
    }
}

/// VP8L decoder instance. One instance decodes one stream; `clear` resets it
/// for reuse from byte zero.
pub struct Vp8lDecoder {
    pub(crate) state: DecoderState,
    pub(crate) input: Vec<u8>,
    pub(crate) br: BitReader,
    saved_br: BitReader,
    saved_last_pixel: usize,
    pub(crate) width: usize,
    pub(crate) height: usize,
    pub(crate) has_alpha: bool,
    pub(crate) io: Io,
    pub(crate) hdr: Metadata,
    pub(crate) transforms: Vec<Transform>,
    transforms_seen: u8,
    pub(crate) pixels: Vec<u32>,
    pub(crate) pixels8: Vec<u8>,
    scratch: Vec<u32>,
    scratch_base: usize,
    rescaler: Option<Rescaler>,
    pub(crate) last_pixel: usize,
    pub(crate) last_row: usize,
    pub(crate) last_out_row: usize,
    incremental: bool,
}

impl Default for Vp8lDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Vp8lDecoder {
    pub fn new() -> Self {
        Vp8lDecoder {
            state: DecoderState::ReadDim,
            input: Vec::new(),
            br: BitReader::default(),
            saved_br: BitReader::default(),
            saved_last_pixel: 0,
            width: 0,
            height: 0,
            has_alpha: false,
            io: Io::default(),
            hdr: Metadata::default(),
            transforms: Vec::new(),
            transforms_seen: 0,
            pixels: Vec::new(),
            pixels8: Vec::new(),
            scratch: Vec::new(),
            scratch_base: 0,
            rescaler: None,
            last_pixel: 0,
            last_row: 0,
            last_out_row: 0,
            incremental: false,
        }
    }

    /// Drop all decoded state; the decoder must be fed a stream from byte
    /// zero again.
    pub fn clear(&mut self) {
        *self = Vp8lDecoder::new();
    }

    /// Number of output rows emitted so far.
    pub fn last_decoded_row(&self) -> usize {
        self.last_out_row
    }

    /// The alpha hint from the stream header.
    pub fn has_alpha(&self) -> bool {
        self.has_alpha
    }

    /// Parse the signature, the transforms and the complete Huffman model.
    /// After this the decoder knows the image geometry and is ready for
    /// `decode_image`.
    pub fn read_header(&mut self, data: &[u8]) -> Result<ImageInfo, Vp8lError> {
        self.clear();
        self.input = data.to_vec();
        self.br = BitReader::new(&self.input, self.input.len());
        let info = match read_image_info(&mut self.br, &self.input) {
            Ok(info) => info,
            Err(e) => {
                self.clear();
                return Err(e);
            }
        };
        self.width = info.width;
        self.height = info.height;
        self.has_alpha = info.has_alpha;
        self.io.width = info.width;
        self.io.height = info.height;
        log::debug!("vp8l header: {}x{} alpha={}", info.width, info.height, info.has_alpha);
        if let Err(e) = self.decode_image_stream(info.width, info.height, true) {
            log::warn!("vp8l header rejected: {}", e);
            self.clear();
            return Err(e);
        }
        Ok(info)
    }

    /// Decode the pixel payload into `output`. Returns `Suspended` (in
    /// incremental mode) when the input ran out mid-raster; call again with a
    /// prefix-extended buffer to continue.
    pub fn decode_image(
        &mut self,
        data: &[u8],
        output: &mut OutputBuffer<'_>,
        options: &DecodeOptions,
    ) -> Result<DecodeStatus, Vp8lError> {
        if self.state == DecoderState::Done {
            return Ok(DecodeStatus::Complete);
        }
        self.refresh_input(data);
        if self.state != DecoderState::ReadData {
            if self.state != DecoderState::ReadHdr {
                return Err(Vp8lError::InvalidParam("header not read"));
            }
            self.setup_output(output, options)?;
            self.state = DecoderState::ReadData;
        }
        let outcome = {
            let mut sink = Sink::Output(output);
            self.decode_image_data_32(self.height, &mut sink)
        };
        match outcome {
            Ok(Decoding::Finished) => {
                self.state = DecoderState::Done;
                Ok(DecodeStatus::Complete)
            }
            Ok(Decoding::Suspended) => Ok(DecodeStatus::Suspended),
            Err(e) => {
                self.clear();
                Err(e)
            }
        }
    }

    fn refresh_input(&mut self, data: &[u8]) {
        if data.len() > self.input.len() {
            debug_assert_eq!(&data[..self.input.len()], &self.input[..]);
            self.input = data.to_vec();
            self.br.set_buffer_len(self.input.len());
        }
    }

    fn setup_output(&mut self, output: &OutputBuffer<'_>, options: &DecodeOptions) -> Result<(), Vp8lError> {
        let w = self.io.width;
        let h = self.io.height;
        let (x, y, cw, ch) = match options.crop {
            Some(c) => {
                if c.width == 0 || c.height == 0 || c.left + c.width > w || c.top + c.height > h {
                    return Err(Vp8lError::InvalidParam("crop outside frame"));
                }
                (c.left, c.top, c.width, c.height)
            }
            None => (0, 0, w, h),
        };
        self.io.crop_left = x;
        self.io.crop_top = y;
        self.io.crop_right = x + cw;
        self.io.crop_bottom = y + ch;

        let (out_w, out_h) = match options.scaled {
            Some((sw, sh)) => {
                let (sw, sh) = scaled_dimensions(cw, ch, sw, sh)
                    .ok_or(Vp8lError::InvalidParam("bad scaled dimensions"))?;
                self.io.use_scaling = true;
                self.io.scaled_width = sw;
                self.io.scaled_height = sh;
                (sw, sh)
            }
            None => {
                self.io.use_scaling = false;
                (cw, ch)
            }
        };

        match output {
            OutputBuffer::Rgba { mode, data, stride } => {
                let bpp = mode.bytes_per_pixel();
                if *stride < out_w * bpp || data.len() < (out_h - 1) * stride + out_w * bpp {
                    return Err(Vp8lError::InvalidParam("output buffer too small"));
                }
            }
            OutputBuffer::Yuva(p) => {
                let uv_w = (out_w + 1) / 2;
                let uv_h = (out_h + 1) / 2;
                if p.y_stride < out_w
                    || p.y.len() < (out_h - 1) * p.y_stride + out_w
                    || p.u_stride < uv_w
                    || p.u.len() < (uv_h - 1) * p.u_stride + uv_w
                    || p.v_stride < uv_w
                    || p.v.len() < (uv_h - 1) * p.v_stride + uv_w
                {
                    return Err(Vp8lError::InvalidParam("yuva planes too small"));
                }
                if let Some(a) = &p.a {
                    if p.a_stride < out_w || a.len() < (out_h - 1) * p.a_stride + out_w {
                        return Err(Vp8lError::InvalidParam("alpha plane too small"));
                    }
                }
            }
        }

        self.allocate_internal_buffers_32b(self.io.width)?;
        if self.io.use_scaling {
            self.rescaler = Some(Rescaler::new(cw, ch, out_w, out_h));
        }
        self.incremental = options.incremental;
        if self.incremental {
            if let Some(cc) = &self.hdr.color_cache {
                let mut shadow = ColorCache::new(cc.len().trailing_zeros());
                cc.copy_to(&mut shadow);
                self.hdr.saved_color_cache = Some(shadow);
            }
        }
        Ok(())
    }

    pub(crate) fn allocate_internal_buffers_32b(&mut self, final_width: usize) -> Result<(), Vp8lError> {
        let num_pixels = self
            .width
            .checked_mul(self.height)
            .ok_or(Vp8lError::OutOfMemory)?;
        self.pixels = checked_alloc_u32(num_pixels)?;
        // One top-prediction row, then the row-block scratch.
        self.scratch = checked_alloc_u32(final_width * (NUM_ARGB_CACHE_ROWS + 1))?;
        self.scratch_base = final_width;
        Ok(())
    }

    pub(crate) fn allocate_internal_buffers_8b(&mut self) -> Result<(), Vp8lError> {
        let num_pixels = self
            .width
            .checked_mul(self.height)
            .ok_or(Vp8lError::OutOfMemory)?;
        self.pixels8 = checked_alloc_u8(num_pixels)?;
        Ok(())
    }

    fn read_bits(&mut self, n: u32) -> u32 {
        self.br.read(&self.input, n)
    }

    // ------------------------------------------------------------------
    // Header structures

    /// Decode one (possibly recursive) image stream. At level 0 the stream
    /// may declare transforms and a meta-Huffman image; sub-streams may not.
    /// Sub-streams decode their pixels immediately and return them.
    pub(crate) fn decode_image_stream(
        &mut self,
        xsize: usize,
        ysize: usize,
        is_level0: bool,
    ) -> Result<Option<Vec<u32>>, Vp8lError> {
        let mut transform_xsize = xsize;
        let transform_ysize = ysize;

        if is_level0 {
            while self.read_bits(1) != 0 {
                self.read_transform(&mut transform_xsize, transform_ysize)?;
            }
        }

        let mut color_cache_bits = 0;
        if self.read_bits(1) != 0 {
            color_cache_bits = self.read_bits(4);
            if !(1..=MAX_CACHE_BITS).contains(&color_cache_bits) {
                return Err(Vp8lError::Bitstream);
            }
        }

        self.read_huffman_codes(transform_xsize, transform_ysize, color_cache_bits, is_level0)?;

        if color_cache_bits > 0 {
            self.hdr.color_cache_size = 1 << color_cache_bits;
            self.hdr.color_cache = Some(ColorCache::new(color_cache_bits));
        } else {
            self.hdr.color_cache_size = 0;
            self.hdr.color_cache = None;
        }
        self.update_decoder(transform_xsize, transform_ysize);

        if is_level0 {
            self.state = DecoderState::ReadHdr;
            return Ok(None);
        }

        let total = transform_xsize
            .checked_mul(transform_ysize)
            .ok_or(Vp8lError::OutOfMemory)?;
        self.pixels = checked_alloc_u32(total)?;
        let outcome = self.decode_image_data_32(transform_ysize, &mut Sink::None)?;
        if matches!(outcome, Decoding::Suspended) || self.br.eos() {
            return Err(Vp8lError::Bitstream);
        }
        let data = std::mem::take(&mut self.pixels);
        self.last_pixel = 0;
        self.hdr.clear();
        Ok(Some(data))
    }

    fn read_transform(&mut self, xsize: &mut usize, ysize: usize) -> Result<(), Vp8lError> {
        let kind = TransformKind::from_bits(self.read_bits(2)).expect("2-bit transform kind");
        let kind_bit = 1u8 << (kind as u8);
        // Each transform kind may appear at most once.
        if self.transforms_seen & kind_bit != 0 {
            return Err(Vp8lError::Bitstream);
        }
        self.transforms_seen |= kind_bit;
        let orig_xsize = *xsize;
        log::debug!("vp8l transform {:?} at {}x{}", kind, orig_xsize, ysize);

        let transform = match kind {
            TransformKind::Predictor | TransformKind::CrossColor => {
                let bits = self.read_bits(3) + 2;
                let data = self
                    .decode_image_stream(subsample_size(orig_xsize, bits), subsample_size(ysize, bits), false)?
                    .expect("sub-stream returns data");
                Transform { kind, bits, xsize: orig_xsize, ysize, data }
            }
            TransformKind::ColorIndexing => {
                let num_colors = self.read_bits(8) as usize + 1;
                let bits = if num_colors > 16 {
                    0
                } else if num_colors > 4 {
                    1
                } else if num_colors > 2 {
                    2
                } else {
                    3
                };
                *xsize = subsample_size(orig_xsize, bits);
                let packed = self
                    .decode_image_stream(num_colors, 1, false)?
                    .expect("sub-stream returns data");
                let data = expand_color_map(num_colors, bits, &packed);
                Transform { kind, bits, xsize: orig_xsize, ysize, data }
            }
            TransformKind::SubtractGreen => Transform { kind, bits: 0, xsize: orig_xsize, ysize, data: Vec::new() },
        };
        self.transforms.push(transform);
        Ok(())
    }

    fn read_huffman_codes(
        &mut self,
        xsize: usize,
        ysize: usize,
        color_cache_bits: u32,
        allow_recursion: bool,
    ) -> Result<(), Vp8lError> {
        let mut huffman_image = Vec::new();
        let mut huffman_subsample_bits = 0;
        let mut num_htree_groups = 1usize;

        if allow_recursion && self.read_bits(1) != 0 {
            let precision = self.read_bits(3) + 2;
            let hx = subsample_size(xsize, precision);
            let hy = subsample_size(ysize, precision);
            let mut image = self
                .decode_image_stream(hx, hy, false)?
                .expect("sub-stream returns data");
            huffman_subsample_bits = precision;
            for px in image.iter_mut() {
                // The group index is stored in the red and green bytes.
                let group = (*px >> 8) & 0xffff;
                *px = group;
                if group as usize >= num_htree_groups {
                    num_htree_groups = group as usize + 1;
                }
            }
            huffman_image = image;
            log::debug!("vp8l meta-huffman: {} groups, {} tile bits", num_htree_groups, precision);
        }

        if self.br.eos() {
            return Err(Vp8lError::Bitstream);
        }

        let table_size = TABLE_SIZE[color_cache_bits as usize];
        let total_entries = num_htree_groups
            .checked_mul(table_size)
            .ok_or(Vp8lError::OutOfMemory)?;
        let mut tables = {
            let mut v = Vec::new();
            v.try_reserve_exact(total_entries).map_err(|_| Vp8lError::OutOfMemory)?;
            v.resize(total_entries, HuffmanCode::default());
            v
        };
        let mut groups = Vec::with_capacity(num_htree_groups);
        let mut next = 0usize;
        for _ in 0..num_htree_groups {
            let mut group = HTreeGroup::default();
            let mut is_trivial_literal = true;
            for j in 0..HUFFMAN_CODES_PER_META_CODE {
                let mut alphabet_size = ALPHABET_SIZE[j];
                if j == 0 && color_cache_bits > 0 {
                    alphabet_size += 1 << color_cache_bits;
                }
                group.htrees[j] = next;
                let size = self.read_huffman_code(alphabet_size, &mut tables, next)?;
                if is_trivial_literal && (j == RED || j == BLUE || j == ALPHA) {
                    is_trivial_literal = tables[next].bits == 0;
                }
                next += size;
            }
            group.is_trivial_literal = is_trivial_literal;
            if is_trivial_literal {
                let red = tables[group.htrees[RED]].value as u32;
                let blue = tables[group.htrees[BLUE]].value as u32;
                let alpha = tables[group.htrees[ALPHA]].value as u32;
                group.literal_arb = (alpha << 24) | (red << 16) | blue;
            }
            groups.push(group);
        }

        self.hdr.huffman_image = huffman_image;
        self.hdr.huffman_subsample_bits = huffman_subsample_bits;
        self.hdr.num_htree_groups = num_htree_groups;
        self.hdr.htree_groups = groups;
        self.hdr.huffman_tables = tables;
        Ok(())
    }

    fn read_huffman_code(
        &mut self,
        alphabet_size: usize,
        tables: &mut [HuffmanCode],
        offset: usize,
    ) -> Result<usize, Vp8lError> {
        let mut code_lengths = vec![0u32; alphabet_size];
        let simple = self.read_bits(1) != 0;

        if simple {
            // Symbols and code lengths are spelled out directly. A symbol
            // outside the alphabet is dropped; the table build below then
            // rejects the tree if nothing valid remains.
            let num_symbols = self.read_bits(1) as usize + 1;
            let first_8bit = self.read_bits(1) != 0;
            let symbol = self.read_bits(if first_8bit { 8 } else { 1 }) as usize;
            if symbol < alphabet_size {
                code_lengths[symbol] = 1;
            }
            if num_symbols == 2 {
                let symbol = self.read_bits(8) as usize;
                if symbol < alphabet_size {
                    code_lengths[symbol] = 1;
                }
            }
        } else {
            let mut code_length_code_lengths = [0u32; NUM_CODE_LENGTH_CODES];
            let num_codes = self.read_bits(4) as usize + 4;
            if num_codes > NUM_CODE_LENGTH_CODES {
                return Err(Vp8lError::Bitstream);
            }
            for i in 0..num_codes {
                code_length_code_lengths[CODE_LENGTH_CODE_ORDER[i]] = self.read_bits(3);
            }
            self.read_huffman_code_lengths(&code_length_code_lengths, alphabet_size, &mut code_lengths)?;
        }

        if self.br.eos() {
            return Err(Vp8lError::Bitstream);
        }
        let size = huffman::build_huffman_table(tables, offset, huffman::HUFFMAN_TABLE_BITS, &code_lengths);
        if size == 0 {
            return Err(Vp8lError::Bitstream);
        }
        Ok(size)
    }

    fn read_huffman_code_lengths(
        &mut self,
        code_length_code_lengths: &[u32; NUM_CODE_LENGTH_CODES],
        num_symbols: usize,
        code_lengths: &mut [u32],
    ) -> Result<(), Vp8lError> {
        let mut table = vec![HuffmanCode::default(); 1 << LENGTHS_TABLE_BITS];
        if huffman::build_huffman_table(&mut table, 0, LENGTHS_TABLE_BITS, code_length_code_lengths) == 0 {
            return Err(Vp8lError::Bitstream);
        }

        let mut max_symbol = if self.read_bits(1) != 0 {
            let length_nbits = 2 + 2 * self.read_bits(3);
            let max = 2 + self.read_bits(length_nbits) as usize;
            if max > num_symbols {
                return Err(Vp8lError::Bitstream);
            }
            max
        } else {
            num_symbols
        };

        let mut symbol = 0usize;
        let mut prev_code_len = DEFAULT_CODE_LENGTH;
        while symbol < num_symbols {
            if max_symbol == 0 {
                break;
            }
            max_symbol -= 1;
            self.br.fill_window(&self.input);
            let entry = table[(self.br.prefetch() & LENGTHS_TABLE_MASK) as usize];
            self.br.set_bit_pos(self.br.bit_pos() + entry.bits as u32);
            let code_len = entry.value as u32;
            if code_len < CODE_LENGTH_LITERALS {
                code_lengths[symbol] = code_len;
                symbol += 1;
                if code_len != 0 {
                    prev_code_len = code_len;
                }
            } else {
                let use_prev = code_len == CODE_LENGTH_LITERALS; // symbol 16
                let slot = (code_len - CODE_LENGTH_LITERALS) as usize;
                let extra_bits = CODE_LENGTH_EXTRA_BITS[slot];
                let repeat_offset = CODE_LENGTH_REPEAT_OFFSETS[slot];
                let repeat = self.read_bits(extra_bits) + repeat_offset;
                if symbol + repeat as usize > num_symbols {
                    return Err(Vp8lError::Bitstream);
                }
                let length = if use_prev { prev_code_len } else { 0 };
                for _ in 0..repeat {
                    code_lengths[symbol] = length;
                    symbol += 1;
                }
            }
        }
        Ok(())
    }

    fn update_decoder(&mut self, width: usize, height: usize) {
        let num_bits = self.hdr.huffman_subsample_bits;
        self.width = width;
        self.height = height;
        self.hdr.huffman_xsize = subsample_size(width, num_bits);
        self.hdr.huffman_mask = if num_bits == 0 { usize::MAX } else { (1 << num_bits) - 1 };
    }

    fn htree_group_for(&self, x: usize, y: usize) -> HTreeGroup {
        let hdr = &self.hdr;
        let index = if hdr.huffman_subsample_bits == 0 || hdr.huffman_image.is_empty() {
            0
        } else {
            let bits = hdr.huffman_subsample_bits;
            hdr.huffman_image[hdr.huffman_xsize * (y >> bits) + (x >> bits)] as usize
        };
        debug_assert!(index < hdr.num_htree_groups);
        hdr.htree_groups[index]
    }

    // ------------------------------------------------------------------
    // Entropy loop

    fn get_copy_distance(&mut self, distance_symbol: usize) -> usize {
        if distance_symbol < 4 {
            return distance_symbol + 1;
        }
        let extra_bits = (distance_symbol as u32 - 2) >> 1;
        let offset = (2 + (distance_symbol & 1)) << extra_bits;
        offset + self.read_bits(extra_bits) as usize + 1
    }

    fn get_copy_length(&mut self, length_symbol: usize) -> usize {
        // Length and distance prefixes share the same encoding.
        self.get_copy_distance(length_symbol)
    }

    fn save_state(&mut self, last_pixel: usize) {
        debug_assert!(self.incremental);
        self.saved_br = self.br;
        self.saved_last_pixel = last_pixel;
        if let (Some(live), Some(shadow)) = (&self.hdr.color_cache, &mut self.hdr.saved_color_cache) {
            live.copy_to(shadow);
        }
    }

    fn restore_state(&mut self) {
        debug_assert!(self.br.eos());
        self.br = self.saved_br;
        self.last_pixel = self.saved_last_pixel;
        if let (Some(shadow), Some(live)) = (&self.hdr.saved_color_cache, &mut self.hdr.color_cache) {
            shadow.copy_to(live);
        }
    }

    fn sink_process(&mut self, sink: &mut Sink<'_, '_, '_>, row: usize) {
        match sink {
            Sink::None => {}
            Sink::Output(out) => self.process_rows(row, out),
            Sink::Alpha(buf) => self.extract_alpha_rows(row, buf),
        }
    }

    fn decode_image_data_32(&mut self, last_row: usize, sink: &mut Sink<'_, '_, '_>) -> Result<Decoding, Vp8lError> {
        let width = self.width;
        let height = self.height;
        let mut row = self.last_pixel / width;
        let mut col = self.last_pixel % width;
        let mut group = self.htree_group_for(col, row);
        let mut pos = self.last_pixel;
        let mut last_cached = pos;
        let end = width * height;
        let last = width * last_row;
        let len_code_limit = NUM_LITERAL_CODES + NUM_LENGTH_CODES;
        let color_cache_limit = len_code_limit + self.hdr.color_cache_size;
        let mask = self.hdr.huffman_mask;
        let mut next_sync_row = if self.incremental { row } else { usize::MAX };

        debug_assert!(pos < end);
        debug_assert!(last <= end);

        while pos < last {
            if row >= next_sync_row {
                self.save_state(pos);
                next_sync_row = row + SYNC_EVERY_N_ROWS;
            }
            // The group only changes on tile boundaries.
            if col & mask == 0 {
                group = self.htree_group_for(col, row);
            }
            self.br.fill_window(&self.input);
            let code =
                huffman::read_symbol(&self.hdr.huffman_tables, group.htrees[GREEN], &mut self.br) as usize;
            if self.br.eos() {
                break;
            }
            if code < NUM_LITERAL_CODES {
                let px = if group.is_trivial_literal {
                    group.literal_arb | ((code as u32) << 8)
                } else {
                    let red = huffman::read_symbol(&self.hdr.huffman_tables, group.htrees[RED], &mut self.br);
                    self.br.fill_window(&self.input);
                    let blue = huffman::read_symbol(&self.hdr.huffman_tables, group.htrees[BLUE], &mut self.br);
                    let alpha = huffman::read_symbol(&self.hdr.huffman_tables, group.htrees[ALPHA], &mut self.br);
                    if self.br.eos() {
                        break;
                    }
                    (alpha << 24) | (red << 16) | ((code as u32) << 8) | blue
                };
                self.pixels[pos] = px;
                pos += 1;
                col += 1;
                if col >= width {
                    col = 0;
                    row += 1;
                    if row % NUM_ARGB_CACHE_ROWS == 0 {
                        self.sink_process(sink, row);
                    }
                    if let Some(cc) = self.hdr.color_cache.as_mut() {
                        while last_cached < pos {
                            cc.insert(self.pixels[last_cached]);
                            last_cached += 1;
                        }
                    }
                }
            } else if code < len_code_limit {
                let length_sym = code - NUM_LITERAL_CODES;
                let length = self.get_copy_length(length_sym);
                let dist_symbol =
                    huffman::read_symbol(&self.hdr.huffman_tables, group.htrees[DIST], &mut self.br) as usize;
                self.br.fill_window(&self.input);
                let dist_code = self.get_copy_distance(dist_symbol);
                let dist = plane_code_to_distance(width, dist_code);
                if self.br.eos() {
                    break;
                }
                if pos < dist || end - pos < length {
                    return Err(Vp8lError::Bitstream);
                }
                copy_block32(&mut self.pixels, pos, dist, length);
                pos += length;
                col += length;
                while col >= width {
                    col -= width;
                    row += 1;
                    if row % NUM_ARGB_CACHE_ROWS == 0 {
                        self.sink_process(sink, row);
                    }
                }
                if col & mask != 0 {
                    group = self.htree_group_for(col, row);
                }
                if let Some(cc) = self.hdr.color_cache.as_mut() {
                    while last_cached < pos {
                        cc.insert(self.pixels[last_cached]);
                        last_cached += 1;
                    }
                }
            } else if code < color_cache_limit {
                let key = code - len_code_limit;
                let px = {
                    // A cache-coded symbol implies the cache exists. Bring it
                    // up to date, in raster order, then emit.
                    let cc = self.hdr.color_cache.as_mut().expect("color cache present");
                    while last_cached < pos {
                        cc.insert(self.pixels[last_cached]);
                        last_cached += 1;
                    }
                    cc.lookup(key)
                };
                self.pixels[pos] = px;
                pos += 1;
                col += 1;
                if col >= width {
                    col = 0;
                    row += 1;
                    if row % NUM_ARGB_CACHE_ROWS == 0 {
                        self.sink_process(sink, row);
                    }
                    if let Some(cc) = self.hdr.color_cache.as_mut() {
                        while last_cached < pos {
                            cc.insert(self.pixels[last_cached]);
                            last_cached += 1;
                        }
                    }
                }
            } else {
                return Err(Vp8lError::Bitstream);
            }
        }

        if self.incremental && self.br.eos() && pos < end {
            log::debug!("vp8l suspended at pixel {} of {}", self.saved_last_pixel, end);
            self.restore_state();
            Ok(Decoding::Suspended)
        } else if !self.br.eos() {
            // Flush the rows of the final, possibly partial, block.
            self.sink_process(sink, row);
            self.last_pixel = pos;
            Ok(Decoding::Finished)
        } else {
            Err(Vp8lError::Bitstream)
        }
    }

    /// The 8-bit fast path: one byte per pixel, no color cache, trivial
    /// red/blue/alpha trees guaranteed by the caller.
    pub(crate) fn decode_alpha_data(&mut self, last_row: usize, output: &mut [u8]) -> Result<DecodeStatus, Vp8lError> {
        let width = self.width;
        let height = self.height;
        let mut row = self.last_pixel / width;
        let mut col = self.last_pixel % width;
        let mut group = self.htree_group_for(col, row);
        let mut pos = self.last_pixel;
        let end = width * height;
        let last = width * last_row;
        let len_code_limit = NUM_LITERAL_CODES + NUM_LENGTH_CODES;
        let mask = self.hdr.huffman_mask;
        let mut ok = true;

        while !self.br.eos() && pos < last {
            if col & mask == 0 {
                group = self.htree_group_for(col, row);
            }
            self.br.fill_window(&self.input);
            let code =
                huffman::read_symbol(&self.hdr.huffman_tables, group.htrees[GREEN], &mut self.br) as usize;
            if code < NUM_LITERAL_CODES {
                self.pixels8[pos] = code as u8;
                pos += 1;
                col += 1;
                if col >= width {
                    col = 0;
                    row += 1;
                    if row % NUM_ARGB_CACHE_ROWS == 0 {
                        self.extract_paletted_alpha_rows(row, output);
                    }
                }
            } else if code < len_code_limit {
                let length_sym = code - NUM_LITERAL_CODES;
                let length = self.get_copy_length(length_sym);
                let dist_symbol =
                    huffman::read_symbol(&self.hdr.huffman_tables, group.htrees[DIST], &mut self.br) as usize;
                self.br.fill_window(&self.input);
                let dist_code = self.get_copy_distance(dist_symbol);
                let dist = plane_code_to_distance(width, dist_code);
                if pos >= dist && end - pos >= length {
                    copy_block8(&mut self.pixels8, pos, dist, length);
                } else {
                    ok = false;
                    break;
                }
                pos += length;
                col += length;
                while col >= width {
                    col -= width;
                    row += 1;
                    if row % NUM_ARGB_CACHE_ROWS == 0 {
                        self.extract_paletted_alpha_rows(row, output);
                    }
                }
                if pos < last && (col & mask) != 0 {
                    group = self.htree_group_for(col, row);
                }
            } else {
                // No color cache in the 8-bit path.
                ok = false;
                break;
            }
        }
        if ok {
            // Rows of the last, possibly partial, block.
            self.extract_paletted_alpha_rows(row, output);
        }
        if !ok || (self.br.eos() && pos < end) {
            if self.br.eos() {
                Ok(DecodeStatus::Suspended)
            } else {
                Err(Vp8lError::Bitstream)
            }
        } else {
            self.last_pixel = pos;
            Ok(DecodeStatus::Complete)
        }
    }

    pub(crate) fn decode_alpha_rows_32(&mut self, last_row: usize, output: &mut [u8]) -> Result<DecodeStatus, Vp8lError> {
        let outcome = {
            let mut sink = Sink::Alpha(output);
            self.decode_image_data_32(last_row, &mut sink)?
        };
        match outcome {
            Decoding::Finished => Ok(DecodeStatus::Complete),
            Decoding::Suspended => Ok(DecodeStatus::Suspended),
        }
    }

    // ------------------------------------------------------------------
    // Row processing

    fn apply_inverse_transforms(&mut self, start_row: usize, end_row: usize) {
        let width = self.width;
        let base = self.scratch_base;
        let num_pixels = width * (end_row - start_row);
        self.scratch[base..base + num_pixels]
            .copy_from_slice(&self.pixels[width * start_row..width * end_row]);
        let mut ext_in: Option<&[u32]> = Some(&self.pixels[width * start_row..width * end_row]);
        for t in self.transforms.iter().rev() {
            t.inverse(start_row, end_row, ext_in.take(), &mut self.scratch, base);
        }
    }

    fn process_rows(&mut self, row: usize, out: &mut OutputBuffer<'_>) {
        let num_rows = row.saturating_sub(self.last_row);
        if num_rows == 0 {
            return;
        }
        self.apply_inverse_transforms(self.last_row, row);

        let stride = self.io.width; // rows are final-width after transforms
        let base = self.scratch_base;
        let window = pipeline::set_crop_window(
            self.io.crop_left,
            self.io.crop_right,
            self.io.crop_top,
            self.io.crop_bottom,
            self.last_row,
            row,
            stride,
        );
        if let Some(win) = window {
            match out {
                OutputBuffer::Rgba { mode, data, stride: out_stride } => {
                    let mode = *mode;
                    let out_stride = *out_stride;
                    if self.io.use_scaling {
                        let scaled_w = self.io.scaled_width;
                        let bpp = mode.bytes_per_pixel();
                        let resc = self.rescaler.as_mut().expect("rescaler configured");
                        let mut lines_in = 0;
                        let mut num_out = 0;
                        while lines_in < win.height {
                            let needed = resc.needed_lines(win.height - lines_in);
                            let block_off = base + win.data_offset + lines_in * stride;
                            for r in 0..needed {
                                let s = &mut self.scratch[block_off + r * stride..][..win.width];
                                pipeline::mult_argb_row(s, false);
                            }
                            let imported = resc.import(&self.scratch[block_off..], needed, stride);
                            debug_assert_eq!(imported, needed);
                            lines_in += needed;
                            while resc.has_pending_output() {
                                let row_px = resc.export_row();
                                pipeline::mult_argb_row(row_px, true);
                                let off = (self.last_out_row + num_out) * out_stride;
                                pipeline::convert_from_bgra(row_px, mode, &mut data[off..off + scaled_w * bpp]);
                                num_out += 1;
                            }
                        }
                        self.last_out_row += num_out;
                    } else {
                        let bpp = mode.bytes_per_pixel();
                        for r in 0..win.height {
                            let src = &self.scratch[base + win.data_offset + r * stride..][..win.width];
                            let off = (self.last_out_row + r) * out_stride;
                            pipeline::convert_from_bgra(src, mode, &mut data[off..off + win.width * bpp]);
                        }
                        self.last_out_row += win.height;
                    }
                }
                OutputBuffer::Yuva(planes) => {
                    if self.io.use_scaling {
                        let scaled_w = self.io.scaled_width;
                        let resc = self.rescaler.as_mut().expect("rescaler configured");
                        let mut lines_in = 0;
                        while lines_in < win.height {
                            let needed = resc.needed_lines(win.height - lines_in);
                            let block_off = base + win.data_offset + lines_in * stride;
                            for r in 0..needed {
                                let s = &mut self.scratch[block_off + r * stride..][..win.width];
                                pipeline::mult_argb_row(s, false);
                            }
                            let imported = resc.import(&self.scratch[block_off..], needed, stride);
                            debug_assert_eq!(imported, needed);
                            lines_in += needed;
                            while resc.has_pending_output() {
                                let row_px = resc.export_row();
                                pipeline::mult_argb_row(row_px, true);
                                pipeline::convert_to_yuva(row_px, scaled_w, self.last_out_row, planes);
                                self.last_out_row += 1;
                            }
                        }
                    } else {
                        for r in 0..win.height {
                            let src = &self.scratch[base + win.data_offset + r * stride..][..win.width];
                            pipeline::convert_to_yuva(src, win.width, self.last_out_row, planes);
                            self.last_out_row += 1;
                        }
                    }
                }
            }
            let out_height = if self.io.use_scaling {
                self.io.scaled_height
            } else {
                self.io.crop_bottom - self.io.crop_top
            };
            debug_assert!(self.last_out_row <= out_height);
        }
        self.last_row = row;
        debug_assert!(self.last_row <= self.height);
    }

    /// 32-bit alpha fallback: run the transforms, then keep only the green
    /// channel.
    fn extract_alpha_rows(&mut self, row: usize, output: &mut [u8]) {
        let num_rows = row.saturating_sub(self.last_row);
        if num_rows == 0 {
            return;
        }
        self.apply_inverse_transforms(self.last_row, row);
        let width = self.io.width;
        let base = self.scratch_base;
        let dst = &mut output[width * self.last_row..width * row];
        for (d, s) in dst.iter_mut().zip(self.scratch[base..base + width * num_rows].iter()) {
            *d = (s >> 8) as u8;
        }
        self.last_row = row;
        self.last_out_row = row;
    }

    fn extract_paletted_alpha_rows(&mut self, row: usize, output: &mut [u8]) {
        let num_rows = row.saturating_sub(self.last_row);
        if num_rows > 0 {
            let width = self.width; // packed width
            let io_width = self.io.width;
            let transform = &self.transforms[0];
            debug_assert_eq!(transform.kind, TransformKind::ColorIndexing);
            let src = &self.pixels8[width * self.last_row..width * row];
            let dst = &mut output[io_width * self.last_row..io_width * row];
            transform.color_index_inverse_alpha(self.last_row, row, src, dst);
        }
        self.last_row = row;
        self.last_out_row = row;
    }

    /// True when every tree group decodes red, blue and alpha from a single
    /// symbol and no color cache is in use.
    pub(crate) fn is_8b_optimizable(&self) -> bool {
        if self.hdr.color_cache_size > 0 {
            return false;
        }
        self.hdr.htree_groups.iter().all(|g| {
            self.hdr.huffman_tables[g.htrees[RED]].bits == 0
                && self.hdr.huffman_tables[g.htrees[BLUE]].bits == 0
                && self.hdr.huffman_tables[g.htrees[ALPHA]].bits == 0
        })
    }
}

fn scaled_dimensions(src_w: usize, src_h: usize, mut dst_w: usize, mut dst_h: usize) -> Option<(usize, usize)> {
    if dst_w == 0 && src_h > 0 {
        dst_w = (src_w * dst_h + src_h - 1) / src_h;
    }
    if dst_h == 0 && src_w > 0 {
        dst_h = (src_h * dst_w + src_w - 1) / src_w;
    }
    if dst_w == 0 || dst_h == 0 {
        None
    } else {
        Some((dst_w, dst_h))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    /// LSB-first bit packer for building synthetic streams.
    pub struct BitWriter {
        bytes: Vec<u8>,
        bit: u32,
    }

    impl BitWriter {
        pub fn new() -> Self {
            BitWriter { bytes: Vec::new(), bit: 0 }
        }

        pub fn put(&mut self, value: u32, n: u32) {
            for i in 0..n {
                if self.bit == 0 {
                    self.bytes.push(0);
                }
                if (value >> i) & 1 != 0 {
                    *self.bytes.last_mut().unwrap() |= 1 << self.bit;
                }
                self.bit = (self.bit + 1) % 8;
            }
        }

        pub fn finish(self) -> Vec<u8> {
            self.bytes
        }
    }

    impl BitWriter {
        /// 5-byte signature for a `width` x `height` stream.
        pub fn signature(&mut self, width: u32, height: u32, has_alpha: bool) {
            self.put(0x2f, 8);
            self.put(width - 1, 14);
            self.put(height - 1, 14);
            self.put(has_alpha as u32, 1);
            self.put(0, 3);
        }

        /// Simple-code tree with one symbol.
        pub fn single_symbol_tree(&mut self, symbol: u32) {
            self.put(1, 1); // simple
            self.put(0, 1); // one symbol
            if symbol < 2 {
                self.put(0, 1); // 1-bit symbol
                self.put(symbol, 1);
            } else {
                self.put(1, 1); // 8-bit symbol
                self.put(symbol, 8);
            }
        }

        /// Simple-code tree with two symbols (first 8-bit, second 8-bit).
        pub fn two_symbol_tree(&mut self, a: u32, b: u32) {
            self.put(1, 1); // simple
            self.put(1, 1); // two symbols
            self.put(1, 1); // first is 8-bit
            self.put(a, 8);
            self.put(b, 8);
        }

        /// No-transform, no-cache, no-meta prologue.
        pub fn bare_prologue(&mut self) {
            self.put(0, 1); // no transforms
            self.put(0, 1); // no color cache
            self.put(0, 1); // no meta-huffman
        }

        /// Trivial red/blue/alpha/distance trees.
        pub fn trivial_tail_trees(&mut self, red: u32, blue: u32, alpha: u32, dist_symbol: u32) {
            self.single_symbol_tree(red);
            self.single_symbol_tree(blue);
            self.single_symbol_tree(alpha);
            self.single_symbol_tree(dist_symbol);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::BitWriter;
    use super::*;
    use crate::{ColorMode, CropRect};

    #[test]
    fn test_check_signature() {
        assert!(check_signature(&[0x2f, 0, 0, 0, 0]));
        assert!(!check_signature(&[0x2f, 0, 0, 0])); // short
        assert!(!check_signature(&[0x30, 0, 0, 0, 0])); // bad magic
        assert!(!check_signature(&[0x2f, 0, 0, 0, 0x20])); // version != 0
    }

    #[test]
    fn test_peek_info() {
        let mut w = BitWriter::new();
        w.signature(100, 60, true);
        let data = w.finish();
        let info = peek_info(&data).unwrap();
        assert_eq!((info.width, info.height, info.has_alpha), (100, 60, true));
    }

    #[test]
    fn test_plane_code_to_distance() {
        // Code 1 -> (y=1, x=0): one row up.
        assert_eq!(plane_code_to_distance(100, 1), 100);
        // Code 2 -> 0x07: (y=0, x=1): previous pixel.
        assert_eq!(plane_code_to_distance(100, 2), 1);
        // Beyond the table: linear.
        assert_eq!(plane_code_to_distance(100, 121), 1);
        assert_eq!(plane_code_to_distance(100, 200), 80);
        // Code 80 -> 0x1f: (y=1, x=-7); tiny widths clamp the result to 1.
        assert_eq!(plane_code_to_distance(1, 80), 1);
    }

    #[test]
    fn test_copy_block32_patterns() {
        // dist 1: run of the previous pixel.
        let mut d = vec![7u32, 0, 0, 0, 0];
        copy_block32(&mut d, 1, 1, 4);
        assert_eq!(d, vec![7, 7, 7, 7, 7]);

        // dist 2 with overlap: alternating pattern.
        let mut d = vec![1u32, 2, 0, 0, 0, 0, 0];
        copy_block32(&mut d, 2, 2, 5);
        assert_eq!(d, vec![1, 2, 1, 2, 1, 2, 1]);

        // dist >= length: straight copy.
        let mut d = vec![1u32, 2, 3, 0, 0];
        copy_block32(&mut d, 3, 3, 2);
        assert_eq!(d, vec![1, 2, 3, 1, 2]);

        // generic overlap (dist 3, length 7).
        let mut d = vec![1u32, 2, 3, 0, 0, 0, 0, 0, 0, 0];
        copy_block32(&mut d, 3, 3, 7);
        assert_eq!(d, vec![1, 2, 3, 1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn test_copy_block8_patterns() {
        let mut d = vec![9u8, 0, 0, 0];
        copy_block8(&mut d, 1, 1, 3);
        assert_eq!(d, vec![9, 9, 9, 9]);

        let mut d = vec![1u8, 2, 3, 4, 0, 0, 0, 0, 0, 0];
        copy_block8(&mut d, 4, 4, 6);
        assert_eq!(d, vec![1, 2, 3, 4, 1, 2, 3, 4, 1, 2]);
    }

    fn decode_rgba(data: &[u8], mode: ColorMode, w: usize, h: usize) -> Vec<u8> {
        let mut dec = Vp8lDecoder::new();
        let info = dec.read_header(data).expect("header");
        assert_eq!((info.width, info.height), (w, h));
        let bpp = mode.bytes_per_pixel();
        let mut buf = vec![0u8; w * h * bpp];
        let mut out = OutputBuffer::Rgba { mode, data: &mut buf, stride: w * bpp };
        let status = dec.decode_image(data, &mut out, &DecodeOptions::default()).expect("decode");
        assert_eq!(status, DecodeStatus::Complete);
        assert_eq!(dec.last_decoded_row(), h);
        buf
    }

    /// 1x1 opaque red, trivial trees everywhere.
    fn red_pixel_stream() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.signature(1, 1, false);
        w.bare_prologue();
        w.single_symbol_tree(0); // green
        w.trivial_tail_trees(255, 0, 255, 0);
        w.finish()
    }

    #[test]
    fn test_decode_single_red_pixel() {
        let data = red_pixel_stream();
        let bgra = decode_rgba(&data, ColorMode::Bgra, 1, 1);
        assert_eq!(bgra, vec![0x00, 0x00, 0xff, 0xff]);
        let rgba = decode_rgba(&data, ColorMode::Rgba, 1, 1);
        assert_eq!(rgba, vec![0xff, 0x00, 0x00, 0xff]);
    }

    #[test]
    fn test_decode_checkerboard_subtract_green() {
        let mut w = BitWriter::new();
        w.signature(2, 2, false);
        w.put(1, 1); // transform present
        w.put(2, 2); // subtract-green
        w.put(0, 1); // no more transforms
        w.put(0, 1); // no cache
        w.put(0, 1); // no meta
        w.two_symbol_tree(0, 255); // green: codes 0 -> 0, 255 -> 1
        w.trivial_tail_trees(0, 0, 255, 0);
        // Greens 0,255,255,0.
        w.put(0, 1);
        w.put(1, 1);
        w.put(1, 1);
        w.put(0, 1);
        let data = w.finish();
        let bgra = decode_rgba(&data, ColorMode::Bgra, 2, 2);
        assert_eq!(
            bgra,
            vec![
                0x00, 0x00, 0x00, 0xff, // black
                0xff, 0xff, 0xff, 0xff, // white
                0xff, 0xff, 0xff, 0xff, // white
                0x00, 0x00, 0x00, 0xff, // black
            ]
        );
    }

    /// Green tree over symbols {0, 258} via the normal (meta-coded) wire
    /// format; literal black then a length-3 back-reference at distance 1.
    fn backref_stream() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.signature(4, 1, false);
        w.bare_prologue();
        // Normal code for green.
        w.put(0, 1); // not simple
        w.put(0, 4); // 4 code-length codes: order 17,18,0,1
        w.put(0, 3); // len(17) = 0
        w.put(1, 3); // len(18) = 1
        w.put(0, 3); // len(0) = 0
        w.put(1, 3); // len(1) = 1
        w.put(0, 1); // no max-symbol cap
        // Code-length symbols: 1 -> bit 0, 18 -> bit 1.
        w.put(0, 1); // symbol 0: length 1
        w.put(1, 1); // 18: run of zeros
        w.put(127, 7); // 138 zeros (symbols 1..138)
        w.put(1, 1); // 18 again
        w.put(108, 7); // 119 zeros (symbols 139..257)
        w.put(0, 1); // symbol 258: length 1
        w.put(1, 1); // 18: tail zeros
        w.put(10, 7); // 21 zeros (symbols 259..279)
        w.trivial_tail_trees(0, 0, 255, 1); // dist symbol 1 -> distance 1
        // Entropy: literal green 0 (code 0), then symbol 258 (code 1).
        w.put(0, 1);
        w.put(1, 1);
        w.finish()
    }

    #[test]
    fn test_decode_backreference_run() {
        let data = backref_stream();
        let bgra = decode_rgba(&data, ColorMode::Bgra, 4, 1);
        let black = [0x00u8, 0x00, 0x00, 0xff];
        let expect: Vec<u8> = black.iter().cycle().take(16).copied().collect();
        assert_eq!(bgra, expect);
    }

    #[test]
    fn test_color_cache_bits_out_of_range() {
        let mut w = BitWriter::new();
        w.signature(1, 1, false);
        w.put(0, 1); // no transforms
        w.put(1, 1); // cache present
        w.put(15, 4); // cache bits = 15 > 11
        let data = w.finish();
        let mut dec = Vp8lDecoder::new();
        assert!(matches!(dec.read_header(&data), Err(Vp8lError::Bitstream)));
        assert_eq!(dec.last_decoded_row(), 0);
    }

    #[test]
    fn test_truncated_after_signature() {
        let mut w = BitWriter::new();
        w.signature(8, 8, false);
        let data = w.finish();
        let mut dec = Vp8lDecoder::new();
        assert!(matches!(dec.read_header(&data), Err(Vp8lError::Bitstream)));
    }

    #[test]
    fn test_repeated_transform_rejected() {
        let mut w = BitWriter::new();
        w.signature(2, 2, false);
        w.put(1, 1);
        w.put(2, 2); // subtract-green
        w.put(1, 1);
        w.put(2, 2); // subtract-green again
        let data = w.finish();
        let mut dec = Vp8lDecoder::new();
        assert!(matches!(dec.read_header(&data), Err(Vp8lError::Bitstream)));
    }

    /// Tall two-symbol-literal image (1 bit per pixel) so the entropy
    /// payload spans many bytes; used by the incremental tests.
    fn tall_stream(width: u32, height: u32) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.signature(width, height, false);
        w.bare_prologue();
        w.two_symbol_tree(10, 200);
        w.trivial_tail_trees(0, 0, 255, 0);
        for y in 0..height {
            for x in 0..width {
                w.put((x + y) & 1, 1);
            }
        }
        w.finish()
    }

    #[test]
    fn test_incremental_suspend_and_resume() {
        let data = tall_stream(16, 32);
        let opts = DecodeOptions { incremental: true, ..Default::default() };

        // One-shot reference decode.
        let full = decode_rgba(&data, ColorMode::Rgba, 16, 32);

        let mut dec = Vp8lDecoder::new();
        let cut = data.len() - 24; // drop the tail of the entropy data
        dec.read_header(&data[..cut]).unwrap();
        let mut buf = vec![0u8; 16 * 32 * 4];
        let status = {
            let mut out = OutputBuffer::Rgba { mode: ColorMode::Rgba, data: &mut buf, stride: 64 };
            dec.decode_image(&data[..cut], &mut out, &opts).unwrap()
        };
        assert_eq!(status, DecodeStatus::Suspended);
        let partial = dec.last_decoded_row();
        assert!(partial > 0 && partial < 32);
        assert_eq!(partial % NUM_ARGB_CACHE_ROWS, 0);

        // Emitted prefix must already match the one-shot decode.
        assert_eq!(&buf[..partial * 64], &full[..partial * 64]);

        let status = {
            let mut out = OutputBuffer::Rgba { mode: ColorMode::Rgba, data: &mut buf, stride: 64 };
            dec.decode_image(&data, &mut out, &opts).unwrap()
        };
        assert_eq!(status, DecodeStatus::Complete);
        assert_eq!(dec.last_decoded_row(), 32);
        assert_eq!(buf, full);
    }

    #[test]
    fn test_incremental_byte_by_byte_matches_one_shot() {
        let data = tall_stream(8, 24);
        let full = decode_rgba(&data, ColorMode::Rgba, 8, 24);
        let opts = DecodeOptions { incremental: true, ..Default::default() };

        // The fixed prologue and trees take 85 bits; start just past them.
        let mut k = 15;
        let mut dec = Vp8lDecoder::new();
        dec.read_header(&data[..k]).unwrap();
        let mut buf = vec![0u8; 8 * 24 * 4];
        let mut prev_row = 0;
        loop {
            let status = {
                let mut out = OutputBuffer::Rgba { mode: ColorMode::Rgba, data: &mut buf, stride: 32 };
                dec.decode_image(&data[..k], &mut out, &opts).unwrap()
            };
            // Rows only ever move forward.
            assert!(dec.last_decoded_row() >= prev_row);
            prev_row = dec.last_decoded_row();
            match status {
                DecodeStatus::Complete => break,
                DecodeStatus::Suspended => {
                    k += 1;
                    assert!(k <= data.len());
                }
            }
        }
        assert_eq!(buf, full);
    }

    #[test]
    fn test_crop_window_output() {
        let data = tall_stream(16, 32);
        let full = decode_rgba(&data, ColorMode::Rgba, 16, 32);

        let mut dec = Vp8lDecoder::new();
        dec.read_header(&data).unwrap();
        let opts = DecodeOptions {
            crop: Some(CropRect { left: 4, top: 8, width: 8, height: 16 }),
            ..Default::default()
        };
        let mut buf = vec![0u8; 8 * 16 * 4];
        let mut out = OutputBuffer::Rgba { mode: ColorMode::Rgba, data: &mut buf, stride: 32 };
        let status = dec.decode_image(&data, &mut out, &opts).unwrap();
        assert_eq!(status, DecodeStatus::Complete);
        for y in 0..16 {
            let got = &buf[y * 32..(y + 1) * 32];
            let want = &full[((y + 8) * 16 + 4) * 4..][..32];
            assert_eq!(got, want, "row {}", y);
        }
    }

    #[test]
    fn test_decode_with_color_cache() {
        // 2x1: literal red, then a cache reference to it. The green alphabet
        // is 256 + 24 + 2; cache key 0 is symbol 280.
        let mut w = BitWriter::new();
        w.signature(2, 1, false);
        w.put(0, 1); // no transforms
        w.put(1, 1); // cache present
        w.put(1, 4); // cache bits = 1 (2 slots)
        w.put(0, 1); // no meta
        w.put(0, 1); // not simple
        w.put(0, 4); // 4 cl codes: order 17,18,0,1
        w.put(0, 3); // len(17) = 0
        w.put(1, 3); // len(18) = 1
        w.put(2, 3); // len(0) = 2
        w.put(2, 3); // len(1) = 2
        w.put(0, 1); // no max-symbol cap
        // Code-length codes: 18 -> 0; 0 -> 10 (emit reversed: 01); 1 -> 11.
        w.put(3, 2); // symbol 0: length 1
        w.put(0, 1);
        w.put(127, 7); // 138 zeros
        w.put(0, 1);
        w.put(119, 7); // 130 zeros
        w.put(0, 1);
        w.put(0, 7); // 11 zeros, through symbol 279
        w.put(3, 2); // symbol 280: length 1
        w.put(1, 2); // symbol 281: length 0
        w.trivial_tail_trees(255, 0, 255, 0);
        // Entropy: literal green 0 (red pixel), then cache key 0.
        w.put(0, 1);
        w.put(1, 1);
        let data = w.finish();
        // Pixel = 0xffff0000; hash key = (0xffff0000 * 0x1e35a7bd) >> 31.
        let key = (0xffff_0000u32.wrapping_mul(0x1e35_a7bd) >> 31) as usize;
        assert_eq!(key, 0, "test stream assumes the red pixel hashes to slot 0");
        let rgba = decode_rgba(&data, ColorMode::Rgba, 2, 1);
        assert_eq!(rgba, vec![0xff, 0, 0, 0xff, 0xff, 0, 0, 0xff]);
    }

    #[test]
    fn test_meta_huffman_tile_dispatch() {
        // 8x8 with 2-bit tiles: a 2x2 meta image selects group 0 (black
        // literals) for the left tiles and group 1 (green literals) for the
        // right ones. All literal trees are single-symbol, so the payload
        // itself needs no bits.
        let mut w = BitWriter::new();
        w.signature(8, 8, false);
        w.put(0, 1); // no transforms
        w.put(0, 1); // no color cache
        w.put(1, 1); // meta-huffman present
        w.put(0, 3); // huffman bits = 2
        // Meta image sub-stream (2x2): group index lives in the green byte.
        w.put(0, 1); // no color cache
        w.two_symbol_tree(0, 1);
        w.trivial_tail_trees(0, 0, 0, 0);
        w.put(0, 1); // tile (0,0) -> group 0
        w.put(1, 1); // tile (1,0) -> group 1
        w.put(0, 1); // tile (0,1) -> group 0
        w.put(1, 1); // tile (1,1) -> group 1
        // Group 0: black literals.
        w.single_symbol_tree(0);
        w.trivial_tail_trees(0, 0, 255, 0);
        // Group 1: green literals.
        w.single_symbol_tree(255);
        w.trivial_tail_trees(0, 0, 255, 0);
        let data = w.finish();
        let rgba = decode_rgba(&data, ColorMode::Rgba, 8, 8);
        for y in 0..8 {
            for x in 0..8 {
                let px = &rgba[(y * 8 + x) * 4..][..4];
                let want: [u8; 4] = if x < 4 { [0, 0, 0, 255] } else { [0, 255, 0, 255] };
                assert_eq!(px, want, "({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_max_color_cache_bits_accepted() {
        // cache bits = 11 sizes the largest Huffman block; the cache itself
        // goes unreferenced here.
        let mut w = BitWriter::new();
        w.signature(1, 1, false);
        w.put(0, 1); // no transforms
        w.put(1, 1); // cache present
        w.put(11, 4); // cache bits = 11
        w.put(0, 1); // no meta
        w.single_symbol_tree(0);
        w.trivial_tail_trees(0, 0, 255, 0);
        let data = w.finish();
        let bgra = decode_rgba(&data, ColorMode::Bgra, 1, 1);
        assert_eq!(bgra, vec![0x00, 0x00, 0x00, 0xff]);
    }

    #[test]
    fn test_scaled_output_dimensions() {
        let data = tall_stream(16, 32);
        let mut dec = Vp8lDecoder::new();
        dec.read_header(&data).unwrap();
        let opts = DecodeOptions { scaled: Some((8, 16)), ..Default::default() };
        let mut buf = vec![0u8; 8 * 16 * 4];
        let mut out = OutputBuffer::Rgba { mode: ColorMode::Rgba, data: &mut buf, stride: 32 };
        let status = dec.decode_image(&data, &mut out, &opts).unwrap();
        assert_eq!(status, DecodeStatus::Complete);
        assert_eq!(dec.last_decoded_row(), 16);
        // The source alternates 10/200 per pixel in both directions; any
        // 2x2 box average lands mid-way.
        let g = buf[1];
        assert!((100..=110).contains(&g), "got {}", g);
    }
}
