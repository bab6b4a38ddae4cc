//! Row rescaler
//!
//! Two-phase (horizontal, then vertical) linear filter in 32-bit fixed
//! point. Rows of BGRA pixels are imported one at a time; whenever the
//! vertical accumulator crosses an output-row boundary the scaler has a
//! finished row pending for export. Works per byte channel, so the same
//! kernels shrink and expand every plane of a packed pixel.

const RFIX: u32 = 32;
const ONE: u64 = 1u64 << RFIX;
const NUM_CHANNELS: usize = 4;

#[inline]
fn mult_fix(x: u32, y: u32) -> u32 {
    (((x as u64) * (y as u64) + (1u64 << (RFIX - 1))) >> RFIX) as u32
}

#[inline]
fn mult_fix_floor(x: u32, y: u32) -> u32 {
    (((x as u64) * (y as u64)) >> RFIX) as u32
}

#[inline]
fn frac(x: u32, y: u32) -> u32 {
    (((x as u64) << RFIX) / (y as u64)) as u32
}

#[inline]
fn channel(px: u32, ch: usize) -> u32 {
    (px >> (8 * ch)) & 0xff
}

#[inline]
fn set_channel(px: &mut u32, ch: usize, v: u32) {
    *px = (*px & !(0xffu32 << (8 * ch))) | (v << (8 * ch));
}

#[derive(Debug)]
pub struct Rescaler {
    x_expand: bool,
    y_expand: bool,
    x_add: i32,
    x_sub: i32,
    y_add: i32,
    y_sub: i32,
    y_accum: i32,
    fx_scale: u32,
    fy_scale: u32,
    fxy_scale: u32,
    src_width: usize,
    dst_width: usize,
    dst_height: usize,
    dst_y: usize,
    frow: Vec<u32>,
    irow: Vec<u32>,
    dst_row: Vec<u32>,
}

impl Rescaler {
    pub fn new(src_width: usize, src_height: usize, dst_width: usize, dst_height: usize) -> Self {
        let x_expand = src_width < dst_width;
        let y_expand = src_height < dst_height;
        let x_add = if x_expand { dst_width as i32 - 1 } else { src_width as i32 };
        let x_sub = if x_expand { src_width as i32 - 1 } else { dst_width as i32 };
        let y_add = if y_expand { src_height as i32 - 1 } else { src_height as i32 };
        let y_sub = if y_expand { dst_height as i32 - 1 } else { dst_height as i32 };
        let fx_scale = if x_expand { 0 } else { frac(1, x_sub as u32) };
        let (fy_scale, fxy_scale) = if y_expand {
            // frac(1, 1) wraps to 0 in the fixed point; the expand export
            // reads 0 as an identity scale.
            (frac(1, x_add as u32), 0)
        } else {
            let ratio = ((dst_height as u64) << RFIX) / (x_add as u64 * y_add as u64);
            (frac(1, y_sub as u32), ratio as u32)
        };
        let work = vec![0u32; NUM_CHANNELS * dst_width];
        Rescaler {
            x_expand,
            y_expand,
            x_add,
            x_sub,
            y_add,
            y_sub,
            y_accum: if y_expand { y_sub } else { y_add },
            fx_scale,
            fy_scale,
            fxy_scale,
            src_width,
            dst_width,
            dst_height,
            dst_y: 0,
            frow: work.clone(),
            irow: work,
            dst_row: vec![0u32; dst_width],
        }
    }

    pub fn has_pending_output(&self) -> bool {
        self.y_accum <= 0 && self.dst_y < self.dst_height
    }

    /// Input rows to feed before the next output row becomes available,
    /// capped at `max_lines`.
    pub fn needed_lines(&self, max_lines: usize) -> usize {
        let num = (self.y_accum + self.y_sub - 1) / self.y_sub;
        (num.max(0) as usize).min(max_lines)
    }

    /// Feed up to `num_lines` rows (stride in pixels), stopping early once an
    /// output row is pending. Returns the number of rows consumed.
    pub fn import(&mut self, rows: &[u32], num_lines: usize, stride: usize) -> usize {
        let mut imported = 0;
        while imported < num_lines && !self.has_pending_output() {
            if self.y_expand {
                std::mem::swap(&mut self.irow, &mut self.frow);
            }
            let row = &rows[imported * stride..imported * stride + self.src_width];
            if self.x_expand {
                self.import_row_expand(row);
            } else {
                self.import_row_shrink(row);
            }
            if !self.y_expand {
                for (i, f) in self.irow.iter_mut().zip(self.frow.iter()) {
                    *i = i.wrapping_add(*f);
                }
            }
            self.y_accum -= self.y_sub;
            imported += 1;
        }
        imported
    }

    fn import_row_expand(&mut self, row: &[u32]) {
        let x_out_max = self.dst_width * NUM_CHANNELS;
        for ch in 0..NUM_CHANNELS {
            let mut x_in = 0usize;
            let mut x_out = ch;
            let mut accum = self.x_add;
            let mut left = channel(row[0], ch) as i32;
            let mut right = if self.src_width > 1 { channel(row[1], ch) as i32 } else { left };
            x_in += 1;
            loop {
                self.frow[x_out] = (right * self.x_add + (left - right) * accum) as u32;
                x_out += NUM_CHANNELS;
                if x_out >= x_out_max {
                    break;
                }
                accum -= self.x_sub;
                if accum < 0 {
                    left = right;
                    x_in += 1;
                    right = channel(row[x_in], ch) as i32;
                    accum += self.x_add;
                }
            }
        }
    }

    fn import_row_shrink(&mut self, row: &[u32]) {
        let x_out_max = self.dst_width * NUM_CHANNELS;
        for ch in 0..NUM_CHANNELS {
            let mut x_in = 0usize;
            let mut x_out = ch;
            let mut sum = 0u32;
            let mut accum = 0i32;
            while x_out < x_out_max {
                let mut base = 0u32;
                accum += self.x_add;
                while accum > 0 {
                    accum -= self.x_sub;
                    base = channel(row[x_in], ch);
                    sum = sum.wrapping_add(base);
                    x_in += 1;
                }
                let fraction = base.wrapping_mul((-accum) as u32);
                self.frow[x_out] = sum.wrapping_mul(self.x_sub as u32).wrapping_sub(fraction);
                sum = mult_fix(fraction, self.fx_scale);
                x_out += NUM_CHANNELS;
            }
        }
    }

    /// Export the pending output row; the returned slice holds `dst_width`
    /// BGRA pixels and stays valid until the next call.
    pub fn export_row(&mut self) -> &mut [u32] {
        debug_assert!(self.has_pending_output());
        if self.y_expand {
            self.export_row_expand();
        } else {
            self.export_row_shrink();
        }
        self.y_accum += self.y_add;
        self.dst_y += 1;
        &mut self.dst_row
    }

    // `fy_scale` holds frac(1, x_add); a ratio of exactly one does not fit
    // the fixed point and comes out as 0, which stands for identity here.
    #[inline]
    fn y_expand_scale(&self, v: u32) -> u32 {
        if self.fy_scale == 0 {
            v
        } else {
            mult_fix(v, self.fy_scale)
        }
    }

    fn export_row_expand(&mut self) {
        let x_out_max = self.dst_width * NUM_CHANNELS;
        if self.y_accum == 0 {
            for x_out in 0..x_out_max {
                let v = self.y_expand_scale(self.frow[x_out]);
                set_channel(&mut self.dst_row[x_out / 4], x_out & 3, v.min(255));
            }
        } else {
            let b = frac((-self.y_accum) as u32, self.y_sub as u32);
            let a = (ONE - b as u64) as u32;
            for x_out in 0..x_out_max {
                let i = (a as u64) * (self.frow[x_out] as u64) + (b as u64) * (self.irow[x_out] as u64);
                let j = ((i + (1u64 << (RFIX - 1))) >> RFIX) as u32;
                let v = self.y_expand_scale(j);
                set_channel(&mut self.dst_row[x_out / 4], x_out & 3, v.min(255));
            }
        }
    }

    fn export_row_shrink(&mut self) {
        let x_out_max = self.dst_width * NUM_CHANNELS;
        let yscale = self.fy_scale.wrapping_mul((-self.y_accum) as u32);
        if yscale != 0 {
            for x_out in 0..x_out_max {
                let fraction = mult_fix_floor(self.frow[x_out], yscale);
                let v = mult_fix(self.irow[x_out].wrapping_sub(fraction), self.fxy_scale);
                set_channel(&mut self.dst_row[x_out / 4], x_out & 3, v.min(255));
                self.irow[x_out] = fraction; // fractional start of the next row
            }
        } else {
            for x_out in 0..x_out_max {
                let v = mult_fix(self.irow[x_out], self.fxy_scale);
                set_channel(&mut self.dst_row[x_out / 4], x_out & 3, v.min(255));
                self.irow[x_out] = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(v: u32) -> u32 {
        0xff00_0000 | (v << 16) | (v << 8) | v
    }

    fn run(src: &[u32], sw: usize, sh: usize, dw: usize, dh: usize) -> Vec<u32> {
        let mut r = Rescaler::new(sw, sh, dw, dh);
        let mut out = Vec::new();
        let mut fed = 0;
        while fed < sh {
            let n = r.needed_lines(sh - fed);
            let used = r.import(&src[fed * sw..], n, sw);
            assert_eq!(used, n);
            fed += used;
            while r.has_pending_output() {
                out.extend_from_slice(r.export_row());
            }
        }
        out
    }

    #[test]
    fn test_downscale_2x_averages() {
        // 4x4 of uniform 100 -> 2x2 of 100.
        let src = vec![gray(100); 16];
        let out = run(&src, 4, 4, 2, 2);
        assert_eq!(out.len(), 4);
        for px in out {
            assert_eq!(px, gray(100));
        }
    }

    #[test]
    fn test_downscale_mixes_rows() {
        // Two rows 0 and 200 shrink to one row of the average.
        let mut src = vec![gray(0); 2];
        src.extend_from_slice(&[gray(200), gray(200)]);
        let out = run(&src, 2, 2, 1, 1);
        assert_eq!(out.len(), 1);
        let v = channel(out[0], 1);
        assert!((99..=101).contains(&v), "got {}", v);
    }

    #[test]
    fn test_upscale_interpolates() {
        // 2x1 black/white widens to 4x1; interior pixels are blends.
        let src = vec![gray(0), gray(255)];
        let out = run(&src, 2, 1, 4, 1);
        assert_eq!(out.len(), 4);
        assert_eq!(channel(out[0], 0), 0);
        assert_eq!(channel(out[3], 0), 255);
        let a = channel(out[1], 0);
        let b = channel(out[2], 0);
        assert!(a > 0 && a < b && b < 255, "gradient, got {} {}", a, b);
    }

    #[test]
    fn test_vertical_upscale_single_column() {
        // 1-pixel-wide column doubled vertically: the horizontal pass is an
        // identity (x_add == 1) and must not zero the output.
        let src = vec![gray(100), gray(200)];
        let out = run(&src, 1, 2, 1, 4);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], gray(100));
        assert_eq!(out[1], gray(133));
        assert_eq!(out[2], gray(167));
        assert_eq!(out[3], gray(200));
    }

    #[test]
    fn test_vertical_upscale_uniform_is_identity() {
        let src = vec![gray(77); 3];
        let out = run(&src, 1, 3, 1, 6);
        assert_eq!(out.len(), 6);
        for px in out {
            assert_eq!(px, gray(77));
        }
    }

    #[test]
    fn test_output_row_count_matches() {
        let src = vec![gray(42); 7 * 5];
        let out = run(&src, 7, 5, 3, 4);
        assert_eq!(out.len(), 3 * 4);
    }
}
