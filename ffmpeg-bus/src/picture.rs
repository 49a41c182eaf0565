//! Planar 4:2:0 pictures shared between capture, sync buffers and the compositor.

use std::sync::Arc;

use ffmpeg_next::format::Pixel;

/// Black in limited-range YUV.
pub const BLANK_LUMA: u8 = 16;
pub const BLANK_CHROMA: u8 = 128;

pub type PictureRef = Arc<Picture>;

#[derive(Clone, Debug)]
pub struct Plane {
    data: Vec<u8>,
    stride: usize,
    width: usize,
    height: usize,
}

impl Plane {
    fn new(width: usize, height: usize) -> Self {
        Self {
            data: vec![0; width * height],
            stride: width,
            width,
            height,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn row(&self, y: usize) -> &[u8] {
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        let start = y * self.stride;
        &mut self.data[start..start + self.width]
    }

    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
    }

    /// Copies `src` with its top-left corner at (`x`, `y`). Caller checks bounds.
    fn copy_from(&mut self, src: &Plane, x: usize, y: usize) {
        for row in 0..src.height {
            let dst = &mut self.row_mut(y + row)[x..x + src.width];
            dst.copy_from_slice(src.row(row));
        }
    }

    fn copy_from_raw(&mut self, data: &[u8], stride: usize) {
        for row in 0..self.height {
            let start = row * stride;
            let width = self.width;
            self.row_mut(row)
                .copy_from_slice(&data[start..start + width]);
        }
    }

    fn copy_to_raw(&self, data: &mut [u8], stride: usize) {
        for row in 0..self.height {
            let start = row * stride;
            data[start..start + self.width].copy_from_slice(self.row(row));
        }
    }
}

/// One decoded YUV420P frame. Timestamps are in the pipeline time unit
/// (`ffmpeg_next::util::mathematics::rescale::TIME_BASE`, microseconds).
#[derive(Clone, Debug)]
pub struct Picture {
    width: u32,
    height: u32,
    planes: [Plane; 3],
    pts: i64,
    dts: i64,
}

impl Picture {
    pub fn new(width: u32, height: u32) -> Self {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        Self {
            width,
            height,
            planes: [Plane::new(w, h), Plane::new(cw, ch), Plane::new(cw, ch)],
            pts: 0,
            dts: 0,
        }
    }

    /// A picture already cleared to black.
    pub fn blank(width: u32, height: u32) -> Self {
        let mut picture = Self::new(width, height);
        picture.clear();
        picture
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pts(&self) -> i64 {
        self.pts
    }

    pub fn dts(&self) -> i64 {
        self.dts
    }

    pub fn set_timestamps(&mut self, pts: i64, dts: i64) {
        self.pts = pts;
        self.dts = dts;
    }

    pub fn plane(&self, index: usize) -> &Plane {
        &self.planes[index]
    }

    pub fn plane_mut(&mut self, index: usize) -> &mut Plane {
        &mut self.planes[index]
    }

    pub fn fill(&mut self, luma: u8, chroma: u8) {
        self.planes[0].fill(luma);
        self.planes[1].fill(chroma);
        self.planes[2].fill(chroma);
    }

    pub fn clear(&mut self) {
        self.fill(BLANK_LUMA, BLANK_CHROMA);
    }

    /// Paints `src` with its top-left luma sample at (`x`, `y`). Chroma lands at
    /// (`x/2`, `y/2`), so both offsets must be even.
    pub fn blit(&mut self, src: &Picture, x: u32, y: u32) -> anyhow::Result<()> {
        if x % 2 != 0 || y % 2 != 0 {
            anyhow::bail!("blit offset ({}, {}) is not chroma aligned", x, y);
        }
        if x + src.width > self.width || y + src.height > self.height {
            anyhow::bail!(
                "{}x{} picture at ({}, {}) does not fit a {}x{} canvas",
                src.width,
                src.height,
                x,
                y,
                self.width,
                self.height
            );
        }
        let (x, y) = (x as usize, y as usize);
        self.planes[0].copy_from(&src.planes[0], x, y);
        self.planes[1].copy_from(&src.planes[1], x / 2, y / 2);
        self.planes[2].copy_from(&src.planes[2], x / 2, y / 2);
        Ok(())
    }

    /// Copies the planes of a YUV420P video frame of the same size.
    pub fn copy_from_video(&mut self, frame: &ffmpeg_next::frame::Video) -> anyhow::Result<()> {
        self.check_video(frame)?;
        for (index, plane) in self.planes.iter_mut().enumerate() {
            plane.copy_from_raw(frame.data(index), frame.stride(index));
        }
        Ok(())
    }

    /// Copies this picture into a writable YUV420P video frame of the same size.
    pub fn copy_to_video(&self, frame: &mut ffmpeg_next::frame::Video) -> anyhow::Result<()> {
        self.check_video(frame)?;
        for (index, plane) in self.planes.iter().enumerate() {
            let stride = frame.stride(index);
            plane.copy_to_raw(frame.data_mut(index), stride);
        }
        Ok(())
    }

    fn check_video(&self, frame: &ffmpeg_next::frame::Video) -> anyhow::Result<()> {
        if frame.format() != Pixel::YUV420P {
            anyhow::bail!("expected yuv420p frame, got {:?}", frame.format());
        }
        if frame.width() != self.width || frame.height() != self.height {
            anyhow::bail!(
                "frame is {}x{}, picture is {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            );
        }
        Ok(())
    }
}

/// Recycles pictures once every other holder has dropped its reference.
pub struct PicturePool {
    width: u32,
    height: u32,
    in_flight: Vec<PictureRef>,
    limit: usize,
}

impl PicturePool {
    /// `limit` bounds how many published pictures are tracked for reuse. It should
    /// exceed the capacity of the buffer the pictures are published into.
    pub fn new(limit: usize) -> Self {
        Self {
            width: 0,
            height: 0,
            in_flight: Vec::with_capacity(limit),
            limit,
        }
    }

    /// Returns a picture of the requested size, reusing one nobody else holds when
    /// possible. Contents are stale and must be overwritten.
    pub fn acquire(&mut self, width: u32, height: u32) -> Picture {
        if width != self.width || height != self.height {
            self.in_flight.clear();
            self.width = width;
            self.height = height;
        }
        if let Some(pos) = self
            .in_flight
            .iter()
            .position(|p| Arc::strong_count(p) == 1)
        {
            let recycled = self.in_flight.swap_remove(pos);
            if let Ok(picture) = Arc::try_unwrap(recycled) {
                return picture;
            }
        }
        Picture::new(width, height)
    }

    /// Wraps `picture` for publication and keeps a handle for later reuse.
    pub fn publish(&mut self, picture: Picture) -> PictureRef {
        let shared = Arc::new(picture);
        if self.in_flight.len() >= self.limit {
            self.in_flight.remove(0);
        }
        self.in_flight.push(Arc::clone(&shared));
        shared
    }

    pub fn tracked(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, luma: u8, chroma: u8) -> Picture {
        let mut p = Picture::new(width, height);
        p.fill(luma, chroma);
        p
    }

    #[test]
    fn test_blank_canvas_is_uniform() {
        let canvas = Picture::blank(64, 32);
        assert!((0..32).all(|y| canvas.plane(0).row(y).iter().all(|&v| v == BLANK_LUMA)));
        for index in 1..3 {
            let plane = canvas.plane(index);
            assert_eq!((plane.width(), plane.height()), (32, 16));
            assert!((0..16).all(|y| plane.row(y).iter().all(|&v| v == BLANK_CHROMA)));
        }
    }

    #[test]
    fn test_blit_places_chroma_at_half_offsets() {
        let mut canvas = Picture::blank(16, 16);
        let src = solid(4, 4, 200, 50);
        canvas.blit(&src, 8, 4).unwrap();

        assert_eq!(canvas.plane(0).row(4)[8..12], [200; 4]);
        assert_eq!(canvas.plane(0).row(4)[7], BLANK_LUMA);
        assert_eq!(canvas.plane(0).row(8)[8], BLANK_LUMA);
        assert_eq!(canvas.plane(1).row(2)[4..6], [50; 2]);
        assert_eq!(canvas.plane(2).row(3)[4..6], [50; 2]);
        assert_eq!(canvas.plane(1).row(4)[4], BLANK_CHROMA);
    }

    #[test]
    fn test_blit_rejects_oversized_and_odd_offsets() {
        let mut canvas = Picture::blank(16, 16);
        assert!(canvas.blit(&solid(20, 4, 1, 1), 0, 0).is_err());
        assert!(canvas.blit(&solid(4, 4, 1, 1), 14, 0).is_err());
        assert!(canvas.blit(&solid(4, 4, 1, 1), 3, 0).is_err());
    }

    #[test]
    fn test_pool_reuses_released_pictures() {
        let mut pool = PicturePool::new(4);
        let picture = pool.acquire(8, 8);
        let first = pool.publish(picture);
        let first_ptr = first.plane(0).row(0).as_ptr();

        // still referenced elsewhere: a fresh picture is handed out
        let second = pool.acquire(8, 8);
        assert_ne!(second.plane(0).row(0).as_ptr(), first_ptr);

        drop(first);
        let reused = pool.acquire(8, 8);
        assert_eq!(reused.plane(0).row(0).as_ptr(), first_ptr);
        assert_eq!(pool.tracked(), 0);
    }

    #[test]
    fn test_pool_forgets_pictures_on_size_change() {
        let mut pool = PicturePool::new(2);
        let mut held = Vec::new();
        for _ in 0..3 {
            let picture = pool.acquire(8, 8);
            held.push(pool.publish(picture));
        }
        assert_eq!(pool.tracked(), 2);
        let resized = pool.acquire(16, 8);
        assert_eq!(resized.width(), 16);
        assert_eq!(pool.tracked(), 0);
    }
}
