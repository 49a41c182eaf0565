//! Fragmented MP4 muxing into memory.
//!
//! The mp4 muxer writes through a custom AVIO context whose callback hands every
//! flushed chunk to a [`FragmentRouter`]. The router tells initialization data
//! (`ftyp` + `moov`) apart from media fragments (`moof`/`sidx`/`styp` and the
//! `mdat` that follows) and forwards both to a [`SegmentSink`].

use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use ffmpeg_next::Dictionary;

use crate::{
    output::{Container, Muxer},
    packet::CodedPacket,
    params::StreamParameters,
};

/// AVIO buffer size. Large enough that a whole fragment reaches the callback in
/// one piece at typical bitrates.
const IO_BUFFER_SIZE: usize = 16 * 1024 * 1024;

const MOVFLAGS: &str = "empty_moov+dash+default_base_moof+frag_keyframe";

/// Receiver of muxed fMP4 data.
pub trait SegmentSink: Send + Sync {
    /// A complete initialization segment. Replaces any previous one.
    fn init_segment(&self, segment: Bytes);
    /// One media chunk, ready to be pushed to every viewer as is.
    fn media_segment(&self, segment: Bytes);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkKind {
    Init,
    Media,
}

/// Type of the box starting at `chunk[0]`, if the chunk is long enough to have one.
fn box_type(chunk: &[u8]) -> Option<&[u8]> {
    chunk.get(4..8)
}

/// Whether any top-level box in `chunk` has type `kind`.
fn contains_box(chunk: &[u8], kind: &[u8]) -> bool {
    let mut offset = 0usize;
    while offset + 8 <= chunk.len() {
        if &chunk[offset + 4..offset + 8] == kind {
            return true;
        }
        let size = u32::from_be_bytes([
            chunk[offset],
            chunk[offset + 1],
            chunk[offset + 2],
            chunk[offset + 3],
        ]) as u64;
        let size = match size {
            0 => return false,
            1 if offset + 16 <= chunk.len() => {
                let mut large = [0u8; 8];
                large.copy_from_slice(&chunk[offset + 8..offset + 16]);
                u64::from_be_bytes(large)
            }
            s => s,
        };
        if size < 8 {
            return false;
        }
        offset = match usize::try_from(size).ok().and_then(|s| offset.checked_add(s)) {
            Some(next) => next,
            None => return false,
        };
    }
    false
}

/// Splits muxer output into initialization and media segments.
pub struct FragmentRouter {
    sink: Arc<dyn SegmentSink>,
    init: BytesMut,
    init_complete: bool,
    last: Option<ChunkKind>,
}

impl FragmentRouter {
    pub fn new(sink: Arc<dyn SegmentSink>) -> Self {
        Self {
            sink,
            init: BytesMut::new(),
            init_complete: false,
            last: None,
        }
    }

    pub fn route(&mut self, chunk: &[u8]) {
        if chunk.len() < 8 {
            log::debug!(target: "output", "short fragment of {} bytes", chunk.len());
        }
        match box_type(chunk) {
            Some(b"ftyp") => {
                self.init.clear();
                self.init.extend_from_slice(chunk);
                self.init_complete = false;
                self.last = Some(ChunkKind::Init);
                if contains_box(chunk, b"moov") {
                    self.publish_init();
                }
            }
            Some(b"moov") => {
                self.init.extend_from_slice(chunk);
                self.last = Some(ChunkKind::Init);
                self.publish_init();
            }
            Some(b"moof") | Some(b"sidx") | Some(b"styp") => {
                self.last = Some(ChunkKind::Media);
                self.sink.media_segment(Bytes::copy_from_slice(chunk));
            }
            _ => match self.last {
                Some(ChunkKind::Media) => self.sink.media_segment(Bytes::copy_from_slice(chunk)),
                Some(ChunkKind::Init) => {
                    self.init.extend_from_slice(chunk);
                    if self.init_complete {
                        self.publish_init();
                    }
                }
                None => {
                    log::warn!(target: "output", "unsupported fragment type received, {} bytes dropped", chunk.len());
                }
            },
        }
    }

    fn publish_init(&mut self) {
        self.init_complete = true;
        self.sink.init_segment(Bytes::copy_from_slice(&self.init));
    }
}

type WritePacketFn = unsafe extern "C" fn(*mut c_void, *const u8, c_int) -> c_int;

unsafe extern "C" fn write_packet(opaque: *mut c_void, buf: *const u8, size: c_int) -> c_int {
    if opaque.is_null() || buf.is_null() || size <= 0 {
        return size.max(0);
    }
    let router = unsafe { &mut *(opaque as *mut FragmentRouter) };
    router.route(unsafe { std::slice::from_raw_parts(buf, size as usize) });
    size
}

/// Custom AVIO context plus the router its callback writes into.
struct CustomIo {
    context: *mut ffmpeg_next::ffi::AVIOContext,
    router: *mut FragmentRouter,
}

impl CustomIo {
    fn new(sink: Arc<dyn SegmentSink>) -> anyhow::Result<Self> {
        let router = Box::into_raw(Box::new(FragmentRouter::new(sink)));
        unsafe {
            let buffer = ffmpeg_next::ffi::av_malloc(IO_BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                drop(Box::from_raw(router));
                anyhow::bail!("failed to allocate avio buffer");
            }
            // the constness of `buf` differs between FFmpeg versions
            let callback = std::mem::transmute::<WritePacketFn, _>(write_packet as WritePacketFn);
            let context = ffmpeg_next::ffi::avio_alloc_context(
                buffer,
                IO_BUFFER_SIZE as c_int,
                1,
                router as *mut c_void,
                None,
                Some(callback),
                None,
            );
            if context.is_null() {
                ffmpeg_next::ffi::av_free(buffer as *mut c_void);
                drop(Box::from_raw(router));
                anyhow::bail!("failed to allocate avio context");
            }
            Ok(Self { context, router })
        }
    }
}

impl Drop for CustomIo {
    fn drop(&mut self) {
        unsafe {
            if !self.context.is_null() {
                ffmpeg_next::ffi::av_freep(&mut (*self.context).buffer as *mut *mut u8 as *mut c_void);
                ffmpeg_next::ffi::avio_context_free(&mut self.context);
            }
            if !self.router.is_null() {
                drop(Box::from_raw(self.router));
                self.router = ptr::null_mut();
            }
        }
    }
}

/// Muxer producing fragmented MP4 for the WebSocket fan-out.
pub struct FragmentedOutput {
    sink: Arc<dyn SegmentSink>,
    container: Option<Container>,
    io: Option<CustomIo>,
}

unsafe impl Send for FragmentedOutput {}

impl FragmentedOutput {
    pub fn new(sink: Arc<dyn SegmentSink>) -> Self {
        Self {
            sink,
            container: None,
            io: None,
        }
    }
}

impl Muxer for FragmentedOutput {
    fn open(&mut self, params: &StreamParameters) -> anyhow::Result<()> {
        self.close()?;

        let io = CustomIo::new(Arc::clone(&self.sink))?;
        let output = unsafe {
            let mut ctx: *mut ffmpeg_next::ffi::AVFormatContext = ptr::null_mut();
            let ret = ffmpeg_next::ffi::avformat_alloc_output_context2(
                &mut ctx,
                ptr::null_mut(),
                c"mp4".as_ptr(),
                ptr::null(),
            );
            if ret < 0 || ctx.is_null() {
                anyhow::bail!("failed to allocate mp4 output context: {}", ffmpeg_next::Error::from(ret));
            }
            (*ctx).pb = io.context;
            (*ctx).flags |= ffmpeg_next::ffi::AVFMT_FLAG_CUSTOM_IO as c_int;
            ffmpeg_next::format::context::Output::wrap(ctx)
        };
        // dropped in this order by close(): container first, io second
        self.io = Some(io);
        self.container = Some(Container::new(output));
        let added = match self.container.as_mut() {
            Some(container) => container.add_stream(params),
            None => Ok(()),
        };
        if let Err(e) = added {
            self.close()?;
            return Err(e);
        }
        Ok(())
    }

    fn write_header(&mut self, params: &StreamParameters) -> anyhow::Result<()> {
        let Some(container) = self.container.as_mut() else {
            anyhow::bail!("fragmented output is not open");
        };
        let mut opts = Dictionary::new();
        opts.set("movflags", MOVFLAGS);
        container.write_header(params, opts)
    }

    fn write_packet(&mut self, packet: &CodedPacket) -> anyhow::Result<()> {
        match self.container.as_mut() {
            Some(container) => container.write_packet(packet),
            None => Err(anyhow::anyhow!("fragmented output is not open")),
        }
    }

    fn close(&mut self) -> anyhow::Result<()> {
        let mut result = Ok(());
        if let Some(mut container) = self.container.take() {
            result = container.finish();
            // the format context must not close the custom io
            unsafe {
                (*container.output_mut().as_mut_ptr()).pb = ptr::null_mut();
            }
            drop(container);
        }
        self.io = None;
        result
    }
}

impl Drop for FragmentedOutput {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!(target: "output", "close fragmented output: {}", e);
        }
    }
}
